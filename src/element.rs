//! Element types
//!
//! Elements are opaque fixed-width values. Each one names the accumulator
//! type its products are summed in, and the narrowing cast applied when an
//! accumulator tile is drained back to memory.

use half::{bf16, f16};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Runtime tag for an element type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    F32,
    F16,
    Bf16,
    I8,
    I32,
}

impl DataType {
    /// Width in bytes
    pub const fn size(&self) -> usize {
        match self {
            DataType::F32 | DataType::I32 => 4,
            DataType::F16 | DataType::Bf16 => 2,
            DataType::I8 => 1,
        }
    }

    /// Accumulator type used when this is the input element
    pub const fn accumulator(&self) -> DataType {
        match self {
            DataType::F32 | DataType::F16 | DataType::Bf16 => DataType::F32,
            DataType::I8 | DataType::I32 => DataType::I32,
        }
    }

    pub(crate) const fn code(&self) -> u8 {
        match self {
            DataType::F32 => 0,
            DataType::F16 => 1,
            DataType::Bf16 => 2,
            DataType::I8 => 3,
            DataType::I32 => 4,
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "f32" | "float" => Some(DataType::F32),
            "f16" | "half" => Some(DataType::F16),
            "bf16" => Some(DataType::Bf16),
            "i8" | "int8" => Some(DataType::I8),
            "i32" | "int32" => Some(DataType::I32),
            _ => None,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::F32 => "f32",
            DataType::F16 => "f16",
            DataType::Bf16 => "bf16",
            DataType::I8 => "i8",
            DataType::I32 => "i32",
        };
        f.write_str(name)
    }
}

/// A storable element.
pub trait Element: Copy + Default + PartialEq + fmt::Debug + Send + Sync + 'static {
    const DTYPE: DataType;

    type Accumulator: Accumulator;

    /// Widen into the accumulator type
    fn to_acc(self) -> Self::Accumulator;

    /// Narrow an accumulator value into this type
    fn from_acc(acc: Self::Accumulator) -> Self;

    fn read_le(bytes: &[u8]) -> Self;

    fn write_le(self, out: &mut [u8]);

    /// Lossy conversion used for generating and checking test data
    fn from_f64(value: f64) -> Self;

    fn to_f64(self) -> f64;

    fn size() -> usize {
        Self::DTYPE.size()
    }
}

/// An element that products are summed in.
pub trait Accumulator: Element<Accumulator = Self> {
    fn zero() -> Self {
        Self::default()
    }

    fn add(self, rhs: Self) -> Self;

    /// `self + a * b`
    fn mul_add(self, a: Self, b: Self) -> Self;
}

impl Element for f32 {
    const DTYPE: DataType = DataType::F32;
    type Accumulator = f32;

    fn to_acc(self) -> f32 {
        self
    }

    fn from_acc(acc: f32) -> Self {
        acc
    }

    fn read_le(bytes: &[u8]) -> Self {
        f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    fn write_le(self, out: &mut [u8]) {
        out[..4].copy_from_slice(&self.to_le_bytes());
    }

    fn from_f64(value: f64) -> Self {
        value as f32
    }

    fn to_f64(self) -> f64 {
        self as f64
    }
}

impl Accumulator for f32 {
    fn add(self, rhs: Self) -> Self {
        self + rhs
    }

    fn mul_add(self, a: Self, b: Self) -> Self {
        self + a * b
    }
}

impl Element for f16 {
    const DTYPE: DataType = DataType::F16;
    type Accumulator = f32;

    fn to_acc(self) -> f32 {
        self.to_f32()
    }

    fn from_acc(acc: f32) -> Self {
        f16::from_f32(acc)
    }

    fn read_le(bytes: &[u8]) -> Self {
        f16::from_le_bytes([bytes[0], bytes[1]])
    }

    fn write_le(self, out: &mut [u8]) {
        out[..2].copy_from_slice(&self.to_le_bytes());
    }

    fn from_f64(value: f64) -> Self {
        f16::from_f64(value)
    }

    fn to_f64(self) -> f64 {
        self.to_f64()
    }
}

impl Element for bf16 {
    const DTYPE: DataType = DataType::Bf16;
    type Accumulator = f32;

    fn to_acc(self) -> f32 {
        self.to_f32()
    }

    fn from_acc(acc: f32) -> Self {
        bf16::from_f32(acc)
    }

    fn read_le(bytes: &[u8]) -> Self {
        bf16::from_le_bytes([bytes[0], bytes[1]])
    }

    fn write_le(self, out: &mut [u8]) {
        out[..2].copy_from_slice(&self.to_le_bytes());
    }

    fn from_f64(value: f64) -> Self {
        bf16::from_f64(value)
    }

    fn to_f64(self) -> f64 {
        self.to_f64()
    }
}

impl Element for i8 {
    const DTYPE: DataType = DataType::I8;
    type Accumulator = i32;

    fn to_acc(self) -> i32 {
        self as i32
    }

    // Saturating, like the fixpipe quantisation path
    fn from_acc(acc: i32) -> Self {
        acc.clamp(i8::MIN as i32, i8::MAX as i32) as i8
    }

    fn read_le(bytes: &[u8]) -> Self {
        bytes[0] as i8
    }

    fn write_le(self, out: &mut [u8]) {
        out[0] = self as u8;
    }

    fn from_f64(value: f64) -> Self {
        value.clamp(i8::MIN as f64, i8::MAX as f64) as i8
    }

    fn to_f64(self) -> f64 {
        self as f64
    }
}

impl Element for i32 {
    const DTYPE: DataType = DataType::I32;
    type Accumulator = i32;

    fn to_acc(self) -> i32 {
        self
    }

    fn from_acc(acc: i32) -> Self {
        acc
    }

    fn read_le(bytes: &[u8]) -> Self {
        i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    fn write_le(self, out: &mut [u8]) {
        out[..4].copy_from_slice(&self.to_le_bytes());
    }

    fn from_f64(value: f64) -> Self {
        value as i32
    }

    fn to_f64(self) -> f64 {
        self as f64
    }
}

impl Accumulator for i32 {
    // Wrapping keeps integer accumulation associative, so any split order
    // reproduces the unsplit result bit for bit.
    fn add(self, rhs: Self) -> Self {
        self.wrapping_add(rhs)
    }

    fn mul_add(self, a: Self, b: Self) -> Self {
        self.wrapping_add(a.wrapping_mul(b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes_and_accumulators() {
        assert_eq!(<f16 as Element>::size(), 2);
        assert_eq!(DataType::I8.accumulator(), DataType::I32);
        assert_eq!(DataType::Bf16.accumulator(), DataType::F32);
        assert_eq!(DataType::parse("half"), Some(DataType::F16));
    }

    #[test]
    fn test_byte_round_trip() {
        let mut bytes = [0u8; 4];
        (-3.5f32).write_le(&mut bytes);
        assert_eq!(f32::read_le(&bytes), -3.5);

        f16::from_f32(1.5).write_le(&mut bytes);
        assert_eq!(f16::read_le(&bytes).to_f32(), 1.5);
    }

    #[test]
    fn test_narrowing_casts() {
        assert_eq!(i8::from_acc(300), 127);
        assert_eq!(i8::from_acc(-300), -128);
        assert_eq!(f16::from_acc(2.0).to_f32(), 2.0);
    }
}
