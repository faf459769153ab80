//! Tiling parameters and their device blob
//!
//! The host writes one 64-byte little-endian record per launch; the kernel
//! decodes it on entry, before any execution context starts.
//!
//! | offset | width | field                         |
//! |--------|-------|-------------------------------|
//! | 0      | u64   | stride (leading dimension) A  |
//! | 8      | u64   | stride B                      |
//! | 16     | u64   | stride C                      |
//! | 24     | u32   | M                             |
//! | 28     | u32   | N                             |
//! | 32     | u32   | K                             |
//! | 36     | u16   | m1 (L1 tile)                  |
//! | 38     | u16   | n1                            |
//! | 40     | u16   | k1                            |
//! | 42     | u16   | m0 (L0 tile)                  |
//! | 44     | u16   | n0                            |
//! | 46     | u16   | k0                            |
//! | 48     | u16   | split factor                  |
//! | 50     | u8    | swizzle offset                |
//! | 51     | u8    | swizzle direction             |
//! | 52     | u32   | launch core count (block dim) |
//! | 56     | u64   | tiling key                    |
//!
//! The tiling key packs, one byte each from the least significant end:
//! variant serial, layout A, layout B, element type, padding A, padding B,
//! padding C, and a last byte holding the split mode (low nibble) and the
//! pipeline kind (high nibble).

use crate::coord::GemmCoord;
use crate::element::DataType;
use crate::error::{GemmError, GemmResult};
use crate::hardware::{StageConfig, TileConfig};
use crate::layout::LayoutTag;
use crate::padding::PaddingTag;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of the encoded record
pub const BLOB_BYTES: usize = 64;

/// Kernel variant, numbered by its serial in the tiling key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KernelVariant {
    Common,
    SmallMatmul,
    PaddingCommon,
    SplitK,
    StreamK,
}

impl KernelVariant {
    pub const fn serial(&self) -> u8 {
        match self {
            KernelVariant::Common => 0,
            KernelVariant::SmallMatmul => 1,
            KernelVariant::PaddingCommon => 2,
            KernelVariant::SplitK => 3,
            KernelVariant::StreamK => 4,
        }
    }

    pub fn from_serial(serial: u8) -> Option<Self> {
        match serial {
            0 => Some(KernelVariant::Common),
            1 => Some(KernelVariant::SmallMatmul),
            2 => Some(KernelVariant::PaddingCommon),
            3 => Some(KernelVariant::SplitK),
            4 => Some(KernelVariant::StreamK),
            _ => None,
        }
    }
}

impl fmt::Display for KernelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KernelVariant::Common => "common",
            KernelVariant::SmallMatmul => "small-matmul",
            KernelVariant::PaddingCommon => "padding-common",
            KernelVariant::SplitK => "split-k",
            KernelVariant::StreamK => "stream-k",
        };
        f.write_str(name)
    }
}

/// How K slices of one output tile are recombined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SplitMode {
    None,
    /// Slices run on different cores into disjoint workspace slices and
    /// a reduction pass sums them
    Partitioned,
    /// One core owns every slice of a tile; the first slice overwrites
    /// and the rest accumulate
    Sequential,
}

impl SplitMode {
    const fn code(&self) -> u8 {
        match self {
            SplitMode::None => 0,
            SplitMode::Partitioned => 1,
            SplitMode::Sequential => 2,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(SplitMode::None),
            1 => Some(SplitMode::Partitioned),
            2 => Some(SplitMode::Sequential),
            _ => None,
        }
    }
}

/// Block MMA pipeline flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineKind {
    PingPong,
    PreloadAsync,
}

impl PipelineKind {
    /// Buffer stages the pipeline runs with
    pub const fn stages(&self) -> StageConfig {
        match self {
            PipelineKind::PingPong => StageConfig::ping_pong(),
            PipelineKind::PreloadAsync => StageConfig::preload(2, 1),
        }
    }

    const fn code(&self) -> u8 {
        match self {
            PipelineKind::PingPong => 0,
            PipelineKind::PreloadAsync => 1,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(PipelineKind::PingPong),
            1 => Some(PipelineKind::PreloadAsync),
            _ => None,
        }
    }
}

/// Variant discriminator packed into a single integer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TilingKey(pub u64);

/// Everything a launch needs to know about its decomposition
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TilingParameters {
    pub problem: GemmCoord,
    pub stride_a: usize,
    pub stride_b: usize,
    pub stride_c: usize,
    pub tiles: TileConfig,
    pub split_factor: usize,
    pub swizzle_offset: usize,
    /// 0: walk M-major inside a swizzle band, 1: walk N-major
    pub swizzle_direction: usize,
    pub block_dim: usize,
    pub variant: KernelVariant,
    pub layout_a: LayoutTag,
    pub layout_b: LayoutTag,
    pub element: DataType,
    pub padding_a: PaddingTag,
    pub padding_b: PaddingTag,
    pub padding_c: PaddingTag,
    pub split_mode: SplitMode,
    pub pipeline: PipelineKind,
}

impl TilingParameters {
    /// Plain tiled launch with natural strides and no padding
    pub fn common(
        problem: GemmCoord,
        layout_a: LayoutTag,
        layout_b: LayoutTag,
        element: DataType,
        tiles: TileConfig,
        core_count: usize,
    ) -> Self {
        let stride_a = match layout_a {
            LayoutTag::RowMajor => problem.k,
            LayoutTag::ColumnMajor => problem.m,
        };
        let stride_b = match layout_b {
            LayoutTag::RowMajor => problem.n,
            LayoutTag::ColumnMajor => problem.k,
        };
        let block_dim = problem.tile_count_mn(&tiles.l1).min(core_count).max(1);
        Self {
            problem,
            stride_a,
            stride_b,
            stride_c: problem.n,
            tiles,
            split_factor: 1,
            swizzle_offset: 3,
            swizzle_direction: if problem.m > problem.n { 0 } else { 1 },
            block_dim,
            variant: KernelVariant::Common,
            layout_a,
            layout_b,
            element,
            padding_a: PaddingTag::None,
            padding_b: PaddingTag::None,
            padding_c: PaddingTag::None,
            split_mode: SplitMode::None,
            pipeline: PipelineKind::PingPong,
        }
    }

    pub fn tiling_key(&self) -> TilingKey {
        let bytes = [
            self.variant.serial(),
            self.layout_a.code(),
            self.layout_b.code(),
            self.element.code(),
            self.padding_a.code(),
            self.padding_b.code(),
            self.padding_c.code(),
            self.split_mode.code() | (self.pipeline.code() << 4),
        ];
        TilingKey(u64::from_le_bytes(bytes))
    }

    /// Encode into the device record. Fails when a field does not fit its slot.
    pub fn to_bytes(&self) -> GemmResult<[u8; BLOB_BYTES]> {
        let mut out = [0u8; BLOB_BYTES];
        put_u64(&mut out, 0, self.stride_a)?;
        put_u64(&mut out, 8, self.stride_b)?;
        put_u64(&mut out, 16, self.stride_c)?;
        put_u32(&mut out, 24, self.problem.m, "m")?;
        put_u32(&mut out, 28, self.problem.n, "n")?;
        put_u32(&mut out, 32, self.problem.k, "k")?;
        put_u16(&mut out, 36, self.tiles.l1.m, "m1")?;
        put_u16(&mut out, 38, self.tiles.l1.n, "n1")?;
        put_u16(&mut out, 40, self.tiles.l1.k, "k1")?;
        put_u16(&mut out, 42, self.tiles.l0.m, "m0")?;
        put_u16(&mut out, 44, self.tiles.l0.n, "n0")?;
        put_u16(&mut out, 46, self.tiles.l0.k, "k0")?;
        put_u16(&mut out, 48, self.split_factor, "split factor")?;
        out[50] = u8::try_from(self.swizzle_offset).map_err(|_| GemmError::blob("swizzle offset exceeds u8"))?;
        out[51] = u8::try_from(self.swizzle_direction).map_err(|_| GemmError::blob("swizzle direction exceeds u8"))?;
        put_u32(&mut out, 52, self.block_dim, "block dim")?;
        out[56..64].copy_from_slice(&self.tiling_key().0.to_le_bytes());
        Ok(out)
    }

    /// Decode a device record
    pub fn from_bytes(bytes: &[u8]) -> GemmResult<Self> {
        if bytes.len() < BLOB_BYTES {
            return Err(GemmError::blob(format!(
                "record is {} bytes, expected {BLOB_BYTES}",
                bytes.len()
            )));
        }
        let u64_at = |at: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&bytes[at..at + 8]);
            u64::from_le_bytes(b)
        };
        let u32_at = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]) as usize;
        let u16_at = |at: usize| u16::from_le_bytes([bytes[at], bytes[at + 1]]) as usize;

        let key = u64_at(56).to_le_bytes();
        let variant = KernelVariant::from_serial(key[0])
            .ok_or_else(|| GemmError::blob(format!("unknown kernel serial {}", key[0])))?;
        let layout = |code: u8| LayoutTag::from_code(code).ok_or_else(|| GemmError::blob(format!("unknown layout tag {code}")));
        let padding = |code: u8| PaddingTag::from_code(code).ok_or_else(|| GemmError::blob(format!("unknown padding tag {code}")));
        let element = [DataType::F32, DataType::F16, DataType::Bf16, DataType::I8, DataType::I32]
            .into_iter()
            .find(|d| d.code() == key[3])
            .ok_or_else(|| GemmError::blob(format!("unknown element code {}", key[3])))?;
        let split_mode = SplitMode::from_code(key[7] & 0x0f)
            .ok_or_else(|| GemmError::blob(format!("unknown split mode {}", key[7] & 0x0f)))?;
        let pipeline = PipelineKind::from_code(key[7] >> 4)
            .ok_or_else(|| GemmError::blob(format!("unknown pipeline kind {}", key[7] >> 4)))?;

        let params = Self {
            problem: GemmCoord::new(u32_at(24), u32_at(28), u32_at(32)),
            stride_a: u64_at(0) as usize,
            stride_b: u64_at(8) as usize,
            stride_c: u64_at(16) as usize,
            tiles: TileConfig::new(
                GemmCoord::new(u16_at(36), u16_at(38), u16_at(40)),
                GemmCoord::new(u16_at(42), u16_at(44), u16_at(46)),
            ),
            split_factor: u16_at(48),
            swizzle_offset: bytes[50] as usize,
            swizzle_direction: bytes[51] as usize,
            block_dim: u32_at(52),
            variant,
            layout_a: layout(key[1])?,
            layout_b: layout(key[2])?,
            element,
            padding_a: padding(key[4])?,
            padding_b: padding(key[5])?,
            padding_c: padding(key[6])?,
            split_mode,
            pipeline,
        };
        params.check()?;
        Ok(params)
    }

    /// Structural sanity checks shared by the host and device paths
    pub fn check(&self) -> GemmResult<()> {
        if self.problem.is_empty() {
            return Err(GemmError::tiling(format!("empty problem {}", self.problem)));
        }
        if self.tiles.l1.is_empty() || self.tiles.l0.is_empty() {
            return Err(GemmError::tiling(format!("empty tile {}", self.tiles)));
        }
        if self.split_factor == 0 || self.block_dim == 0 || self.swizzle_offset == 0 {
            return Err(GemmError::tiling("split factor, block dim and swizzle offset must be non-zero"));
        }
        if self.swizzle_direction > 1 {
            return Err(GemmError::tiling(format!("swizzle direction {}", self.swizzle_direction)));
        }
        let split_expected = self.variant == KernelVariant::SplitK;
        if split_expected != (self.split_mode != SplitMode::None) {
            return Err(GemmError::tiling(format!(
                "split mode {:?} does not match variant {}",
                self.split_mode, self.variant
            )));
        }
        if !split_expected && self.split_factor != 1 {
            return Err(GemmError::tiling(format!("split factor {} on variant {}", self.split_factor, self.variant)));
        }
        Ok(())
    }
}

fn put_u64(out: &mut [u8], at: usize, value: usize) -> GemmResult<()> {
    let value = u64::try_from(value).map_err(|_| GemmError::blob("stride exceeds u64"))?;
    out[at..at + 8].copy_from_slice(&value.to_le_bytes());
    Ok(())
}

fn put_u32(out: &mut [u8], at: usize, value: usize, field: &str) -> GemmResult<()> {
    let value = u32::try_from(value).map_err(|_| GemmError::blob(format!("{field} = {value} exceeds u32")))?;
    out[at..at + 4].copy_from_slice(&value.to_le_bytes());
    Ok(())
}

fn put_u16(out: &mut [u8], at: usize, value: usize, field: &str) -> GemmResult<()> {
    let value = u16::try_from(value).map_err(|_| GemmError::blob(format!("{field} = {value} exceeds u16")))?;
    out[at..at + 2].copy_from_slice(&value.to_le_bytes());
    Ok(())
}

impl fmt::Display for TilingParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Tiling Parameters")?;
        writeln!(f, "=================")?;
        writeln!(f, "Problem: {}", self.problem)?;
        writeln!(f, "Variant: {} (key {:#018x})", self.variant, self.tiling_key().0)?;
        writeln!(f, "Layouts: A {} / B {}", self.layout_a, self.layout_b)?;
        writeln!(f, "Tiles: {}", self.tiles)?;
        writeln!(
            f,
            "Padding: A {:?} / B {:?} / C {:?}",
            self.padding_a, self.padding_b, self.padding_c
        )?;
        writeln!(f, "Split: {} ({:?})", self.split_factor, self.split_mode)?;
        writeln!(f, "Pipeline: {:?}", self.pipeline)?;
        writeln!(
            f,
            "Swizzle: offset {} direction {}",
            self.swizzle_offset, self.swizzle_direction
        )?;
        write!(f, "Cores: {}", self.block_dim)
    }
}
