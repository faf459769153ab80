//! Problem and tile coordinates

use serde::{Deserialize, Serialize};
use std::fmt;

/// Integer ceiling division.
#[inline]
pub const fn ceil_div(value: usize, divisor: usize) -> usize {
    (value + divisor - 1) / divisor
}

/// Round `value` up to the next multiple of `align`.
#[inline]
pub const fn round_up(value: usize, align: usize) -> usize {
    ceil_div(value, align) * align
}

/// Round `value` down to a multiple of `align`.
#[inline]
pub const fn round_down(value: usize, align: usize) -> usize {
    value / align * align
}

/// Contiguous part `idx` of `0..total` cut into `count` near-equal parts.
pub fn share(total: usize, idx: usize, count: usize) -> std::ops::Range<usize> {
    (idx * total / count)..((idx + 1) * total / count)
}

/// A (M, N, K) triple: problem extents, tile extents or block indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct GemmCoord {
    pub m: usize,
    pub n: usize,
    pub k: usize,
}

impl GemmCoord {
    pub const fn new(m: usize, n: usize, k: usize) -> Self {
        Self { m, n, k }
    }

    /// Number of (m, n) tiles of shape `tile` covering `self`
    pub fn tile_count_mn(&self, tile: &GemmCoord) -> usize {
        ceil_div(self.m, tile.m) * ceil_div(self.n, tile.n)
    }

    /// Per-axis tile counts
    pub fn loops(&self, tile: &GemmCoord) -> GemmCoord {
        GemmCoord::new(
            ceil_div(self.m, tile.m),
            ceil_div(self.n, tile.n),
            ceil_div(self.k, tile.k),
        )
    }

    pub fn mn(&self) -> MatrixCoord {
        MatrixCoord::new(self.m, self.n)
    }

    pub fn mk(&self) -> MatrixCoord {
        MatrixCoord::new(self.m, self.k)
    }

    pub fn kn(&self) -> MatrixCoord {
        MatrixCoord::new(self.k, self.n)
    }

    pub fn is_empty(&self) -> bool {
        self.m == 0 || self.n == 0 || self.k == 0
    }
}

impl fmt::Display for GemmCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.m, self.n, self.k)
    }
}

/// A (row, column) pair, used both for positions and for 2-D extents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct MatrixCoord {
    pub row: usize,
    pub column: usize,
}

impl MatrixCoord {
    pub const fn new(row: usize, column: usize) -> Self {
        Self { row, column }
    }

    pub fn count(&self) -> usize {
        self.row * self.column
    }
}

impl std::ops::Add for MatrixCoord {
    type Output = MatrixCoord;

    fn add(self, rhs: MatrixCoord) -> MatrixCoord {
        MatrixCoord::new(self.row + rhs.row, self.column + rhs.column)
    }
}

impl fmt::Display for MatrixCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.row, self.column)
    }
}
