//! Matrix layouts
//!
//! A `Layout` maps a logical (row, column) coordinate to an element offset.
//! Operands start out row- or column-major with a leading-dimension stride.
//! Padding passes may rewrite them into a stride-aligned copy, a grid of
//! contiguous L1-sized blocks, or the 16 x c0 fractal block format the
//! multiply unit consumes.

use crate::coord::{ceil_div, round_up, MatrixCoord};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Rows in one fractal block
pub const FRACTAL_ROWS: usize = 16;

/// Bytes along the inner axis of one fractal block
pub const FRACTAL_BYTES: usize = 32;

/// Logical origin of an operand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LayoutTag {
    RowMajor,
    ColumnMajor,
}

impl LayoutTag {
    pub(crate) const fn code(&self) -> u8 {
        match self {
            LayoutTag::RowMajor => 0,
            LayoutTag::ColumnMajor => 1,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(LayoutTag::RowMajor),
            1 => Some(LayoutTag::ColumnMajor),
            _ => None,
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "row" | "row-major" | "rowmajor" | "n" => Some(LayoutTag::RowMajor),
            "col" | "column" | "col-major" | "column-major" | "t" => Some(LayoutTag::ColumnMajor),
            _ => None,
        }
    }
}

impl fmt::Display for LayoutTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayoutTag::RowMajor => f.write_str("row-major"),
            LayoutTag::ColumnMajor => f.write_str("column-major"),
        }
    }
}

/// Physical arrangement of the elements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Format {
    /// Plain row/column-major with a leading-dimension stride
    Strided { stride: usize },
    /// Grid of contiguous `block_rows x block_cols` blocks
    BlockNd {
        block_rows: usize,
        block_cols: usize,
        /// Blocks along the outer-major direction of the grid
        grid: usize,
    },
    /// 16 x c0 fractal blocks (zN for row-major origin, nZ for column-major)
    Fractal {
        c0: usize,
        /// Padded extent of one block panel
        panel: usize,
    },
}

/// A layout value. Tiles derived from it are new values with the parent's
/// strides and a smaller shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layout {
    pub tag: LayoutTag,
    pub rows: usize,
    pub cols: usize,
    pub format: Format,
}

impl Layout {
    pub fn row_major(rows: usize, cols: usize) -> Self {
        Self::strided(LayoutTag::RowMajor, rows, cols, cols)
    }

    pub fn column_major(rows: usize, cols: usize) -> Self {
        Self::strided(LayoutTag::ColumnMajor, rows, cols, rows)
    }

    /// Unpadded layout for `tag`
    pub fn natural(tag: LayoutTag, rows: usize, cols: usize) -> Self {
        match tag {
            LayoutTag::RowMajor => Self::row_major(rows, cols),
            LayoutTag::ColumnMajor => Self::column_major(rows, cols),
        }
    }

    pub fn strided(tag: LayoutTag, rows: usize, cols: usize, stride: usize) -> Self {
        Self {
            tag,
            rows,
            cols,
            format: Format::Strided { stride },
        }
    }

    pub fn block_nd(tag: LayoutTag, rows: usize, cols: usize, block_rows: usize, block_cols: usize) -> Self {
        let grid = match tag {
            LayoutTag::RowMajor => ceil_div(cols, block_cols),
            LayoutTag::ColumnMajor => ceil_div(rows, block_rows),
        };
        Self {
            tag,
            rows,
            cols,
            format: Format::BlockNd {
                block_rows,
                block_cols,
                grid,
            },
        }
    }

    pub fn fractal(tag: LayoutTag, rows: usize, cols: usize, element_size: usize) -> Self {
        let c0 = (FRACTAL_BYTES / element_size).max(1);
        let panel = match tag {
            LayoutTag::RowMajor => round_up(rows, FRACTAL_ROWS),
            LayoutTag::ColumnMajor => round_up(cols, FRACTAL_ROWS),
        };
        Self {
            tag,
            rows,
            cols,
            format: Format::Fractal { c0, panel },
        }
    }

    pub fn shape(&self) -> MatrixCoord {
        MatrixCoord::new(self.rows, self.cols)
    }

    /// Extent along the contiguous axis
    pub fn inner(&self) -> usize {
        match self.tag {
            LayoutTag::RowMajor => self.cols,
            LayoutTag::ColumnMajor => self.rows,
        }
    }

    pub fn outer(&self) -> usize {
        match self.tag {
            LayoutTag::RowMajor => self.rows,
            LayoutTag::ColumnMajor => self.cols,
        }
    }

    /// Stride of the dense strided layout of the same shape
    pub fn natural_stride(&self) -> usize {
        self.inner()
    }

    /// Leading dimension: the stride for strided layouts, the padded
    /// inner extent otherwise.
    pub fn stride(&self) -> usize {
        match self.format {
            Format::Strided { stride } => stride,
            Format::BlockNd {
                block_rows,
                block_cols,
                ..
            } => match self.tag {
                LayoutTag::RowMajor => round_up(self.cols, block_cols),
                LayoutTag::ColumnMajor => round_up(self.rows, block_rows),
            },
            Format::Fractal { c0, .. } => round_up(self.inner(), c0),
        }
    }

    pub fn is_padded(&self) -> bool {
        !matches!(self.format, Format::Strided { stride } if stride == self.natural_stride())
    }

    /// Element offset of a logical coordinate
    pub fn offset(&self, coord: MatrixCoord) -> usize {
        // Swap to (outer, inner) so each format is written once.
        let (outer, inner) = match self.tag {
            LayoutTag::RowMajor => (coord.row, coord.column),
            LayoutTag::ColumnMajor => (coord.column, coord.row),
        };
        match self.format {
            Format::Strided { stride } => outer * stride + inner,
            Format::BlockNd {
                block_rows,
                block_cols,
                grid,
            } => {
                let (bo, bi) = match self.tag {
                    LayoutTag::RowMajor => (block_rows, block_cols),
                    LayoutTag::ColumnMajor => (block_cols, block_rows),
                };
                let block = (outer / bo) * grid + inner / bi;
                block * bo * bi + (outer % bo) * bi + inner % bi
            }
            Format::Fractal { c0, panel } => (inner / c0) * panel * c0 + outer * c0 + inner % c0,
        }
    }

    /// Layout of a `shape` tile cut from this one.
    ///
    /// Offsets inside the tile are taken relative to the tile origin's
    /// offset in the parent, which holds for every format as long as the
    /// origin sits on a block boundary.
    pub fn tile_layout(&self, shape: MatrixCoord) -> Layout {
        Layout {
            tag: self.tag,
            rows: shape.row,
            cols: shape.column,
            format: self.format,
        }
    }

    /// Number of elements spanned, from offset 0 to one past the last
    /// addressable element (including block padding).
    pub fn capacity(&self) -> usize {
        if self.rows == 0 || self.cols == 0 {
            return 0;
        }
        match self.format {
            Format::Strided { stride } => (self.outer() - 1) * stride + self.inner(),
            Format::BlockNd {
                block_rows,
                block_cols,
                ..
            } => round_up(self.rows, block_rows) * round_up(self.cols, block_cols),
            Format::Fractal { c0, panel } => panel * round_up(self.inner(), c0),
        }
    }

    /// Every addressable coordinate of the padded footprint, as
    /// `(padded_rows, padded_cols)`
    pub fn padded_shape(&self) -> MatrixCoord {
        match self.format {
            Format::Strided { .. } => self.shape(),
            Format::BlockNd {
                block_rows,
                block_cols,
                ..
            } => MatrixCoord::new(round_up(self.rows, block_rows), round_up(self.cols, block_cols)),
            Format::Fractal { c0, panel } => match self.tag {
                LayoutTag::RowMajor => MatrixCoord::new(panel, round_up(self.cols, c0)),
                LayoutTag::ColumnMajor => MatrixCoord::new(round_up(self.rows, c0), panel),
            },
        }
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.format {
            Format::Strided { stride } => {
                write!(f, "{} {}x{} (ld {})", self.tag, self.rows, self.cols, stride)
            }
            Format::BlockNd {
                block_rows,
                block_cols,
                ..
            } => write!(
                f,
                "{} {}x{} in {}x{} blocks",
                self.tag, self.rows, self.cols, block_rows, block_cols
            ),
            Format::Fractal { c0, .. } => {
                write!(f, "{} {}x{} fractal (c0 {})", self.tag, self.rows, self.cols, c0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn assert_bijective(layout: &Layout) {
        let mut seen = HashSet::new();
        for r in 0..layout.rows {
            for c in 0..layout.cols {
                let offset = layout.offset(MatrixCoord::new(r, c));
                assert!(offset < layout.capacity(), "{layout}: ({r}, {c}) -> {offset}");
                assert!(seen.insert(offset), "{layout}: duplicate offset {offset}");
            }
        }
    }

    #[test]
    fn test_strided_offsets() {
        let row = Layout::strided(LayoutTag::RowMajor, 3, 5, 8);
        assert_eq!(row.offset(MatrixCoord::new(2, 4)), 20);
        assert_eq!(row.capacity(), 21);
        assert_eq!(row.natural_stride(), 5);
        assert!(row.is_padded());

        let col = Layout::column_major(3, 5);
        assert_eq!(col.natural_stride(), 3);
        assert_eq!(col.offset(MatrixCoord::new(2, 4)), 14);
        assert_eq!(col.capacity(), 15);
        assert!(!col.is_padded());
    }

    #[test]
    fn test_padded_formats_are_bijective() {
        assert_bijective(&Layout::block_nd(LayoutTag::RowMajor, 37, 21, 16, 8));
        assert_bijective(&Layout::block_nd(LayoutTag::ColumnMajor, 37, 21, 16, 8));
        assert_bijective(&Layout::fractal(LayoutTag::RowMajor, 19, 13, 4));
        assert_bijective(&Layout::fractal(LayoutTag::ColumnMajor, 19, 13, 2));
    }

    #[test]
    fn test_fractal_block_order() {
        // f32: c0 = 8, rows padded to 16
        let zn = Layout::fractal(LayoutTag::RowMajor, 10, 12, 4);
        assert_eq!(zn.offset(MatrixCoord::new(0, 7)), 7);
        assert_eq!(zn.offset(MatrixCoord::new(1, 0)), 8);
        assert_eq!(zn.offset(MatrixCoord::new(0, 8)), 16 * 8);
        assert_eq!(zn.capacity(), 16 * 16);
        assert_eq!(zn.padded_shape(), MatrixCoord::new(16, 16));
    }

    #[test]
    fn test_tile_layout_keeps_strides() {
        let parent = Layout::row_major(256, 512);
        let tile = parent.tile_layout(MatrixCoord::new(128, 256));
        assert_eq!(tile.stride(), 512);
        let origin = parent.offset(MatrixCoord::new(128, 256));
        assert_eq!(
            origin + tile.offset(MatrixCoord::new(3, 5)),
            parent.offset(MatrixCoord::new(131, 261))
        );
    }
}
