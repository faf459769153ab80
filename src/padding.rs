//! Operand padding
//!
//! Operands whose natural layout streams poorly are rewritten by the
//! transfer contexts into a workspace copy before the compute contexts
//! start. The copy is always a function of the logical values alone:
//! padding positions are written as zero.

use crate::coord::{ceil_div, round_up, share, MatrixCoord};
use crate::element::Element;
use crate::layout::{Layout, LayoutTag};
use crate::memory::{BufferHandle, DeviceMemory, Region};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Byte alignment of a padded row pitch
pub const ND_ALIGN_BYTES: usize = 512;

/// Rows handled by one padding task
pub const TASK_ROWS: usize = 16;

/// How an operand is rewritten before use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaddingTag {
    /// Used in place
    None,
    /// Row pitch rounded up to `ND_ALIGN_BYTES`
    Nd,
    /// Regrouped into contiguous L1-tile-sized blocks
    BlockNd,
    /// Regrouped into 16 x c0 fractal blocks
    Nz,
}

impl PaddingTag {
    pub(crate) const fn code(&self) -> u8 {
        match self {
            PaddingTag::None => 0,
            PaddingTag::Nd => 1,
            PaddingTag::BlockNd => 2,
            PaddingTag::Nz => 3,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(PaddingTag::None),
            1 => Some(PaddingTag::Nd),
            2 => Some(PaddingTag::BlockNd),
            3 => Some(PaddingTag::Nz),
            _ => None,
        }
    }

    pub fn is_padded(&self) -> bool {
        *self != PaddingTag::None
    }
}

/// Layout an operand takes after padding with `tag`.
///
/// `block` is the L1 tile of this operand (rows x cols) and is only used by
/// `BlockNd`.
pub fn padded_layout(natural: &Layout, tag: PaddingTag, block: MatrixCoord, element_size: usize) -> Layout {
    let (rows, cols) = (natural.rows, natural.cols);
    match tag {
        PaddingTag::None => *natural,
        PaddingTag::Nd => {
            let align = (ND_ALIGN_BYTES / element_size).max(1);
            Layout::strided(natural.tag, rows, cols, round_up(natural.inner(), align))
        }
        PaddingTag::BlockNd => Layout::block_nd(natural.tag, rows, cols, block.row, block.column),
        PaddingTag::Nz => Layout::fractal(natural.tag, rows, cols, element_size),
    }
}

/// Bytes of workspace a padded copy occupies
pub fn workspace_bytes(layout: &Layout, element_size: usize) -> usize {
    layout.capacity() * element_size
}

/// Host-side padding of a dense buffer laid out as `src`
pub fn pad<E: Element>(data: &[E], src: &Layout, dst: &Layout) -> Vec<E> {
    let mut out = vec![E::default(); dst.capacity()];
    for r in 0..src.rows {
        for c in 0..src.cols {
            let coord = MatrixCoord::new(r, c);
            out[dst.offset(coord)] = data[src.offset(coord)];
        }
    }
    out
}

/// Host-side inverse of [`pad`]
pub fn unpad<E: Element>(data: &[E], src: &Layout, dst: &Layout) -> Vec<E> {
    let mut out = vec![E::default(); dst.capacity()];
    for r in 0..dst.rows {
        for c in 0..dst.cols {
            let coord = MatrixCoord::new(r, c);
            out[dst.offset(coord)] = data[src.offset(coord)];
        }
    }
    out
}

/// A band of the padded footprint handled by one transfer context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaddingTask {
    /// First outer index (row for row-major origin)
    pub outer: usize,
    pub outer_len: usize,
    pub inner: usize,
    pub inner_len: usize,
}

/// Split the padded footprint of `layout` into tasks of at most
/// `TASK_ROWS` outer lines and `task_bytes` of data each.
pub fn padding_tasks(layout: &Layout, element_size: usize, task_bytes: usize) -> Vec<PaddingTask> {
    let padded = layout.padded_shape();
    let (outer_extent, inner_extent) = match layout.tag {
        LayoutTag::RowMajor => (padded.row, padded.column),
        LayoutTag::ColumnMajor => (padded.column, padded.row),
    };
    if outer_extent == 0 || inner_extent == 0 {
        return Vec::new();
    }
    let rows = TASK_ROWS.min(outer_extent);
    let max_cols = (task_bytes / element_size / TASK_ROWS).max(8);
    let pieces = ceil_div(inner_extent, max_cols.min(inner_extent));
    let cols = round_up(ceil_div(inner_extent, pieces), 8).min(inner_extent);

    let mut tasks = Vec::new();
    for outer in (0..outer_extent).step_by(rows) {
        for inner in (0..inner_extent).step_by(cols) {
            tasks.push(PaddingTask {
                outer,
                outer_len: rows.min(outer_extent - outer),
                inner,
                inner_len: cols.min(inner_extent - inner),
            });
        }
    }
    tasks
}

/// Transfer-context pass copying `src` into its padded form in `dst`.
///
/// Tasks are dealt round-robin over `unit_count` contexts; each stages its
/// band in a local buffer, the way the unified buffer is used on hardware.
#[allow(clippy::too_many_arguments)]
pub fn pad_operand<E: Element>(
    memory: &DeviceMemory,
    src: BufferHandle,
    src_layout: &Layout,
    dst: Region,
    dst_layout: &Layout,
    unit_idx: usize,
    unit_count: usize,
    task_bytes: usize,
) {
    let tasks = padding_tasks(dst_layout, E::size(), task_bytes);
    let base = dst.base::<E>();
    let mut staged: Vec<E> = Vec::new();
    for task in tasks.iter().skip(unit_idx).step_by(unit_count) {
        let coords = task_coords(task, dst_layout.tag);
        staged.clear();
        memory.read::<E, _>(src, |view| {
            staged.extend(coords.clone().map(|coord| {
                if coord.row < src_layout.rows && coord.column < src_layout.cols {
                    view.get(src_layout.offset(coord))
                } else {
                    E::default()
                }
            }));
        });
        memory.write::<E, _>(dst.handle, |view| {
            for (coord, value) in coords.zip(staged.iter()) {
                view.set(base + dst_layout.offset(coord), *value);
            }
        });
    }
    trace!(unit_idx, tasks = tasks.len(), "padding pass done");
}

/// Transfer-context pass copying the `extent` rectangle at `origin` out of
/// a padded (or accumulator-typed) `src` into `dst`.
///
/// Values pass through the shared accumulator type, so this also performs
/// the narrowing cast. Rows of the rectangle are cut over `unit_count`
/// contexts.
#[allow(clippy::too_many_arguments)]
pub fn remove_padding<S, D>(
    memory: &DeviceMemory,
    src: Region,
    src_layout: &Layout,
    dst: Region,
    dst_layout: &Layout,
    origin: MatrixCoord,
    extent: MatrixCoord,
    unit_idx: usize,
    unit_count: usize,
) where
    S: Element,
    D: Element<Accumulator = S::Accumulator>,
{
    let rows = share(extent.row, unit_idx, unit_count);
    if rows.is_empty() || extent.column == 0 {
        return;
    }
    let cols = extent.column;
    let (src_base, dst_base) = (src.base::<S>(), dst.base::<D>());
    let mut staged: Vec<D> = Vec::with_capacity(rows.len() * cols);
    memory.read::<S, _>(src.handle, |view| {
        for r in rows.clone() {
            for c in 0..cols {
                let at = src_base + src_layout.offset(origin + MatrixCoord::new(r, c));
                staged.push(D::from_acc(view.get(at).to_acc()));
            }
        }
    });
    memory.write::<D, _>(dst.handle, |view| {
        for (i, r) in rows.enumerate() {
            for c in 0..cols {
                let at = dst_base + dst_layout.offset(origin + MatrixCoord::new(r, c));
                view.set(at, staged[i * cols + c]);
            }
        }
    });
}

/// Logical coordinates covered by a task, inner index fastest
pub(crate) fn task_coords(task: &PaddingTask, tag: LayoutTag) -> impl Iterator<Item = MatrixCoord> + Clone {
    let task = *task;
    (task.outer..task.outer + task.outer_len).flat_map(move |outer| {
        (task.inner..task.inner + task.inner_len).map(move |inner| match tag {
            LayoutTag::RowMajor => MatrixCoord::new(outer, inner),
            LayoutTag::ColumnMajor => MatrixCoord::new(inner, outer),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Allocator;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn all_tags() -> [PaddingTag; 4] {
        [PaddingTag::None, PaddingTag::Nd, PaddingTag::BlockNd, PaddingTag::Nz]
    }

    #[test]
    fn test_nd_pitch_alignment() {
        let natural = Layout::row_major(10, 130);
        let padded = padded_layout(&natural, PaddingTag::Nd, MatrixCoord::new(16, 16), 4);
        assert_eq!(padded.stride(), 256);
        assert_eq!(workspace_bytes(&padded, 4), (9 * 256 + 130) * 4);
    }

    #[test]
    fn test_tasks_cover_padded_footprint() {
        let layout = Layout::fractal(LayoutTag::RowMajor, 37, 1000, 4);
        let tasks = padding_tasks(&layout, 4, 48 * 1024);
        let covered: usize = tasks.iter().map(|t| t.outer_len * t.inner_len).sum();
        assert_eq!(covered, layout.padded_shape().count());
        assert!(tasks.iter().all(|t| t.outer_len <= TASK_ROWS));
    }

    #[test]
    fn test_device_pass_matches_host_padding() {
        let memory = DeviceMemory::new();
        let natural = Layout::column_major(33, 21);
        let data: Vec<f32> = (0..natural.capacity()).map(|i| i as f32).collect();
        let src = memory.upload(&data);
        for tag in all_tags() {
            let padded = padded_layout(&natural, tag, MatrixCoord::new(16, 8), 4);
            let bytes = workspace_bytes(&padded, 4);
            let dst = memory.allocate(bytes);
            for unit in 0..3 {
                pad_operand::<f32>(&memory, src, &natural, dst.region(), &padded, unit, 3, 256);
            }
            let device = memory.download::<f32>(dst, padded.capacity()).unwrap();
            assert_eq!(device, pad(&data, &natural, &padded), "{tag:?}");
            assert_eq!(memory.high_water(dst).unwrap(), bytes, "{tag:?}");
        }
    }

    #[test]
    fn test_remove_padding_restores_natural_output() {
        let memory = DeviceMemory::new();
        let natural = Layout::row_major(20, 37);
        let padded = padded_layout(&natural, PaddingTag::Nd, MatrixCoord::new(16, 16), 4);
        let data: Vec<f32> = (0..natural.capacity()).map(|i| i as f32).collect();
        let src = memory.upload(&pad(&data, &natural, &padded));
        let dst = memory.allocate(natural.capacity() * 4);
        for unit in 0..3 {
            remove_padding::<f32, f32>(
                &memory,
                src.region(),
                &padded,
                dst.region(),
                &natural,
                MatrixCoord::new(0, 0),
                natural.shape(),
                unit,
                3,
            );
        }
        assert_eq!(memory.download::<f32>(dst, natural.capacity()).unwrap(), data);
    }

    #[test]
    fn test_remove_padding_narrows_a_sub_rectangle() {
        let memory = DeviceMemory::new();
        let layout = Layout::row_major(4, 4);
        let wide: Vec<i32> = vec![300; 16];
        let src = memory.upload(&wide);
        let dst = memory.upload(&vec![0i8; 16]);
        remove_padding::<i32, i8>(
            &memory,
            src.region(),
            &layout,
            dst.region(),
            &layout,
            MatrixCoord::new(1, 1),
            MatrixCoord::new(2, 2),
            0,
            1,
        );
        let out = memory.download::<i8>(dst, 16).unwrap();
        let written: Vec<usize> = (0..16).filter(|&i| out[i] != 0).collect();
        assert_eq!(written, vec![5, 6, 9, 10]);
        assert_eq!(out[5], i8::from_acc(300));
    }

    proptest! {
        #[test]
        fn prop_pad_round_trip(
            rows in 1usize..40,
            cols in 1usize..40,
            column_major in any::<bool>(),
            tag_idx in 0usize..4,
        ) {
            let tag = if column_major { LayoutTag::ColumnMajor } else { LayoutTag::RowMajor };
            let natural = Layout::natural(tag, rows, cols);
            let padded = padded_layout(&natural, all_tags()[tag_idx], MatrixCoord::new(16, 16), 2);
            let data: Vec<i32> = (0..natural.capacity() as i32).collect();

            let once = pad(&data, &natural, &padded);
            prop_assert_eq!(unpad(&once, &padded, &natural), data);
            let twice = pad(&unpad(&once, &padded, &natural), &natural, &padded);
            prop_assert_eq!(twice, once);
        }
    }
}
