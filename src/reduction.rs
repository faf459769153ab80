//! Reduction passes
//!
//! Run by transfer contexts once every compute context has stored its
//! partial results. Each pass reads accumulator-typed partials, sums them
//! in a fixed order, narrows to the output element and writes C. Work is
//! cut by rows over the contexts taking part.

use crate::coord::{share, MatrixCoord};
use crate::element::{Accumulator, Element};
use crate::layout::Layout;
use crate::memory::{DeviceMemory, Region};
use crate::padding::remove_padding;
use crate::scheduler::StreamKScheduler;
use tracing::trace;

/// Sum `split` row-major `m x n` slices into C.
#[allow(clippy::too_many_arguments)]
pub fn reduce_slices<A, O>(
    memory: &DeviceMemory,
    slices: Region,
    shape: MatrixCoord,
    split: usize,
    out: Region,
    out_layout: &Layout,
    unit_idx: usize,
    unit_count: usize,
) where
    A: Accumulator,
    O: Element<Accumulator = A>,
{
    let rows = share(shape.row, unit_idx, unit_count);
    if rows.is_empty() {
        return;
    }
    let (m, n) = (shape.row, shape.column);
    let base = slices.base::<A>();
    let mut staged: Vec<O> = Vec::with_capacity(rows.len() * n);
    memory.read::<A, _>(slices.handle, |view| {
        for r in rows.clone() {
            for c in 0..n {
                let sum = (0..split).fold(A::zero(), |acc, s| acc.add(view.get(base + s * m * n + r * n + c)));
                staged.push(O::from_acc(sum));
            }
        }
    });
    write_rows(memory, &staged, out, out_layout, MatrixCoord::new(rows.start, 0), rows.len(), n);
    trace!(unit_idx, rows = ?rows, split, "split-k slices reduced");
}

/// Copy a dense accumulator-typed C into the output, narrowing each value.
#[allow(clippy::too_many_arguments)]
pub fn remove_padding_cast<A, O>(
    memory: &DeviceMemory,
    src: Region,
    src_layout: &Layout,
    dst: Region,
    dst_layout: &Layout,
    unit_idx: usize,
    unit_count: usize,
) where
    A: Accumulator,
    O: Element<Accumulator = A>,
{
    remove_padding::<A, O>(
        memory,
        src,
        src_layout,
        dst,
        dst_layout,
        MatrixCoord::new(0, 0),
        dst_layout.shape(),
        unit_idx,
        unit_count,
    );
}

/// Sum the pieces of stream-K block `block` from their slots into the C
/// tile they belong to. Pieces are added in K order.
#[allow(clippy::too_many_arguments)]
pub fn reduce_stream_k<A, O>(
    memory: &DeviceMemory,
    scheduler: &StreamKScheduler,
    slots: Region,
    out: Region,
    out_layout: &Layout,
    block: usize,
    unit_idx: usize,
    unit_count: usize,
) where
    A: Accumulator,
    O: Element<Accumulator = A>,
{
    let pieces = scheduler.block_pieces(block);
    let Some(first) = pieces.first() else {
        return;
    };
    let shape = scheduler.actual_block_shape(&first.coord);
    let offset = scheduler.block_offset(&first.coord);
    let rows = share(shape.m, unit_idx, unit_count);
    if rows.is_empty() {
        return;
    }
    let tile = scheduler.identity().tile();
    let slot_len = tile.m * tile.n;
    let base = slots.base::<A>();
    let mut staged: Vec<O> = Vec::with_capacity(rows.len() * shape.n);
    memory.read::<A, _>(slots.handle, |view| {
        for r in rows.clone() {
            for c in 0..shape.n {
                let sum = pieces.iter().fold(A::zero(), |acc, piece| {
                    acc.add(view.get(base + piece.slot * slot_len + r * tile.n + c))
                });
                staged.push(O::from_acc(sum));
            }
        }
    });
    let origin = MatrixCoord::new(offset.m + rows.start, offset.n);
    write_rows(memory, &staged, out, out_layout, origin, rows.len(), shape.n);
    trace!(block, unit_idx, pieces = pieces.len(), "stream-k block reduced");
}

fn write_rows<O: Element>(
    memory: &DeviceMemory,
    staged: &[O],
    out: Region,
    layout: &Layout,
    origin: MatrixCoord,
    rows: usize,
    cols: usize,
) {
    let base = out.base::<O>();
    memory.write::<O, _>(out.handle, |view| {
        for r in 0..rows {
            for c in 0..cols {
                view.set(base + layout.offset(origin + MatrixCoord::new(r, c)), staged[r * cols + c]);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::GemmCoord;
    use crate::memory::Allocator;
    use crate::scheduler::IdentityScheduler;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_slices_sum_in_every_unit_split() {
        let memory = DeviceMemory::new();
        let (m, n, split) = (5, 3, 3);
        let slices: Vec<i32> = (0..split * m * n).map(|i| (i / (m * n)) as i32 + 1).collect();
        let ws = memory.upload(&slices);
        let layout = Layout::row_major(m, n);
        for units in [1, 2, 7] {
            let out = memory.allocate(m * n * 4);
            for unit in 0..units {
                reduce_slices::<i32, i32>(
                    &memory,
                    ws.region(),
                    MatrixCoord::new(m, n),
                    split,
                    out.region(),
                    &layout,
                    unit,
                    units,
                );
            }
            assert_eq!(memory.download::<i32>(out, m * n).unwrap(), vec![6; m * n]);
        }
    }

    #[test]
    fn test_slices_narrow_once() {
        let memory = DeviceMemory::new();
        // Each half on its own would saturate i8; the sum does not.
        let ws = memory.upload(&[200i32, -150]);
        let out = memory.allocate(1);
        let layout = Layout::row_major(1, 1);
        reduce_slices::<i32, i8>(&memory, ws.region(), MatrixCoord::new(1, 1), 2, out.region(), &layout, 0, 1);
        assert_eq!(memory.download::<i8>(out, 1).unwrap(), vec![50]);
    }

    #[test]
    fn test_accumulator_copy_narrows() {
        let memory = DeviceMemory::new();
        let src_layout = Layout::row_major(2, 2);
        let dst_layout = Layout::column_major(2, 2);
        let src = memory.upload(&[1.5f32, 2.5, 3.5, 4.5]);
        let dst = memory.allocate(4 * 2);
        for unit in 0..2 {
            remove_padding_cast::<f32, half::f16>(&memory, src.region(), &src_layout, dst.region(), &dst_layout, unit, 2);
        }
        let got: Vec<f32> = memory.download::<half::f16>(dst, 4).unwrap().into_iter().map(f32::from).collect();
        assert_eq!(got, vec![1.5, 3.5, 2.5, 4.5]);
    }

    #[test]
    fn test_stream_k_blocks_sum_their_slots() {
        let memory = DeviceMemory::new();
        let problem = GemmCoord::new(48, 32, 64);
        let tile = GemmCoord::new(16, 16, 16);
        let scheduler = StreamKScheduler::new(IdentityScheduler::new(problem, tile, 3, 0), 4);
        assert_eq!(scheduler.stream_blocks(), 2);

        let slot_len = tile.m * tile.n;
        let slots: Vec<i32> = (0..8 * slot_len).map(|i| (i / slot_len) as i32 + 1).collect();
        let ws = memory.upload(&slots);
        let layout = Layout::row_major(problem.m, problem.n);
        let out = memory.allocate(layout.capacity() * 4);
        for block in 0..scheduler.stream_blocks() {
            let range = scheduler.reduce_range(block);
            let units = range.len() * 2;
            for unit in 0..units {
                reduce_stream_k::<i32, i32>(&memory, &scheduler, ws.region(), out.region(), &layout, block, unit, units);
            }
        }

        let c = memory.download::<i32>(out, layout.capacity()).unwrap();
        for block in 0..scheduler.stream_blocks() {
            let pieces = scheduler.block_pieces(block);
            let want: i32 = pieces.iter().map(|p| p.slot as i32 + 1).sum();
            let offset = scheduler.block_offset(&pieces[0].coord);
            let shape = scheduler.actual_block_shape(&pieces[0].coord);
            for r in 0..shape.m {
                for col in 0..shape.n {
                    assert_eq!(c[layout.offset(MatrixCoord::new(offset.m + r, offset.n + col))], want);
                }
            }
        }
        let written = c.iter().filter(|v| **v != 0).count();
        assert_eq!(written, 2 * slot_len);
    }
}
