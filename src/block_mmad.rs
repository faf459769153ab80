//! Block matrix-multiply-accumulate pipelines
//!
//! A compute context multiplies one output tile at a time. The K extent of
//! a tile is walked in L1-sized steps; each step's A and B panels are
//! copied into a ring of L1 stage slots by an asynchronous copy queue while
//! the compute context multiplies the previous step, and each step is then
//! cut into L0 sub-tiles that are multiplied into the accumulator.
//!
//! Slots hand over through a `produced` / `consumed` event pair and carry a
//! checked state:
//!
//! ```text
//! Idle -> Loading -> ReadyToMultiply -> Multiplying -> ReadyToDrain -> Draining -> Idle
//! ```
//!
//! Operand slots leave `Multiplying` straight back to `Idle`; only the
//! accumulator goes through the drain states.
//!
//! Two pipelines are built on the same stage machinery:
//!
//! - [`PingPongMmad`]: two-deep lookahead inside a tile, the tile is
//!   drained before `run` returns
//! - [`PreloadAsyncMmad`]: lookahead crosses tile boundaries, so a tile is
//!   only computed and drained during a later `run` or `synchronize`;
//!   callbacks fire around each drain

use crate::coord::{ceil_div, GemmCoord, MatrixCoord};
use crate::element::{Accumulator, Element};
use crate::hardware::{StageConfig, TileConfig};
use crate::layout::Layout;
use crate::memory::{DeviceMemory, Region};
use crate::scheduler::WriteMode;
use crate::sync::Event;
use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::Scope;
use tracing::trace;

/// Stage slot state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotState {
    Idle = 0,
    Loading = 1,
    ReadyToMultiply = 2,
    Multiplying = 3,
    ReadyToDrain = 4,
    Draining = 5,
}

impl SlotState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SlotState::Loading,
            2 => SlotState::ReadyToMultiply,
            3 => SlotState::Multiplying,
            4 => SlotState::ReadyToDrain,
            5 => SlotState::Draining,
            _ => SlotState::Idle,
        }
    }

    /// Whether `next` may directly follow `self`
    pub fn can_follow(self, next: SlotState) -> bool {
        matches!(
            (self, next),
            (SlotState::Idle, SlotState::Loading)
                | (SlotState::Loading, SlotState::ReadyToMultiply)
                | (SlotState::ReadyToMultiply, SlotState::Multiplying)
                | (SlotState::Multiplying, SlotState::ReadyToDrain)
                | (SlotState::Multiplying, SlotState::Idle)
                | (SlotState::ReadyToDrain, SlotState::Draining)
                | (SlotState::Draining, SlotState::Idle)
        )
    }
}

/// Atomic holder of a [`SlotState`]
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(SlotState::Idle as u8))
    }

    pub fn get(&self) -> SlotState {
        SlotState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move to `next`, which must be a legal successor of the current state
    pub fn advance(&self, next: SlotState) {
        let previous = SlotState::from_u8(self.0.swap(next as u8, Ordering::AcqRel));
        debug_assert!(
            previous.can_follow(next),
            "illegal slot transition {previous:?} -> {next:?}"
        );
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

/// One L1 buffer of an operand ring
#[derive(Debug)]
pub struct StageSlot<E> {
    buffer: Mutex<Vec<E>>,
    /// A load into this slot finished
    produced: Event,
    /// The slot may be overwritten
    consumed: Event,
    state: StateCell,
}

impl<E: Element> StageSlot<E> {
    fn new(capacity: usize) -> Self {
        let slot = Self {
            buffer: Mutex::new(Vec::with_capacity(capacity)),
            produced: Event::new(),
            consumed: Event::new(),
            state: StateCell::new(),
        };
        slot.consumed.set();
        slot
    }

    pub fn state(&self) -> SlotState {
        self.state.get()
    }
}

/// Background thread that plays the load pipe of one compute context
pub struct CopyQueue<'scope> {
    tx: Sender<Box<dyn FnOnce() + Send + 'scope>>,
}

impl<'scope> CopyQueue<'scope> {
    /// Start the queue thread inside `scope`; it exits once the queue is dropped.
    pub fn spawn<'env>(scope: &'scope Scope<'scope, 'env>) -> Self {
        let (tx, rx) = unbounded::<Box<dyn FnOnce() + Send + 'scope>>();
        scope.spawn(move || {
            for job in rx {
                job();
            }
        });
        Self { tx }
    }

    pub fn submit(&self, job: impl FnOnce() + Send + 'scope) {
        // The queue thread only exits once this sender is gone.
        let _ = self.tx.send(Box::new(job));
    }
}

/// A whole operand as the compute context sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperandView {
    pub region: Region,
    pub layout: Layout,
}

/// Where a finished accumulator tile goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainTarget {
    /// Output elements, narrowed from the accumulator
    Output {
        region: Region,
        layout: Layout,
        origin: MatrixCoord,
    },
    /// Accumulator-typed workspace, no narrowing
    Workspace {
        region: Region,
        layout: Layout,
        origin: MatrixCoord,
    },
}

/// One tile of work for a block MMA
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmadTile {
    /// Element offsets of the tile's first row, column and K index
    pub offset: GemmCoord,
    /// Clipped extents
    pub shape: GemmCoord,
    /// Bias row, indexed by absolute column; only set on the piece that
    /// starts at K = 0
    pub bias: Option<Region>,
    pub target: DrainTarget,
    pub write: WriteMode,
}

/// Hooks around the drain of one tile
#[derive(Default)]
pub struct DrainCallbacks<'a> {
    pub before: Option<Box<dyn FnOnce() + 'a>>,
    pub after: Option<Box<dyn FnOnce() + 'a>>,
}

/// A block MMA pipeline
pub trait BlockMmad<'a> {
    /// Multiply one tile, firing `callbacks` around its drain. Depending on
    /// the pipeline the tile may still be in flight when this returns.
    fn run_with_callbacks(&mut self, tile: MmadTile, callbacks: DrainCallbacks<'a>);

    fn run(&mut self, tile: MmadTile) {
        self.run_with_callbacks(tile, DrainCallbacks::default());
    }

    /// Finish every tile handed to `run`
    fn synchronize(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ResidencyKey {
    buffer: usize,
    base: usize,
    origin: MatrixCoord,
    extent: MatrixCoord,
}

/// Compute-side bookkeeping of one operand ring
struct Ring<E> {
    slots: Vec<Arc<StageSlot<E>>>,
    keys: Vec<Option<ResidencyKey>>,
    held: Vec<bool>,
    next: usize,
}

impl<E: Element> Ring<E> {
    fn new(stages: usize, capacity: usize) -> Self {
        Self {
            slots: (0..stages).map(|_| Arc::new(StageSlot::new(capacity))).collect(),
            keys: vec![None; stages],
            held: vec![false; stages],
            next: 0,
        }
    }

    /// Slot to use for `key`: a resident copy if there is one, else the next
    /// slot not referenced by any in-flight step
    fn acquire(&mut self, key: ResidencyKey, busy: &[usize]) -> (usize, bool) {
        if let Some(slot) = self.keys.iter().position(|k| *k == Some(key)) {
            return (slot, false);
        }
        let stages = self.slots.len();
        let slot = (0..stages)
            .map(|i| (self.next + i) % stages)
            .find(|s| !busy.contains(s))
            .unwrap_or(self.next);
        self.next = (slot + 1) % stages;
        self.keys[slot] = Some(key);
        self.held[slot] = true;
        (slot, true)
    }
}

/// One K step, planned and with its loads issued
#[derive(Debug, Clone, Copy)]
struct StepPlan {
    tile: usize,
    k_len: usize,
    first: bool,
    last: bool,
    a_slot: usize,
    a_loaded: bool,
    b_slot: usize,
    b_loaded: bool,
}

struct PendingTile<'a> {
    id: usize,
    tile: MmadTile,
    callbacks: DrainCallbacks<'a>,
}

/// Stage rings, accumulator and copy queue shared by both pipelines
struct StagedEngine<'a, E: Element, O> {
    memory: &'a DeviceMemory,
    queue: CopyQueue<'a>,
    a: OperandView,
    b: OperandView,
    tiles: TileConfig,
    lookahead: usize,
    ring_a: Ring<E>,
    ring_b: Ring<E>,
    window: VecDeque<StepPlan>,
    pending: VecDeque<PendingTile<'a>>,
    next_tile: usize,
    accumulator: Vec<E::Accumulator>,
    accumulator_state: StateCell,
    l0a: Vec<E::Accumulator>,
    l0b: Vec<E::Accumulator>,
    _output: std::marker::PhantomData<O>,
}

impl<'a, E, O> StagedEngine<'a, E, O>
where
    E: Element,
    O: Element<Accumulator = E::Accumulator>,
{
    fn new<'env>(
        scope: &'a Scope<'a, 'env>,
        memory: &'a DeviceMemory,
        a: OperandView,
        b: OperandView,
        tiles: TileConfig,
        stages: StageConfig,
        lookahead: usize,
    ) -> Self {
        let l1 = tiles.l1;
        let l0 = tiles.l0;
        let ring_stages = stages.l1_stages.max(lookahead + 1);
        Self {
            memory,
            queue: CopyQueue::spawn(scope),
            a,
            b,
            tiles,
            lookahead,
            ring_a: Ring::new(ring_stages, l1.m * l1.k),
            ring_b: Ring::new(ring_stages, l1.k * l1.n),
            window: VecDeque::new(),
            pending: VecDeque::new(),
            next_tile: 0,
            accumulator: vec![<E::Accumulator as Accumulator>::zero(); l1.m * l1.n],
            accumulator_state: StateCell::new(),
            l0a: Vec::with_capacity(l0.m * l0.k),
            l0b: Vec::with_capacity(l0.k * l0.n),
            _output: std::marker::PhantomData,
        }
    }

    fn enqueue(&mut self, tile: MmadTile, callbacks: DrainCallbacks<'a>) {
        let id = self.next_tile;
        self.next_tile += 1;
        self.pending.push_back(PendingTile { id, tile, callbacks });

        let k1 = self.tiles.l1.k;
        let steps = ceil_div(tile.shape.k, k1).max(1);
        for step in 0..steps {
            let k_lo = tile.offset.k + step * k1;
            let k_len = k1.min(tile.shape.k - step * k1);
            self.push_step(id, &tile, k_lo, k_len, step == 0, step + 1 == steps);
            while self.window.len() > self.lookahead {
                self.compute_front();
            }
        }
    }

    fn flush(&mut self) {
        while !self.window.is_empty() {
            self.compute_front();
        }
    }

    fn push_step(&mut self, id: usize, tile: &MmadTile, k_lo: usize, k_len: usize, first: bool, last: bool) {
        let busy_a: Vec<usize> = self.window.iter().map(|p| p.a_slot).collect();
        let busy_b: Vec<usize> = self.window.iter().map(|p| p.b_slot).collect();

        let a_origin = MatrixCoord::new(tile.offset.m, k_lo);
        let a_extent = MatrixCoord::new(tile.shape.m, k_len);
        let a_key = residency_key(&self.a, a_origin, a_extent);
        let (a_slot, a_loaded) = self.ring_a.acquire(a_key, &busy_a);
        if a_loaded {
            self.load(Operand::A, a_slot, a_origin, a_extent);
        }

        let b_origin = MatrixCoord::new(k_lo, tile.offset.n);
        let b_extent = MatrixCoord::new(k_len, tile.shape.n);
        let b_key = residency_key(&self.b, b_origin, b_extent);
        let (b_slot, b_loaded) = self.ring_b.acquire(b_key, &busy_b);
        if b_loaded {
            self.load(Operand::B, b_slot, b_origin, b_extent);
        }

        trace!(tile = id, k_lo, k_len, a_slot, a_loaded, b_slot, b_loaded, "step planned");
        self.window.push_back(StepPlan {
            tile: id,
            k_len,
            first,
            last,
            a_slot,
            a_loaded,
            b_slot,
            b_loaded,
        });
    }

    fn load(&self, operand: Operand, slot: usize, origin: MatrixCoord, extent: MatrixCoord) {
        let (view, slot) = match operand {
            Operand::A => (self.a, Arc::clone(&self.ring_a.slots[slot])),
            Operand::B => (self.b, Arc::clone(&self.ring_b.slots[slot])),
        };
        let memory = self.memory;
        self.queue.submit(move || {
            slot.consumed.wait();
            slot.state.advance(SlotState::Loading);
            {
                let mut buffer = slot.buffer.lock();
                buffer.clear();
                let base = view.region.base::<E>();
                memory.read::<E, _>(view.region.handle, |elements| {
                    for r in 0..extent.row {
                        for c in 0..extent.column {
                            let at = view.layout.offset(origin + MatrixCoord::new(r, c));
                            buffer.push(elements.get(base + at));
                        }
                    }
                });
            }
            slot.state.advance(SlotState::ReadyToMultiply);
            slot.produced.set();
        });
    }

    fn compute_front(&mut self) {
        let Some(plan) = self.window.pop_front() else {
            return;
        };
        let Some(pending) = self.pending.iter().find(|p| p.id == plan.tile) else {
            return;
        };
        let tile = pending.tile;

        let slot_a = Arc::clone(&self.ring_a.slots[plan.a_slot]);
        let slot_b = Arc::clone(&self.ring_b.slots[plan.b_slot]);
        for (slot, loaded) in [(&slot_a, plan.a_loaded), (&slot_b, plan.b_loaded)] {
            if loaded {
                slot.produced.wait();
                slot.state.advance(SlotState::Multiplying);
            }
        }

        if plan.first {
            self.init_accumulator(&tile);
        }
        {
            let a = slot_a.buffer.lock();
            let b = slot_b.buffer.lock();
            self.multiply(&a, &b, tile.shape.m, tile.shape.n, plan.k_len);
        }

        self.release(plan);
        if plan.last {
            self.accumulator_state.advance(SlotState::ReadyToDrain);
            if let Some(index) = self.pending.iter().position(|p| p.id == plan.tile) {
                if let Some(done) = self.pending.remove(index) {
                    self.drain(done);
                }
            }
        }
    }

    /// Hand slots back to the copy queue unless a queued step still reads them
    fn release(&mut self, plan: StepPlan) {
        let still_a = self.window.iter().any(|p| p.a_slot == plan.a_slot);
        if !still_a && self.ring_a.held[plan.a_slot] {
            self.ring_a.held[plan.a_slot] = false;
            let slot = &self.ring_a.slots[plan.a_slot];
            slot.state.advance(SlotState::Idle);
            slot.consumed.set();
        }
        let still_b = self.window.iter().any(|p| p.b_slot == plan.b_slot);
        if !still_b && self.ring_b.held[plan.b_slot] {
            self.ring_b.held[plan.b_slot] = false;
            let slot = &self.ring_b.slots[plan.b_slot];
            slot.state.advance(SlotState::Idle);
            slot.consumed.set();
        }
    }

    /// Zero or bias, on the tile's first K step
    fn init_accumulator(&mut self, tile: &MmadTile) {
        self.accumulator_state.advance(SlotState::Loading);
        let n1 = self.tiles.l1.n;
        let (rows, cols) = (tile.shape.m, tile.shape.n);
        let zero = <E::Accumulator as Accumulator>::zero();
        match tile.bias {
            Some(bias) => {
                let base = bias.base::<O>();
                let row: Vec<E::Accumulator> = self.memory.read::<O, _>(bias.handle, |elements| {
                    (0..cols)
                        .map(|c| elements.get(base + tile.offset.n + c).to_acc())
                        .collect()
                });
                for r in 0..rows {
                    self.accumulator[r * n1..r * n1 + cols].copy_from_slice(&row);
                }
            }
            None => {
                for r in 0..rows {
                    self.accumulator[r * n1..r * n1 + cols].fill(zero);
                }
            }
        }
        self.accumulator_state.advance(SlotState::ReadyToMultiply);
        self.accumulator_state.advance(SlotState::Multiplying);
    }

    /// Multiply an L1 step through L0 sub-tiles. Every accumulator element
    /// sees its K terms in ascending order.
    fn multiply(&mut self, a: &[E], b: &[E], rows: usize, cols: usize, k_len: usize) {
        let l0 = self.tiles.l0;
        let n1 = self.tiles.l1.n;
        for m0 in (0..rows).step_by(l0.m) {
            let mr = l0.m.min(rows - m0);
            for n0 in (0..cols).step_by(l0.n) {
                let nr = l0.n.min(cols - n0);
                for k0 in (0..k_len).step_by(l0.k) {
                    let kr = l0.k.min(k_len - k0);
                    self.l0a.clear();
                    for r in 0..mr {
                        let row = (m0 + r) * k_len + k0;
                        self.l0a.extend(a[row..row + kr].iter().map(|v| v.to_acc()));
                    }
                    self.l0b.clear();
                    for kk in 0..kr {
                        let row = (k0 + kk) * cols + n0;
                        self.l0b.extend(b[row..row + nr].iter().map(|v| v.to_acc()));
                    }
                    for r in 0..mr {
                        for c in 0..nr {
                            let out = &mut self.accumulator[(m0 + r) * n1 + n0 + c];
                            let mut acc = *out;
                            for kk in 0..kr {
                                acc = acc.mul_add(self.l0a[r * kr + kk], self.l0b[kk * nr + c]);
                            }
                            *out = acc;
                        }
                    }
                }
            }
        }
    }

    fn drain(&mut self, done: PendingTile<'a>) {
        let PendingTile { id, tile, callbacks } = done;
        if let Some(before) = callbacks.before {
            before();
        }
        self.accumulator_state.advance(SlotState::Draining);
        let n1 = self.tiles.l1.n;
        let (rows, cols) = (tile.shape.m, tile.shape.n);
        match tile.target {
            DrainTarget::Output { region, layout, origin } => {
                drain_tile::<O>(self.memory, region, &layout, origin, &self.accumulator, n1, rows, cols, tile.write)
            }
            DrainTarget::Workspace { region, layout, origin } => drain_tile::<E::Accumulator>(
                self.memory,
                region,
                &layout,
                origin,
                &self.accumulator,
                n1,
                rows,
                cols,
                tile.write,
            ),
        }
        self.accumulator_state.advance(SlotState::Idle);
        trace!(tile = id, m = tile.offset.m, n = tile.offset.n, k = tile.offset.k, "drained");
        if let Some(after) = callbacks.after {
            after();
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Operand {
    A,
    B,
}

fn residency_key(view: &OperandView, origin: MatrixCoord, extent: MatrixCoord) -> ResidencyKey {
    ResidencyKey {
        buffer: view.region.handle.id(),
        base: view.region.offset,
        origin,
        extent,
    }
}

/// Write `rows x cols` accumulators (row pitch `pitch`) into `region`.
/// The only place element narrowing happens.
#[allow(clippy::too_many_arguments)]
fn drain_tile<T: Element>(
    memory: &DeviceMemory,
    region: Region,
    layout: &Layout,
    origin: MatrixCoord,
    accumulator: &[T::Accumulator],
    pitch: usize,
    rows: usize,
    cols: usize,
    write: WriteMode,
) {
    let base = region.base::<T>();
    memory.write::<T, _>(region.handle, |elements| {
        for r in 0..rows {
            for c in 0..cols {
                let at = base + layout.offset(origin + MatrixCoord::new(r, c));
                let value = accumulator[r * pitch + c];
                let value = match write {
                    WriteMode::Overwrite => value,
                    WriteMode::Accumulate => elements.get(at).to_acc().add(value),
                };
                elements.set(at, T::from_acc(value));
            }
        }
    });
}

/// Two-deep pipeline, synchronous at tile boundaries
pub struct PingPongMmad<'a, E: Element, O> {
    engine: StagedEngine<'a, E, O>,
}

impl<'a, E, O> PingPongMmad<'a, E, O>
where
    E: Element,
    O: Element<Accumulator = E::Accumulator>,
{
    pub fn new<'env>(
        scope: &'a Scope<'a, 'env>,
        memory: &'a DeviceMemory,
        a: OperandView,
        b: OperandView,
        tiles: TileConfig,
        stages: StageConfig,
    ) -> Self {
        Self {
            engine: StagedEngine::new(scope, memory, a, b, tiles, stages, 1),
        }
    }
}

impl<'a, E, O> BlockMmad<'a> for PingPongMmad<'a, E, O>
where
    E: Element,
    O: Element<Accumulator = E::Accumulator>,
{
    fn run_with_callbacks(&mut self, tile: MmadTile, callbacks: DrainCallbacks<'a>) {
        self.engine.enqueue(tile, callbacks);
        self.engine.flush();
    }

    fn synchronize(&mut self) {
        self.engine.flush();
    }
}

/// Lookahead pipeline whose loads run ahead across tiles. A tile is drained
/// once later work pushes it out of the lookahead window, or on
/// `synchronize`.
pub struct PreloadAsyncMmad<'a, E: Element, O> {
    engine: StagedEngine<'a, E, O>,
}

impl<'a, E, O> PreloadAsyncMmad<'a, E, O>
where
    E: Element,
    O: Element<Accumulator = E::Accumulator>,
{
    /// `stages.preload_stages` K steps are kept in flight
    pub fn new<'env>(
        scope: &'a Scope<'a, 'env>,
        memory: &'a DeviceMemory,
        a: OperandView,
        b: OperandView,
        tiles: TileConfig,
        stages: StageConfig,
    ) -> Self {
        let lookahead = stages.preload_stages.max(1);
        Self {
            engine: StagedEngine::new(scope, memory, a, b, tiles, stages, lookahead),
        }
    }
}

impl<'a, E, O> BlockMmad<'a> for PreloadAsyncMmad<'a, E, O>
where
    E: Element,
    O: Element<Accumulator = E::Accumulator>,
{
    fn run_with_callbacks(&mut self, tile: MmadTile, callbacks: DrainCallbacks<'a>) {
        self.engine.enqueue(tile, callbacks);
    }

    fn synchronize(&mut self) {
        self.engine.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Allocator;
    use crate::reference::reference_gemm;
    use pretty_assertions::assert_eq;
    use std::cell::RefCell;
    use std::thread;

    struct Fixture {
        memory: DeviceMemory,
        a: OperandView,
        b: OperandView,
        c: Region,
        c_layout: Layout,
        a_host: Vec<i32>,
        b_host: Vec<i32>,
        problem: GemmCoord,
    }

    fn fixture(problem: GemmCoord) -> Fixture {
        let memory = DeviceMemory::new();
        let a_layout = Layout::row_major(problem.m, problem.k);
        let b_layout = Layout::column_major(problem.k, problem.n);
        let a_host: Vec<i32> = (0..a_layout.capacity() as i32).map(|i| i % 7 - 3).collect();
        let b_host: Vec<i32> = (0..b_layout.capacity() as i32).map(|i| i % 5 - 2).collect();
        let a = OperandView {
            region: memory.upload(&a_host).region(),
            layout: a_layout,
        };
        let b = OperandView {
            region: memory.upload(&b_host).region(),
            layout: b_layout,
        };
        let c_layout = Layout::row_major(problem.m, problem.n);
        let c = memory.allocate(c_layout.capacity() * 4).region();
        Fixture {
            memory,
            a,
            b,
            c,
            c_layout,
            a_host,
            b_host,
            problem,
        }
    }

    fn whole_tile(f: &Fixture, write: WriteMode) -> MmadTile {
        MmadTile {
            offset: GemmCoord::new(0, 0, 0),
            shape: f.problem,
            bias: None,
            target: DrainTarget::Output {
                region: f.c,
                layout: f.c_layout,
                origin: MatrixCoord::new(0, 0),
            },
            write,
        }
    }

    fn tiles() -> TileConfig {
        TileConfig::new(GemmCoord::new(32, 32, 16), GemmCoord::new(16, 16, 8))
    }

    #[test]
    fn test_slot_transitions() {
        assert!(SlotState::Idle.can_follow(SlotState::Loading));
        assert!(SlotState::Multiplying.can_follow(SlotState::Idle));
        assert!(!SlotState::Idle.can_follow(SlotState::Multiplying));
        assert!(!SlotState::Loading.can_follow(SlotState::Draining));
        let cell = StateCell::new();
        cell.advance(SlotState::Loading);
        cell.advance(SlotState::ReadyToMultiply);
        assert_eq!(cell.get(), SlotState::ReadyToMultiply);
    }

    #[test]
    fn test_ping_pong_matches_reference() {
        let f = fixture(GemmCoord::new(20, 30, 70));
        thread::scope(|scope| {
            let mut mmad =
                PingPongMmad::<i32, i32>::new(scope, &f.memory, f.a, f.b, tiles(), StageConfig::ping_pong());
            mmad.run(whole_tile(&f, WriteMode::Overwrite));
            mmad.synchronize();
        });
        let got = f.memory.download::<i32>(f.c.handle, 20 * 30).unwrap();
        let want = reference_gemm::<i32, i32>(&f.a_host, &f.a.layout, &f.b_host, &f.b.layout, None, f.problem);
        assert_eq!(got, want);
    }

    #[test]
    fn test_accumulating_drain_adds() {
        let f = fixture(GemmCoord::new(8, 8, 16));
        thread::scope(|scope| {
            let mut mmad =
                PingPongMmad::<i32, i32>::new(scope, &f.memory, f.a, f.b, tiles(), StageConfig::ping_pong());
            mmad.run(whole_tile(&f, WriteMode::Overwrite));
            mmad.run(whole_tile(&f, WriteMode::Accumulate));
        });
        let got = f.memory.download::<i32>(f.c.handle, 64).unwrap();
        let want = reference_gemm::<i32, i32>(&f.a_host, &f.a.layout, &f.b_host, &f.b.layout, None, f.problem);
        let doubled: Vec<i32> = want.iter().map(|v| v * 2).collect();
        assert_eq!(got, doubled);
    }

    #[test]
    fn test_preload_defers_drain_until_synchronize() {
        let f = fixture(GemmCoord::new(16, 16, 16));
        let events = RefCell::new(Vec::new());
        thread::scope(|scope| {
            let mut mmad = PreloadAsyncMmad::<i32, i32>::new(
                scope,
                &f.memory,
                f.a,
                f.b,
                tiles(),
                StageConfig::preload(2, 1),
            );
            mmad.run_with_callbacks(
                whole_tile(&f, WriteMode::Overwrite),
                DrainCallbacks {
                    before: Some(Box::new(|| events.borrow_mut().push("before"))),
                    after: Some(Box::new(|| events.borrow_mut().push("after"))),
                },
            );
            // one K step, still inside the lookahead window
            assert!(events.borrow().is_empty());
            mmad.synchronize();
            assert_eq!(*events.borrow(), vec!["before", "after"]);
        });
    }

    #[test]
    fn test_bias_initialises_accumulator() {
        let f = fixture(GemmCoord::new(4, 5, 16));
        let bias_host: Vec<i32> = vec![100, 200, 300, 400, 500];
        let bias = f.memory.upload(&bias_host).region();
        thread::scope(|scope| {
            let mut mmad =
                PingPongMmad::<i32, i32>::new(scope, &f.memory, f.a, f.b, tiles(), StageConfig::ping_pong());
            let mut tile = whole_tile(&f, WriteMode::Overwrite);
            tile.bias = Some(bias);
            mmad.run(tile);
        });
        let got = f.memory.download::<i32>(f.c.handle, 20).unwrap();
        let want = reference_gemm::<i32, i32>(
            &f.a_host,
            &f.a.layout,
            &f.b_host,
            &f.b.layout,
            Some(bias_host.as_slice()),
            f.problem,
        );
        assert_eq!(got, want);
    }

    #[test]
    fn test_resident_operand_is_not_reloaded() {
        let mut ring: Ring<f32> = Ring::new(2, 16);
        let key = ResidencyKey {
            buffer: 0,
            base: 0,
            origin: MatrixCoord::new(0, 0),
            extent: MatrixCoord::new(4, 4),
        };
        let other = ResidencyKey {
            origin: MatrixCoord::new(4, 0),
            ..key
        };
        assert_eq!(ring.acquire(key, &[]), (0, true));
        assert_eq!(ring.acquire(other, &[0]), (1, true));
        assert_eq!(ring.acquire(key, &[1]), (0, false));
    }
}
