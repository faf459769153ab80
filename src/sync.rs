//! Synchronisation primitives between execution contexts
//!
//! Every hardware flag becomes a counting semaphore: `set` deposits one
//! token, `wait` blocks until it can take one. Cross-class flags are named
//! by direction so a transfer context can only wait on something a compute
//! context is able to signal, and vice versa.

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::Barrier;

/// Counting semaphore
#[derive(Debug, Clone)]
pub struct Event {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl Event {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    /// Signal once
    pub fn set(&self) {
        // The receiver lives in `self`, so the channel never disconnects.
        let _ = self.tx.send(());
    }

    /// Block until one signal is available and take it
    pub fn wait(&self) {
        let _ = self.rx.recv();
    }

    pub fn try_wait(&self) -> bool {
        self.rx.try_recv().is_ok()
    }

    /// Signals deposited and not yet taken
    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

/// Signals a compute context raises for its paired transfer contexts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeSignal {
    /// Every tile this core owns has been written
    Finished,
    /// This core's stream-K partials are in the workspace
    StreamKStored,
}

impl ComputeSignal {
    const fn index(self) -> usize {
        match self {
            ComputeSignal::Finished => 0,
            ComputeSignal::StreamKStored => 1,
        }
    }
}

/// Signals a transfer context raises for its compute context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferSignal {
    /// Operand padding for the whole launch is complete
    PaddingDone,
}

impl TransferSignal {
    const fn index(self) -> usize {
        match self {
            TransferSignal::PaddingDone => 0,
        }
    }
}

/// One tile handed from a compute context to its transfer contexts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpilogueMessage {
    Tile { row: usize, column: usize, rows: usize, cols: usize },
    Done,
}

/// Flags, barriers and epilogue queues for one launch
pub struct CoreSync {
    sub_blocks: usize,
    to_transfer: [Vec<Event>; 2],
    to_compute: [Vec<Event>; 1],
    transfer_barrier: Barrier,
    epilogue: Vec<(Sender<EpilogueMessage>, Receiver<EpilogueMessage>)>,
}

impl CoreSync {
    pub fn new(block_dim: usize, sub_blocks: usize) -> Self {
        let units = block_dim * sub_blocks;
        Self {
            sub_blocks,
            to_transfer: [
                (0..units).map(|_| Event::new()).collect(),
                (0..units).map(|_| Event::new()).collect(),
            ],
            to_compute: [(0..block_dim).map(|_| Event::new()).collect()],
            transfer_barrier: Barrier::new(units),
            epilogue: (0..block_dim).map(|_| unbounded()).collect(),
        }
    }

    /// Raise `signal` towards every transfer context of `core`
    pub fn signal_transfer(&self, core: usize, signal: ComputeSignal) {
        let events = &self.to_transfer[signal.index()];
        for sub in 0..self.sub_blocks {
            events[core * self.sub_blocks + sub].set();
        }
    }

    /// Wait, on transfer context `unit`, for its compute context's `signal`
    pub fn wait_compute(&self, unit: usize, signal: ComputeSignal) {
        self.to_transfer[signal.index()][unit].wait();
    }

    /// Raise `signal` from transfer context `unit` towards its compute context
    pub fn signal_compute(&self, unit: usize, signal: TransferSignal) {
        self.to_compute[signal.index()][unit / self.sub_blocks].set();
    }

    /// Wait, on compute context `core`, until all its transfer contexts raised `signal`
    pub fn wait_transfer(&self, core: usize, signal: TransferSignal) {
        let event = &self.to_compute[signal.index()][core];
        for _ in 0..self.sub_blocks {
            event.wait();
        }
    }

    /// Rendezvous of all transfer contexts of the launch
    pub fn transfer_barrier(&self) {
        self.transfer_barrier.wait();
    }

    /// Queue a finished tile for the transfer contexts of `core`
    pub fn push_epilogue(&self, core: usize, message: EpilogueMessage) {
        let _ = self.epilogue[core].0.send(message);
    }

    /// Tell every transfer context of `core` that no more tiles follow
    pub fn close_epilogue(&self, core: usize) {
        for _ in 0..self.sub_blocks {
            self.push_epilogue(core, EpilogueMessage::Done);
        }
    }

    /// Next tile for a transfer context of `core`; blocks until one arrives
    pub fn next_epilogue(&self, core: usize) -> EpilogueMessage {
        self.epilogue[core].1.recv().unwrap_or(EpilogueMessage::Done)
    }
}
