//! Execution-context launcher
//!
//! A launch of `block_dim` cores starts one compute context and
//! `sub_blocks` transfer contexts per core, all running the same entry
//! function and branching on their role.

use crate::error::GemmResult;
use std::thread;
use tracing::debug;

/// Which unit of a core a context runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreRole {
    Compute,
    Transfer { sub_idx: usize },
}

/// Identity of one execution context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecContext {
    pub core_idx: usize,
    pub block_dim: usize,
    pub sub_blocks: usize,
    pub role: CoreRole,
}

impl ExecContext {
    /// Global index among all transfer contexts of the launch
    pub fn transfer_idx(&self) -> Option<usize> {
        match self.role {
            CoreRole::Transfer { sub_idx } => Some(self.core_idx * self.sub_blocks + sub_idx),
            CoreRole::Compute => None,
        }
    }

    pub fn transfer_count(&self) -> usize {
        self.block_dim * self.sub_blocks
    }
}

/// Starts every context of a launch and waits for all of them
pub trait Launcher {
    fn launch(&self, block_dim: usize, sub_blocks: usize, body: &(dyn Fn(ExecContext) + Sync)) -> GemmResult<()>;
}

/// One OS thread per execution context
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadLauncher;

impl Launcher for ThreadLauncher {
    fn launch(&self, block_dim: usize, sub_blocks: usize, body: &(dyn Fn(ExecContext) + Sync)) -> GemmResult<()> {
        debug!(block_dim, sub_blocks, "launch");
        thread::scope(|scope| -> GemmResult<()> {
            let mut handles = Vec::with_capacity(block_dim * (sub_blocks + 1));
            for core_idx in 0..block_dim {
                let roles = std::iter::once(CoreRole::Compute)
                    .chain((0..sub_blocks).map(|sub_idx| CoreRole::Transfer { sub_idx }));
                for role in roles {
                    let context = ExecContext {
                        core_idx,
                        block_dim,
                        sub_blocks,
                        role,
                    };
                    let name = match role {
                        CoreRole::Compute => format!("aic-{core_idx}"),
                        CoreRole::Transfer { sub_idx } => format!("aiv-{core_idx}.{sub_idx}"),
                    };
                    let handle = thread::Builder::new()
                        .name(name)
                        .spawn_scoped(scope, move || body(context))?;
                    handles.push(handle);
                }
            }
            for handle in handles {
                if let Err(panic) = handle.join() {
                    std::panic::resume_unwind(panic);
                }
            }
            Ok(())
        })
    }
}
