//! Hardware description of the target accelerator
//!
//! A platform is a set of identical physical cores. Each core has one
//! compute context (matrix unit plus the L1 / L0A / L0B / L0C tiers) and a
//! fixed number of transfer contexts (vector units with a private unified
//! buffer). All cores share global memory behind an L2 cache.

use crate::coord::GemmCoord;
use crate::error::{GemmError, GemmResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

const KIB: usize = 1024;
const MIB: usize = 1024 * 1024;

/// Core counts and per-tier capacities of an accelerator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformDescriptor {
    /// Physical cores available to a launch
    pub core_count: usize,
    /// Transfer contexts paired with each compute context
    pub transfer_units_per_core: usize,
    /// Per-core staging buffer between global memory and L0
    pub l1_bytes: usize,
    pub l0a_bytes: usize,
    pub l0b_bytes: usize,
    /// Accumulator tier
    pub l0c_bytes: usize,
    /// Local buffer of one transfer context
    pub ub_bytes: usize,
    /// Shared cache in front of global memory
    pub l2_bytes: usize,
}

impl PlatformDescriptor {
    pub fn new(core_count: usize, transfer_units_per_core: usize) -> Self {
        Self {
            core_count,
            transfer_units_per_core,
            ..Self::atlas_a2()
        }
    }

    /// 24-core part with 512 KiB L1 and 192 MiB L2
    pub fn atlas_a2() -> Self {
        Self {
            core_count: 24,
            transfer_units_per_core: 2,
            l1_bytes: 512 * KIB,
            l0a_bytes: 64 * KIB,
            l0b_bytes: 64 * KIB,
            l0c_bytes: 128 * KIB,
            ub_bytes: 192 * KIB,
            l2_bytes: 192 * MIB,
        }
    }

    /// Load a platform description from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> GemmResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let platform: Self = serde_json::from_str(&text)?;
        platform.validate()?;
        Ok(platform)
    }

    pub fn validate(&self) -> GemmResult<()> {
        if self.core_count == 0 {
            return Err(GemmError::config("core_count must be at least 1"));
        }
        if self.transfer_units_per_core == 0 {
            return Err(GemmError::config("transfer_units_per_core must be at least 1"));
        }
        Ok(())
    }

    /// Bytes one padding task stages through a transfer context's buffer
    pub fn padding_task_bytes(&self) -> usize {
        self.ub_bytes / 4
    }

    pub fn transfer_unit_count(&self) -> usize {
        self.core_count * self.transfer_units_per_core
    }
}

impl Default for PlatformDescriptor {
    fn default() -> Self {
        Self::atlas_a2()
    }
}

impl fmt::Display for PlatformDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} cores x (1 compute + {} transfer)",
            self.core_count, self.transfer_units_per_core
        )?;
        writeln!(
            f,
            "L1 {} KiB, L0A {} KiB, L0B {} KiB, L0C {} KiB, UB {} KiB",
            self.l1_bytes / KIB,
            self.l0a_bytes / KIB,
            self.l0b_bytes / KIB,
            self.l0c_bytes / KIB,
            self.ub_bytes / KIB
        )?;
        write!(f, "L2 {} MiB", self.l2_bytes / MIB)
    }
}

/// Buffer-slot counts per memory tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageConfig {
    pub l1_stages: usize,
    pub l0a_stages: usize,
    pub l0b_stages: usize,
    pub l0c_stages: usize,
    /// Lookahead depth of the preload pipeline; 0 for ping-pong
    pub preload_stages: usize,
}

impl StageConfig {
    pub const fn ping_pong() -> Self {
        Self {
            l1_stages: 2,
            l0a_stages: 2,
            l0b_stages: 2,
            l0c_stages: 1,
            preload_stages: 0,
        }
    }

    pub const fn preload(l1_stages: usize, preload_stages: usize) -> Self {
        Self {
            l1_stages,
            l0a_stages: 2,
            l0b_stages: 2,
            l0c_stages: 1,
            preload_stages,
        }
    }
}

impl Default for StageConfig {
    fn default() -> Self {
        Self::ping_pong()
    }
}

/// Element widths feeding the capacity check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementSizes {
    pub a: usize,
    pub b: usize,
    pub accumulator: usize,
    /// Present when a bias row is staged through L1
    pub bias: Option<usize>,
}

/// L1 and L0 tile shapes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileConfig {
    pub l1: GemmCoord,
    pub l0: GemmCoord,
}

impl TileConfig {
    pub fn new(l1: GemmCoord, l0: GemmCoord) -> Self {
        Self { l1, l0 }
    }

    /// Check tile nesting and per-tier byte capacities.
    pub fn validate(
        &self,
        platform: &PlatformDescriptor,
        sizes: &ElementSizes,
        stages: &StageConfig,
    ) -> GemmResult<()> {
        let (l1, l0) = (self.l1, self.l0);
        if l1.is_empty() || l0.is_empty() {
            return Err(GemmError::tiling(format!("empty tile shape l1={l1} l0={l0}")));
        }
        if l0.m > l1.m || l0.n > l1.n || l0.k > l1.k {
            return Err(GemmError::tiling(format!(
                "L0 tile {l0} does not fit inside L1 tile {l1}"
            )));
        }
        if stages.l1_stages == 0 || stages.l0a_stages == 0 || stages.l0b_stages == 0 || stages.l0c_stages == 0 {
            return Err(GemmError::tiling("every tier needs at least one stage"));
        }
        if stages.preload_stages > 0 && stages.l1_stages <= stages.preload_stages {
            return Err(GemmError::tiling(format!(
                "preload depth {} needs more than {} L1 stages",
                stages.preload_stages, stages.l1_stages
            )));
        }

        let bias_bytes = sizes.bias.map_or(0, |size| l1.n * size);
        let l1_bytes = (l1.m * l1.k * sizes.a + l1.k * l1.n * sizes.b + bias_bytes) * stages.l1_stages;
        if l1_bytes > platform.l1_bytes {
            return Err(GemmError::capacity("L1", l1_bytes, platform.l1_bytes));
        }
        let l0a_bytes = l0.m * l0.k * sizes.a * stages.l0a_stages;
        if l0a_bytes > platform.l0a_bytes {
            return Err(GemmError::capacity("L0A", l0a_bytes, platform.l0a_bytes));
        }
        let l0b_bytes = l0.k * l0.n * sizes.b * stages.l0b_stages;
        if l0b_bytes > platform.l0b_bytes {
            return Err(GemmError::capacity("L0B", l0b_bytes, platform.l0b_bytes));
        }
        let l0c_bytes = l1.m * l1.n * sizes.accumulator * stages.l0c_stages;
        if l0c_bytes > platform.l0c_bytes {
            return Err(GemmError::capacity("L0C", l0c_bytes, platform.l0c_bytes));
        }
        Ok(())
    }
}

impl fmt::Display for TileConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L1 {} / L0 {}", self.l1, self.l0)
    }
}
