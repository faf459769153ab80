//! Bandwidth cost model used by the padding decision
//!
//! The selector estimates, per operand, how fast the compute context can
//! stream tiles straight out of the operand's natural layout and compares
//! that against first rewriting the operand on the transfer contexts. The
//! coefficients below are curve fits of measured copy bandwidth and are
//! plain data: load a different table with [`CostModel::from_json_file`].

use crate::error::GemmResult;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Polynomial `c[0] + c[1] x + c[2] x^2 + ...`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Polynomial(pub Vec<f64>);

impl Polynomial {
    pub fn eval(&self, x: f64) -> f64 {
        self.0.iter().rev().fold(0.0, |acc, c| acc * x + c)
    }
}

/// Scale applied when the source row pitch is a multiple of `alignment` elements
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignmentScale {
    pub alignment: usize,
    pub scale: f64,
}

/// Correction for short bursts: applied when the burst width is a multiple
/// of `width_multiple` and fewer than `below` rows are copied per burst.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowCountCorrection {
    pub width_multiple: usize,
    pub below: usize,
    pub factor: Polynomial,
}

/// Injectable bandwidth table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostModel {
    /// GB/s for a burst of `d` contiguous elements from an unaligned source
    pub unaligned: Polynomial,
    /// GB/s when the burst is the whole row and 128-aligned (or 16..=64 and 8-aligned)
    pub aligned_bandwidth: f64,
    /// Added for whole-row bursts that are 64-aligned
    pub boost_64: f64,
    /// Added for whole-row bursts that are 32-aligned
    pub boost_32: f64,
    /// Row pitch at or beyond which bursts degrade to `huge_pitch_bandwidth`
    pub huge_pitch: usize,
    pub huge_pitch_bandwidth: f64,
    /// Checked in order, first match wins
    pub pitch_scales: Vec<AlignmentScale>,
    /// Checked in order, first width match wins
    pub row_corrections: Vec<RowCountCorrection>,
    /// Aggregate read bandwidth of all compute contexts, GB/s
    pub aggregate_bandwidth: f64,
    /// Per-unit GB/s of the padding pass when the operand fits in L2
    pub transfer_bandwidth: f64,
    /// Same, when it does not
    pub transfer_bandwidth_l2_miss: f64,
    /// Launch overhead of a padding pass: `base + per_core * used / cores` µs
    pub head_cost_base_us: f64,
    pub head_cost_per_core_us: f64,
    /// Extra overhead when both operands are padded
    pub dual_padding_us: f64,
    /// Local buffer bytes one padding task may use
    pub padding_task_bytes: usize,
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            unaligned: Polynomial(vec![
                4.295633544322609,
                0.3035859339962211,
                -0.0015784588599109292,
                0.000006657887925107158,
                -0.00000001611519890867614,
                0.000000000019396510970002,
                -0.000000000000009004592101,
            ]),
            aligned_bandwidth: 95.0,
            boost_64: 40.0,
            boost_32: 17.0,
            huge_pitch: 65536,
            huge_pitch_bandwidth: 1.0,
            pitch_scales: vec![
                AlignmentScale { alignment: 128, scale: 100.0 / 40.0 },
                AlignmentScale { alignment: 64, scale: 80.0 / 40.0 },
                AlignmentScale { alignment: 32, scale: 60.0 / 40.0 },
                AlignmentScale { alignment: 16, scale: 50.0 / 40.0 },
            ],
            row_corrections: vec![
                RowCountCorrection {
                    width_multiple: 256,
                    below: 16,
                    factor: Polynomial(vec![0.015569563581479779, 0.13718894235979967, -0.004727824537240172]),
                },
                RowCountCorrection {
                    width_multiple: 32,
                    below: 32,
                    factor: Polynomial(vec![0.009854896921994448, 0.055534598197727145, -0.0008410977863908918]),
                },
                RowCountCorrection {
                    width_multiple: 1,
                    below: 64,
                    factor: Polynomial(vec![
                        0.014540735965952572,
                        0.03868377611449111,
                        -0.0004494844311314906,
                        0.0000011791112126816647,
                    ]),
                },
            ],
            aggregate_bandwidth: 1.6 * 1024.0,
            transfer_bandwidth: 30.0,
            transfer_bandwidth_l2_miss: 10.0,
            head_cost_base_us: 1.0,
            head_cost_per_core_us: 7.0,
            dual_padding_us: 2.0,
            padding_task_bytes: 48 * 1024,
        }
    }
}

impl CostModel {
    pub fn from_json_file(path: impl AsRef<Path>) -> GemmResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Per-core bandwidth ceiling
    pub fn core_ceiling(&self, core_count: usize) -> f64 {
        self.aggregate_bandwidth / core_count.max(1) as f64
    }

    /// Estimated GB/s for copying `rows` bursts of `width` elements out of
    /// a source whose row pitch is `pitch` elements.
    pub fn bandwidth(&self, rows: usize, width: usize, pitch: usize, ceiling: f64) -> f64 {
        let mut band = self.unaligned.eval(width as f64);

        if width == pitch {
            if (16..=64).contains(&width) && width % 8 == 0 {
                band = self.aligned_bandwidth;
            } else if width % 128 == 0 {
                band = self.aligned_bandwidth;
            } else if width % 64 == 0 {
                band += self.boost_64;
            } else if width % 32 == 0 {
                band += self.boost_32;
            }
        }

        if pitch >= self.huge_pitch {
            band = self.huge_pitch_bandwidth;
        }

        if let Some(scale) = self
            .pitch_scales
            .iter()
            .find(|s| s.alignment > 0 && pitch % s.alignment == 0)
        {
            band *= scale.scale;
        }

        band = band.min(ceiling);

        if let Some(correction) = self
            .row_corrections
            .iter()
            .find(|c| c.width_multiple > 0 && width % c.width_multiple == 0)
        {
            if rows < correction.below {
                band *= correction.factor.eval(rows as f64);
            }
        }
        band
    }

    /// Bandwidth of the padding pass for an operand of `bytes`
    pub fn transfer_bandwidth_for(&self, bytes: usize, l2_bytes: usize) -> f64 {
        if bytes > l2_bytes {
            self.transfer_bandwidth_l2_miss
        } else {
            self.transfer_bandwidth
        }
    }

    pub fn head_cost(&self, used_cores: usize, core_count: usize) -> f64 {
        self.head_cost_base_us + self.head_cost_per_core_us * used_cores as f64 / core_count.max(1) as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_polynomial_eval() {
        let p = Polynomial(vec![1.0, 2.0, 3.0]);
        assert_eq!(p.eval(2.0), 1.0 + 4.0 + 12.0);
    }

    #[test]
    fn test_aligned_rows_hit_ceiling() {
        let model = CostModel::default();
        let ceiling = model.core_ceiling(24);
        // 128-aligned whole rows: 95 * 2.5 clipped to the per-core ceiling
        let band = model.bandwidth(128, 256, 256, ceiling);
        assert!((band - ceiling).abs() < 1e-9);
    }

    #[test]
    fn test_odd_pitch_is_slow() {
        let model = CostModel::default();
        let ceiling = model.core_ceiling(24);
        let aligned = model.bandwidth(128, 128, 128, ceiling);
        let odd = model.bandwidth(128, 128, 1001, ceiling);
        assert!(odd < aligned);
    }

    #[test]
    fn test_short_bursts_are_penalised() {
        let model = CostModel::default();
        let ceiling = model.core_ceiling(24);
        let many = model.bandwidth(64, 1024, 1024, ceiling);
        let one = model.bandwidth(1, 1024, 1024, ceiling);
        assert!(one < many / 4.0);
    }

    #[test]
    fn test_json_overrides_are_partial() {
        let model: CostModel = serde_json::from_str(r#"{ "transfer_bandwidth": 50.0 }"#).unwrap();
        assert_eq!(model.transfer_bandwidth, 50.0);
        assert_eq!(model.aligned_bandwidth, 95.0);
    }
}
