//! Host reference GEMM
//!
//! Sums in the accumulator type with K ascending, the same order the block
//! MMA uses for every output element, so integer results match exactly.

use crate::coord::{GemmCoord, MatrixCoord};
use crate::element::{Accumulator, Element};
use crate::layout::Layout;

/// `C = A x B (+ bias)`, returned row-major `m x n`
pub fn reference_gemm<E, O>(
    a: &[E],
    a_layout: &Layout,
    b: &[E],
    b_layout: &Layout,
    bias: Option<&[O]>,
    problem: GemmCoord,
) -> Vec<O>
where
    E: Element,
    O: Element<Accumulator = E::Accumulator>,
{
    let mut out = Vec::with_capacity(problem.m * problem.n);
    for row in 0..problem.m {
        for column in 0..problem.n {
            let mut acc = match bias {
                Some(bias) => bias[column].to_acc(),
                None => E::Accumulator::zero(),
            };
            for k in 0..problem.k {
                let lhs = a[a_layout.offset(MatrixCoord::new(row, k))].to_acc();
                let rhs = b[b_layout.offset(MatrixCoord::new(k, column))].to_acc();
                acc = acc.mul_add(lhs, rhs);
            }
            out.push(O::from_acc(acc));
        }
    }
    out
}

/// Deterministic small-integer fill, exact in every element type
pub fn fill_pattern<E: Element>(count: usize, seed: usize) -> Vec<E> {
    (0..count)
        .map(|i| {
            let v = (i.wrapping_mul(7919).wrapping_add(seed.wrapping_mul(104_729))) % 9;
            E::from_f64(v as f64 - 4.0)
        })
        .collect()
}

/// Largest element-wise difference, relative to the larger magnitude
/// when that exceeds one
pub fn max_relative_error<O: Element>(got: &[O], want: &[O]) -> f64 {
    if got.len() != want.len() {
        return f64::INFINITY;
    }
    got.iter()
        .zip(want)
        .map(|(g, w)| {
            let (g, w) = (g.to_f64(), w.to_f64());
            (g - w).abs() / g.abs().max(w.abs()).max(1.0)
        })
        .fold(0.0, f64::max)
}
