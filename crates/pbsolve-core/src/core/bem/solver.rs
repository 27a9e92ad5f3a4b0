use super::operator::DiscreteOperator;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Debug, Error, PartialEq)]
pub enum SolverError {
    #[error("Linear solver did not converge after {iterations} iterations (relative residual {residual:.3e})")]
    NotConverged { iterations: usize, residual: f64 },

    #[error("Operator of shape {operator:?} cannot be applied to a right-hand side of length {rhs}")]
    DimensionMismatch { operator: (usize, usize), rhs: usize },

    #[error("Invalid solver settings: {0}")]
    InvalidSettings(String),
}

/// Stopping criteria of an iterative solve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SolverSettings {
    /// Relative (preconditioned) residual at which the solve stops.
    pub tolerance: f64,
    /// Krylov subspace size before a restart.
    pub restart: usize,
    /// Total number of inner iterations across restarts.
    pub max_iterations: usize,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            tolerance: 1e-5,
            restart: 1000,
            max_iterations: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SolverOutcome {
    pub solution: DVector<f64>,
    pub iterations: usize,
    pub residual: f64,
}

pub trait LinearSolver: Send + Sync + fmt::Debug {
    /// Solves `A x = b`, optionally left-preconditioned by `M` (`M A x = M b`).
    fn solve(
        &self,
        operator: &dyn DiscreteOperator,
        preconditioner: Option<&dyn DiscreteOperator>,
        rhs: &DVector<f64>,
        settings: &SolverSettings,
    ) -> Result<SolverOutcome, SolverError>;
}

/// Restarted GMRES with modified Gram-Schmidt and Givens rotations.
#[derive(Debug, Clone, Copy, Default)]
pub struct Gmres;

impl Gmres {
    pub fn new() -> Self {
        Self
    }
}

#[inline]
fn givens(a: f64, b: f64) -> (f64, f64) {
    if b == 0.0 {
        (1.0, 0.0)
    } else {
        let r = a.hypot(b);
        (a / r, b / r)
    }
}

impl LinearSolver for Gmres {
    fn solve(
        &self,
        operator: &dyn DiscreteOperator,
        preconditioner: Option<&dyn DiscreteOperator>,
        rhs: &DVector<f64>,
        settings: &SolverSettings,
    ) -> Result<SolverOutcome, SolverError> {
        let (rows, cols) = operator.shape();
        if rows != cols || rows != rhs.len() {
            return Err(SolverError::DimensionMismatch {
                operator: (rows, cols),
                rhs: rhs.len(),
            });
        }
        if let Some(p) = preconditioner {
            if p.shape() != (rows, rows) {
                return Err(SolverError::DimensionMismatch {
                    operator: p.shape(),
                    rhs: rhs.len(),
                });
            }
        }
        if !(settings.tolerance > 0.0) || settings.restart == 0 {
            return Err(SolverError::InvalidSettings(format!(
                "tolerance must be positive and restart non-zero (got {} / {})",
                settings.tolerance, settings.restart
            )));
        }

        let n = rhs.len();
        let precondition = |v: DVector<f64>| match preconditioner {
            Some(p) => p.apply_vec(&v),
            None => v,
        };

        let b = precondition(rhs.clone());
        let b_norm = b.norm();
        if b_norm == 0.0 {
            return Ok(SolverOutcome {
                solution: DVector::zeros(n),
                iterations: 0,
                residual: 0.0,
            });
        }

        let m = settings.restart.min(n).max(1);
        let mut x = DVector::<f64>::zeros(n);
        let mut iterations = 0;

        loop {
            let r = precondition(rhs - operator.apply_vec(&x));
            let beta = r.norm();
            let residual = beta / b_norm;
            if residual < settings.tolerance {
                debug!(iterations, residual, "GMRES converged.");
                return Ok(SolverOutcome {
                    solution: x,
                    iterations,
                    residual,
                });
            }
            if iterations >= settings.max_iterations {
                return Err(SolverError::NotConverged {
                    iterations,
                    residual,
                });
            }

            let mut basis: Vec<DVector<f64>> = Vec::with_capacity(m + 1);
            basis.push(r / beta);
            let mut h = DMatrix::<f64>::zeros(m + 1, m);
            let mut cs = vec![0.0; m];
            let mut sn = vec![0.0; m];
            let mut g = DVector::<f64>::zeros(m + 1);
            g[0] = beta;
            let mut used = 0;

            for k in 0..m {
                if iterations >= settings.max_iterations {
                    break;
                }
                iterations += 1;

                let mut w = precondition(operator.apply_vec(&basis[k]));
                for (i, v) in basis.iter().enumerate() {
                    let hik = w.dot(v);
                    h[(i, k)] = hik;
                    w.axpy(-hik, v, 1.0);
                }
                let next_norm = w.norm();
                h[(k + 1, k)] = next_norm;

                for i in 0..k {
                    let upper = cs[i] * h[(i, k)] + sn[i] * h[(i + 1, k)];
                    h[(i + 1, k)] = -sn[i] * h[(i, k)] + cs[i] * h[(i + 1, k)];
                    h[(i, k)] = upper;
                }
                let (c, s) = givens(h[(k, k)], h[(k + 1, k)]);
                cs[k] = c;
                sn[k] = s;
                h[(k, k)] = c * h[(k, k)] + s * h[(k + 1, k)];
                h[(k + 1, k)] = 0.0;
                g[k + 1] = -s * g[k];
                g[k] *= c;
                used = k + 1;

                trace!(iteration = iterations, residual = g[k + 1].abs() / b_norm, "GMRES step");

                let breakdown = next_norm <= f64::EPSILON * b_norm;
                if g[k + 1].abs() / b_norm < settings.tolerance || breakdown {
                    break;
                }
                basis.push(w / next_norm);
            }

            let mut y = DVector::<f64>::zeros(used);
            for i in (0..used).rev() {
                let tail: f64 = ((i + 1)..used).map(|j| h[(i, j)] * y[j]).sum();
                y[i] = (g[i] - tail) / h[(i, i)];
            }
            for (yi, v) in y.iter().zip(&basis) {
                x.axpy(*yi, v, 1.0);
            }
        }
    }
}
