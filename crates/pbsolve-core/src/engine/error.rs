use thiserror::Error;

use super::config::ConfigError;
use crate::core::bem::operator::OperatorError;
use crate::core::bem::solver::SolverError;
use crate::core::models::interface::InterfaceError;
use crate::core::models::topology::TopologyError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("{what} did not converge after {iterations} iterations (residual {residual:.3e})")]
    Convergence {
        what: &'static str,
        iterations: usize,
        residual: f64,
    },

    #[error("Preconditioner unavailable: {0}")]
    Precondition(String),

    #[error("Result not available: {0}")]
    MissingResult(String),

    #[error("Invalid configuration: {source}")]
    Config {
        #[from]
        source: ConfigError,
    },

    #[error("Linear solve failed: {source}")]
    Solver {
        #[from]
        source: SolverError,
    },

    #[error("Operator error: {source}")]
    Operator {
        #[from]
        source: OperatorError,
    },

    #[error("Invalid exclusion topology: {source}")]
    Topology {
        #[from]
        source: TopologyError,
    },

    #[error("Invalid interface: {source}")]
    Interface {
        #[from]
        source: InterfaceError,
    },
}
