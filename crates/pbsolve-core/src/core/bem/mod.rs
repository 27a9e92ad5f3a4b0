//! Boundary-element building blocks: operator containers, the collocation
//! backend that fills them, sparse preconditioner storage and the Krylov solver.

pub mod backend;
pub mod operator;
pub mod solver;
pub mod sparse;
