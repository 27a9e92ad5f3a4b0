//! # Core Module
//!
//! Stateless building blocks of the solvation model: solute descriptions,
//! pairwise multipole physics and the boundary-element numerics.
//!
//! ## Architecture
//!
//! - **Solute Description** ([`models`]) - Multipole sites, exclusion topology and interface meshes
//! - **Multipole Physics** ([`multipole`]) - Direct-sum potentials, gradients and Hessians with Thole damping
//! - **Boundary Elements** ([`bem`]) - Operator containers, the collocation backend, sparse
//!   preconditioner storage and the GMRES solver
//! - **Geometry Queries** ([`geometry`]) - Point-in-volume tests against closed interfaces
//!
//! Nothing in this layer holds state between calls. The [`crate::engine`] layer
//! combines these pieces into per-body linear systems and solves them.

pub mod bem;
pub mod geometry;
pub mod models;
pub mod multipole;
