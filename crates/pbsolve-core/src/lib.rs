//! # pbsolve Core Library
//!
//! Boundary-element Poisson–Boltzmann electrostatics for one or more solutes in an
//! ionic solvent, with optional Stern layers and polarizable multipoles.
//!
//! ## Architectural Philosophy
//!
//! The library follows a three-layer architecture:
//!
//! - **[`core`]: The Foundation.** Stateless data models (`Interface`, `ParticleSet`,
//!   `ExclusionTopology`), the multipole kernel, boundary operators, the sparse block
//!   matrices and the GMRES solver.
//!
//! - **[`engine`]: The Logic Core.** Per-body state and caches, the formulations that
//!   build self blocks and right-hand sides, the global block assembler and the
//!   induced-dipole solver.
//!
//! - **[`workflows`]: The Public API.** The `Simulation` aggregate that solves the coupled
//!   system and reports energies, forces and solvent potentials.

pub mod core;
pub mod engine;
pub mod workflows;
