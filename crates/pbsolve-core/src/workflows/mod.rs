//! # Workflows Module
//!
//! High-level entry points that tie the [`crate::engine`] and [`crate::core`]
//! layers together into complete solvation calculations.
//!
//! ## Overview
//!
//! A [`simulation::Simulation`] owns the ordered bodies, the configuration, the
//! boundary-element backend and the linear solver. It resolves the formulation,
//! assembles the coupled system, runs whichever outer iteration the formulation
//! needs and exposes the physical results.
//!
//! ## Architecture
//!
//! - **Simulation Workflow** ([`simulation`]) - Surface potential, solvation energy,
//!   solvation forces and the potential in the solvent.
//!
//! ## Key Capabilities
//!
//! - **Formulation dispatch** between a single solve, the SLIC Stern-layer loop and the
//!   polarizable induced-dipole loop
//! - **Selective reruns** reusing the operator when only the right-hand side changed
//! - **Progress monitoring** through [`crate::engine::progress::ProgressReporter`]

pub mod simulation;
