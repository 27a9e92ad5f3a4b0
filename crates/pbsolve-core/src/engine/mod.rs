//! # Engine Module
//!
//! Everything between a set of solutes and a solved boundary-integral system.
//!
//! ## Overview
//!
//! A [`body::Body`] owns one solute: its dielectric surface, an optional Stern
//! (ion-exclusion) surface and its multipole sites. A [`formulation::Formulation`]
//! turns a body into its self block operator, right-hand side and local
//! preconditioner. The [`assembly::BlockOperatorAssembler`] couples all bodies
//! into one global operator which the linear solver inverts.
//!
//! ## Architecture
//!
//! - **Configuration** ([`config`]) - Solvent, solver, polarization and SLIC settings
//! - **Formulations** ([`formulation`]) - `direct`, `direct_stern`, `slic` and `direct_amoeba`
//! - **Bodies** ([`body`]) - Per-solute caches and post-processing (energy, forces, potentials)
//! - **Assembly** ([`assembly`]) - Global block operator, preconditioner and right-hand side
//! - **Polarization** ([`polarization`]) - Induced dipoles by successive over-relaxation
//! - **Progress Monitoring** ([`progress`]) - Progress events for front ends
//! - **Error Handling** ([`error`]) - Engine error type wrapping every lower-level error
//!
//! ## Key Capabilities
//!
//! - **Multi-body coupling** with operators evaluated between every ordered pair of bodies
//! - **Parallel assembly** of self systems and coupling blocks behind the `parallel` feature
//! - **Block-diagonal preconditioning** from exact 2x2 Schur inverses
//! - **Field-dependent Stern layers** solved as an outer fixed-point iteration
//! - **Polarizable multipoles** self-consistent with the solvent reaction field

pub mod assembly;
pub mod body;
pub mod config;
pub mod error;
pub mod formulation;
pub mod polarization;
pub mod progress;
