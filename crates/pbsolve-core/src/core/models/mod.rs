//! # Core Models Module
//!
//! Plain data describing a solute: its multipole sites, their bonded
//! connectivity, and the closed surfaces that separate the solute from the
//! solvent.
//!
//! ## Key Components
//!
//! - [`particle`] - Point multipole sites (charge, dipole, quadrupole, polarizability)
//! - [`topology`] - 1-2 / 1-3 exclusion lists in compressed-row form
//! - [`interface`] - Triangle surfaces with per-element centroids, normals and areas
//!
//! ## Usage
//!
//! ```ignore
//! use pbsolve::core::models::{interface::Interface, particle::ParticleSet};
//!
//! let surface = Interface::sphere(Point3::origin(), 2.0, 3)?;
//! let charges = ParticleSet::from_point_charges(&[Point3::origin()], &[1.0]).unwrap();
//! ```

pub mod interface;
pub mod particle;
pub mod topology;
