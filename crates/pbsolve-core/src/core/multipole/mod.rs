//! # Multipole Kernel
//!
//! Direct pairwise evaluation of the electrostatic potential, field gradient and
//! field Hessian produced by a body's point multipoles at its own sites.
//!
//! ## Overview
//!
//! Two families of sources are handled:
//!
//! - **Permanent multipoles** ([`permanent`]) - charge, dipole and quadrupole of
//!   every site. The gradient can optionally be Thole damped with same-group
//!   pairs excluded, which is the field that polarizes the induced dipoles.
//! - **Induced dipoles** ([`induced`]) - always Thole damped, with interactions
//!   between bonded sites scaled through the [`ExclusionTopology`].
//!
//! All routines are `O(N^2)` and evaluate one output row per site. With the
//! `parallel` feature the rows are distributed over the rayon thread pool.
//!
//! Distances are softened as `sqrt(|r|^2 + eps^2)` with `eps = 1e-15`. Self
//! pairs and pairs closer than `1e-12` contribute nothing.

pub mod damping;
pub mod induced;
pub mod permanent;

use crate::core::models::particle::ParticleSet;
use crate::core::models::topology::{ExclusionScale, ExclusionTopology, TopologyError};
use nalgebra::{Matrix3, Point3, Vector3};
use std::f64::consts::PI;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

const SOFTENING: f64 = 1e-15;
const MIN_SEPARATION: f64 = 1e-12;

/// Elementary charge in Coulomb.
pub const ELEMENTARY_CHARGE: f64 = 1.602_176_46e-19;
/// Avogadro constant in 1/mol.
pub const AVOGADRO: f64 = 6.022_141_5e23;
/// Vacuum permittivity in F/m.
pub const VACUUM_PERMITTIVITY: f64 = 8.854_187_818e-12;
/// Joules per calorie.
pub const CAL_TO_J: f64 = 4.184;

/// `q_e^2 N_A / (eps_0)` expressed in kcal/mol, with lengths in Angstroms.
pub fn coulomb_prefactor() -> f64 {
    ELEMENTARY_CHARGE * ELEMENTARY_CHARGE * AVOGADRO * 1e-3 * 1e10 / (CAL_TO_J * VACUUM_PERMITTIVITY)
}

/// How the permanent-multipole field gradient treats nearby sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FieldDamping {
    /// Every other site contributes at full strength.
    #[default]
    None,
    /// Thole damped; sites in the same polar group are skipped.
    PolarGroups,
}

/// Potential, gradient and Hessian of a field sampled at every site.
#[derive(Debug, Clone, PartialEq)]
pub struct SiteField {
    pub potential: Vec<f64>,
    pub gradient: Vec<Vector3<f64>>,
    pub hessian: Vec<Matrix3<f64>>,
}

impl SiteField {
    pub fn zeros(n: usize) -> Self {
        Self {
            potential: vec![0.0; n],
            gradient: vec![Vector3::zeros(); n],
            hessian: vec![Matrix3::zeros(); n],
        }
    }

    pub fn len(&self) -> usize {
        self.potential.len()
    }

    pub fn is_empty(&self) -> bool {
        self.potential.is_empty()
    }

    /// Element-wise sum of two fields sampled at the same sites.
    pub fn combined(&self, other: &SiteField) -> SiteField {
        SiteField {
            potential: self.potential.iter().zip(&other.potential).map(|(a, b)| a + b).collect(),
            gradient: self.gradient.iter().zip(&other.gradient).map(|(a, b)| a + b).collect(),
            hessian: self.hessian.iter().zip(&other.hessian).map(|(a, b)| a + b).collect(),
        }
    }
}

/// Pairwise multipole evaluator over a borrowed particle set.
#[derive(Debug, Clone, Copy)]
pub struct MultipoleKernel<'a> {
    particles: &'a ParticleSet,
    topology: &'a ExclusionTopology,
}

impl<'a> MultipoleKernel<'a> {
    pub fn new(particles: &'a ParticleSet, topology: &'a ExclusionTopology) -> Result<Self, TopologyError> {
        if particles.len() != topology.particle_count() {
            return Err(TopologyError::ParticleSetMismatch {
                topology: topology.particle_count(),
                particles: particles.len(),
            });
        }
        Ok(Self {
            particles,
            topology,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.particles.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }

    pub fn particles(&self) -> &'a ParticleSet {
        self.particles
    }

    /// Total field of the permanent multipoles plus a set of induced dipoles.
    ///
    /// This is the field that enters the multipole Coulomb energy.
    pub fn total_field(&self, induced: &[Vector3<f64>], scale: ExclusionScale) -> SiteField {
        let permanent = SiteField {
            potential: self.permanent_potential(),
            gradient: self.permanent_gradient(FieldDamping::None),
            hessian: self.permanent_hessian(),
        };
        let induced = SiteField {
            potential: self.induced_potential(induced, scale),
            gradient: self.induced_gradient(induced, scale),
            hessian: self.induced_hessian(induced, scale),
        };
        permanent.combined(&induced)
    }

    /// Evaluates `row(i)` for every site, in parallel when enabled.
    fn rows<T, F>(&self, row: F) -> Vec<T>
    where
        T: Send,
        F: Fn(usize) -> T + Sync + Send,
    {
        #[cfg(not(feature = "parallel"))]
        let iter = 0..self.len();

        #[cfg(feature = "parallel")]
        let iter = (0..self.len()).into_par_iter();

        iter.map(row).collect()
    }
}

/// Displacement `x_i - x_j` and softened distance, or `None` for coincident sites.
#[inline]
fn separation(xi: &Point3<f64>, xj: &Point3<f64>) -> Option<(Vector3<f64>, f64)> {
    let r = xi - xj;
    let raw = r.norm();
    if raw < MIN_SEPARATION {
        None
    } else {
        Some((r, (raw * raw + SOFTENING * SOFTENING).sqrt()))
    }
}

/// Multipole Coulomb energy of a body in kcal/mol.
///
/// `field` must be the total (permanent plus induced) field at the sites.
/// Only permanent moments are contracted with it.
pub fn coulomb_energy(particles: &ParticleSet, field: &SiteField, ep_in: f64) -> f64 {
    let sum: f64 = particles
        .iter()
        .enumerate()
        .map(|(i, p)| {
            p.charge * field.potential[i]
                + p.dipole.dot(&field.gradient[i])
                + p.quadrupole.component_mul(&field.hessian[i]).sum() / 6.0
        })
        .sum();
    sum * 0.5 * coulomb_prefactor() / (4.0 * PI * ep_in)
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;
    use crate::core::models::particle::Particle;

    /// Four sites with charges, dipoles and traceless quadrupoles.
    pub fn multipole_cluster() -> ParticleSet {
        let quad = |a: f64, b: f64, c: f64| Matrix3::new(a, c, 0.0, c, b, 0.1, 0.0, 0.1, -(a + b));
        ParticleSet::new(vec![
            Particle::point_charge(Point3::new(0.0, 0.0, 0.0), 0.4, 0)
                .with_dipole(Vector3::new(0.1, -0.2, 0.05))
                .with_quadrupole(quad(0.3, -0.1, 0.05))
                .with_polarization(1.1, 0.39),
            Particle::point_charge(Point3::new(1.6, 0.3, -0.2), -0.7, 1)
                .with_dipole(Vector3::new(-0.05, 0.1, 0.2))
                .with_quadrupole(quad(-0.2, 0.25, -0.1))
                .with_polarization(0.9, 0.39),
            Particle::point_charge(Point3::new(-0.4, 1.9, 0.7), 0.25, 2)
                .with_dipole(Vector3::new(0.0, 0.15, -0.1))
                .with_quadrupole(quad(0.1, 0.1, 0.2))
                .with_polarization(1.4, 0.39),
            Particle::point_charge(Point3::new(0.8, -1.2, 1.5), 0.05, 3)
                .with_dipole(Vector3::new(0.2, 0.0, 0.0))
                .with_quadrupole(quad(-0.3, 0.05, 0.0))
                .with_polarization(0.7, 0.39),
        ])
    }

    /// Central difference of `f` with respect to the position of site `i`.
    pub fn central_difference<F>(set: &ParticleSet, i: usize, f: F) -> Vector3<f64>
    where
        F: Fn(&ParticleSet) -> f64,
    {
        const H: f64 = 1e-4;
        let mut out = Vector3::zeros();
        for axis in 0..3 {
            let shifted = |delta: f64| {
                let mut particles = set.as_slice().to_vec();
                particles[i].position[axis] += delta;
                ParticleSet::new(particles)
            };
            out[axis] = (f(&shifted(H)) - f(&shifted(-H))) / (2.0 * H);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::particle::Particle;

    #[test]
    fn coulomb_prefactor_matches_kcal_constant() {
        let per_four_pi = coulomb_prefactor() / (4.0 * PI);
        assert!((per_four_pi - 332.06).abs() < 0.01, "got {per_four_pi}");
    }

    #[test]
    fn ion_pair_energy_matches_coulomb_law() {
        let positions = [Point3::origin(), Point3::new(2.0, 0.0, 0.0)];
        let particles = ParticleSet::from_point_charges(&positions, &[1.0, -1.0]).unwrap();
        let topology = ExclusionTopology::empty(2);
        let kernel = MultipoleKernel::new(&particles, &topology).unwrap();
        let field = kernel.total_field(&[Vector3::zeros(); 2], ExclusionScale::NONE);
        let energy = coulomb_energy(&particles, &field, 1.0);
        let expected = -coulomb_prefactor() / (4.0 * PI) / 2.0;
        assert!((energy - expected).abs() < 1e-9);
    }

    #[test]
    fn kernel_rejects_topology_for_other_particle_count() {
        let particles = ParticleSet::from_point_charges(&[Point3::origin()], &[1.0]).unwrap();
        let topology = ExclusionTopology::empty(3);
        let err = MultipoleKernel::new(&particles, &topology).unwrap_err();
        assert_eq!(err, TopologyError::ParticleSetMismatch { topology: 3, particles: 1 });
    }

    #[test]
    fn coulomb_energy_scales_with_inverse_permittivity() {
        let particles = ParticleSet::new(vec![
            Particle::point_charge(Point3::origin(), 0.5, 0).with_dipole(Vector3::new(0.1, 0.0, 0.2)),
            Particle::point_charge(Point3::new(0.0, 1.5, 0.0), -0.3, 1),
        ]);
        let topology = ExclusionTopology::empty(2);
        let kernel = MultipoleKernel::new(&particles, &topology).unwrap();
        let field = kernel.total_field(&[Vector3::zeros(); 2], ExclusionScale::NONE);
        let e1 = coulomb_energy(&particles, &field, 1.0);
        let e4 = coulomb_energy(&particles, &field, 4.0);
        assert!((e1 / e4 - 4.0).abs() < 1e-12);
    }
}
