use nalgebra::{Matrix3, Point3, Vector3};

/// A point multipole site of a solute.
///
/// Every site carries a full set of multipole moments even for fixed-charge
/// force fields; for those the dipole, quadrupole and polarizability are zero.
#[derive(Debug, Clone, PartialEq)]
pub struct Particle {
    /// Position of the site in Angstroms.
    pub position: Point3<f64>,
    /// Monopole (partial charge) in elementary charge units.
    pub charge: f64,
    /// Permanent dipole moment.
    pub dipole: Vector3<f64>,
    /// Permanent quadrupole moment (symmetric).
    pub quadrupole: Matrix3<f64>,
    /// Isotropic polarizability.
    pub polarizability: f64,
    /// Thole damping parameter.
    pub thole: f64,
    /// Polar group identifier. Sites sharing a group do not polarize each other.
    pub polar_group: usize,
    /// Atomic radius in Angstroms.
    pub radius: f64,
}

impl Particle {
    /// Creates a fixed point charge with no higher moments.
    ///
    /// Each point charge receives its own polar group so that, if it is ever
    /// used with a polarizable formulation, it interacts with every other site.
    pub fn point_charge(position: Point3<f64>, charge: f64, polar_group: usize) -> Self {
        Self {
            position,
            charge,
            dipole: Vector3::zeros(),
            quadrupole: Matrix3::zeros(),
            polarizability: 0.0,
            thole: 0.0,
            polar_group,
            radius: 0.0,
        }
    }

    pub fn with_dipole(mut self, dipole: Vector3<f64>) -> Self {
        self.dipole = dipole;
        self
    }

    pub fn with_quadrupole(mut self, quadrupole: Matrix3<f64>) -> Self {
        self.quadrupole = quadrupole;
        self
    }

    pub fn with_polarization(mut self, polarizability: f64, thole: f64) -> Self {
        self.polarizability = polarizability;
        self.thole = thole;
        self
    }

    pub fn with_radius(mut self, radius: f64) -> Self {
        self.radius = radius;
        self
    }
}

/// The ordered multipole sites of one body.
///
/// The order of the sites is significant: induced dipoles, kernel outputs and
/// the exclusion topology are all indexed by position in this set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParticleSet {
    particles: Vec<Particle>,
}

impl ParticleSet {
    pub fn new(particles: Vec<Particle>) -> Self {
        Self { particles }
    }

    /// Builds a set of fixed point charges from parallel position and charge lists.
    ///
    /// Returns `None` when the two lists differ in length.
    pub fn from_point_charges(positions: &[Point3<f64>], charges: &[f64]) -> Option<Self> {
        if positions.len() != charges.len() {
            return None;
        }
        let particles = positions
            .iter()
            .zip(charges)
            .enumerate()
            .map(|(i, (&position, &charge))| Particle::point_charge(position, charge, i))
            .collect();
        Some(Self { particles })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.particles.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }

    #[inline]
    pub fn get(&self, index: usize) -> &Particle {
        &self.particles[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Particle> {
        self.particles.iter()
    }

    pub fn as_slice(&self) -> &[Particle] {
        &self.particles
    }

    pub fn positions(&self) -> Vec<Point3<f64>> {
        self.particles.iter().map(|p| p.position).collect()
    }

    pub fn total_charge(&self) -> f64 {
        self.particles.iter().map(|p| p.charge).sum()
    }

    /// Whether any site can carry an induced dipole.
    pub fn is_polarizable(&self) -> bool {
        self.particles.iter().any(|p| p.polarizability > 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_point_charges_assigns_distinct_polar_groups() {
        let positions = [Point3::origin(), Point3::new(1.0, 0.0, 0.0)];
        let set = ParticleSet::from_point_charges(&positions, &[1.0, -1.0]).unwrap();
        assert_eq!(set.len(), 2);
        assert_ne!(set.get(0).polar_group, set.get(1).polar_group);
        assert_eq!(set.total_charge(), 0.0);
        assert!(!set.is_polarizable());
    }

    #[test]
    fn from_point_charges_rejects_misaligned_inputs() {
        let positions = [Point3::origin()];
        assert!(ParticleSet::from_point_charges(&positions, &[1.0, 2.0]).is_none());
    }

    #[test]
    fn builder_methods_set_higher_moments() {
        let particle = Particle::point_charge(Point3::origin(), 0.5, 0)
            .with_dipole(Vector3::new(0.0, 0.0, 1.0))
            .with_polarization(1.2, 0.39)
            .with_radius(1.7);
        assert_eq!(particle.dipole.z, 1.0);
        assert_eq!(particle.polarizability, 1.2);
        assert_eq!(particle.thole, 0.39);
        assert_eq!(particle.radius, 1.7);
        assert!(ParticleSet::new(vec![particle]).is_polarizable());
    }
}
