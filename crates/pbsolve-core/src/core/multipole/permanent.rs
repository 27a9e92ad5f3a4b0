use super::damping::TholeScales;
use super::{FieldDamping, MultipoleKernel, separation};
use nalgebra::{Matrix3, Vector3};

#[inline]
fn symmetric(q: &Matrix3<f64>) -> Matrix3<f64> {
    (q + q.transpose()) * 0.5
}

impl MultipoleKernel<'_> {
    /// Potential of the permanent multipoles at every site.
    ///
    /// `phi_i = sum_j q_j / r + r . d_j / r^3 + 0.5 r^T Q_j r / r^5`, `r = x_i - x_j`.
    pub fn permanent_potential(&self) -> Vec<f64> {
        let particles = self.particles.as_slice();
        self.rows(|i| {
            let xi = &particles[i].position;
            particles
                .iter()
                .enumerate()
                .filter(|&(j, _)| j != i)
                .filter_map(|(_, pj)| separation(xi, &pj.position).map(|(r, d)| (pj, r, d)))
                .map(|(pj, r, d)| {
                    let d3 = d * d * d;
                    let d5 = d3 * d * d;
                    pj.charge / d + r.dot(&pj.dipole) / d3 + 0.5 * r.dot(&(pj.quadrupole * r)) / d5
                })
                .sum()
        })
    }

    /// Gradient of the permanent-multipole potential with respect to each site position.
    ///
    /// With [`FieldDamping::PolarGroups`], pairs within the same polar group are
    /// skipped and each tensor rank is screened by its Thole factor.
    pub fn permanent_gradient(&self, damping: FieldDamping) -> Vec<Vector3<f64>> {
        let particles = self.particles.as_slice();
        self.rows(|i| {
            let pi = &particles[i];
            let mut grad = Vector3::zeros();
            for (j, pj) in particles.iter().enumerate() {
                if j == i {
                    continue;
                }
                if damping == FieldDamping::PolarGroups && pj.polar_group == pi.polar_group {
                    continue;
                }
                let Some((r, d)) = separation(&pi.position, &pj.position) else {
                    continue;
                };
                let s = match damping {
                    FieldDamping::None => TholeScales::UNDAMPED,
                    FieldDamping::PolarGroups => TholeScales::between(pi, pj, d),
                };
                let d2 = d * d;
                let d3 = d2 * d;
                let d5 = d3 * d2;
                let d7 = d5 * d2;
                let q = symmetric(&pj.quadrupole);
                let qr = q * r;
                let r_dot_d = r.dot(&pj.dipole);
                let rqr = r.dot(&qr);

                grad += -r * (pj.charge * s.s3 / d3);
                grad += pj.dipole * (s.s3 / d3) - r * (3.0 * s.s5 * r_dot_d / d5);
                grad += qr * (s.s5 / d5) - r * (2.5 * s.s7 * rqr / d7);
            }
            grad
        })
    }

    /// Hessian of the permanent-multipole potential at each site (undamped).
    pub fn permanent_hessian(&self) -> Vec<Matrix3<f64>> {
        let particles = self.particles.as_slice();
        self.rows(|i| {
            let pi = &particles[i];
            let mut hess = Matrix3::zeros();
            for (j, pj) in particles.iter().enumerate() {
                if j == i {
                    continue;
                }
                let Some((r, d)) = separation(&pi.position, &pj.position) else {
                    continue;
                };
                let d2 = d * d;
                let d3 = d2 * d;
                let d5 = d3 * d2;
                let d7 = d5 * d2;
                let d9 = d7 * d2;
                let identity = Matrix3::identity();
                let rr = r * r.transpose();

                let dip = pj.dipole;
                let r_dot_d = r.dot(&dip);
                let q = symmetric(&pj.quadrupole);
                let qr = q * r;
                let rqr = r.dot(&qr);

                hess += (-identity / d3 + rr * (3.0 / d5)) * pj.charge;
                hess += (dip * r.transpose() + r * dip.transpose() + identity * r_dot_d) * (-3.0 / d5)
                    + rr * (15.0 * r_dot_d / d7);
                hess += q / d5 - (qr * r.transpose() + r * qr.transpose()) * (5.0 / d7)
                    - identity * (2.5 * rqr / d7)
                    + rr * (17.5 * rqr / d9);
            }
            hess
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests_support::*;
    use super::*;
    use crate::core::models::particle::{Particle, ParticleSet};
    use crate::core::models::topology::ExclusionTopology;
    use nalgebra::Point3;

    const TOLERANCE: f64 = 1e-9;

    fn f64_approx_equal(a: f64, b: f64) -> bool {
        (a - b).abs() < TOLERANCE
    }

    #[test]
    fn opposite_charges_at_unit_distance_give_literal_coulomb_potential() {
        let positions = [Point3::origin(), Point3::new(1.0, 0.0, 0.0)];
        let particles = ParticleSet::from_point_charges(&positions, &[1.0, -1.0]).unwrap();
        let topology = ExclusionTopology::empty(2);
        let phi = MultipoleKernel::new(&particles, &topology).unwrap().permanent_potential();
        assert!(f64_approx_equal(phi[0], -1.0));
        assert!(f64_approx_equal(phi[1], 1.0));
    }

    #[test]
    fn coincident_sites_are_skipped() {
        let positions = [Point3::origin(), Point3::origin()];
        let particles = ParticleSet::from_point_charges(&positions, &[1.0, 1.0]).unwrap();
        let topology = ExclusionTopology::empty(2);
        let kernel = MultipoleKernel::new(&particles, &topology).unwrap();
        assert_eq!(kernel.permanent_potential(), vec![0.0, 0.0]);
        assert_eq!(kernel.permanent_gradient(FieldDamping::None)[0], Vector3::zeros());
    }

    #[test]
    fn gradient_matches_central_difference_of_potential() {
        let particles = multipole_cluster();
        for i in 0..particles.len() {
            let topology = ExclusionTopology::empty(particles.len());
            let analytic = MultipoleKernel::new(&particles, &topology).unwrap().permanent_gradient(FieldDamping::None)[i];
            let numeric = central_difference(&particles, i, |set| {
                let topology = ExclusionTopology::empty(set.len());
                MultipoleKernel::new(set, &topology).unwrap().permanent_potential()[i]
            });
            assert!((analytic - numeric).norm() < 1e-6, "site {i}: {analytic} vs {numeric}");
        }
    }

    #[test]
    fn hessian_matches_central_difference_of_gradient() {
        let particles = multipole_cluster();
        for i in 0..particles.len() {
            let topology = ExclusionTopology::empty(particles.len());
            let analytic = MultipoleKernel::new(&particles, &topology).unwrap().permanent_hessian()[i];
            for axis in 0..3 {
                let numeric = central_difference(&particles, i, |set| {
                    let topology = ExclusionTopology::empty(set.len());
                    MultipoleKernel::new(set, &topology).unwrap().permanent_gradient(FieldDamping::None)[i][axis]
                });
                let row = analytic.row(axis).transpose();
                assert!((row - numeric).norm() < 1e-6, "site {i} axis {axis}");
            }
        }
    }

    #[test]
    fn hessian_is_symmetric_and_traceless() {
        let particles = multipole_cluster();
        let topology = ExclusionTopology::empty(particles.len());
        for h in MultipoleKernel::new(&particles, &topology).unwrap().permanent_hessian() {
            assert!((h - h.transpose()).norm() < 1e-10);
            assert!(h.trace().abs() < 1e-8);
        }
    }

    #[test]
    fn polar_group_damping_skips_same_group_pairs() {
        let particles = ParticleSet::new(vec![
            Particle::point_charge(Point3::origin(), 1.0, 7).with_polarization(1.0, 0.39),
            Particle::point_charge(Point3::new(1.0, 0.0, 0.0), 1.0, 7).with_polarization(1.0, 0.39),
            Particle::point_charge(Point3::new(0.0, 3.0, 0.0), 1.0, 8).with_polarization(1.0, 0.39),
        ]);
        let topology = ExclusionTopology::empty(3);
        let kernel = MultipoleKernel::new(&particles, &topology).unwrap();
        let damped = kernel.permanent_gradient(FieldDamping::PolarGroups);
        let undamped = kernel.permanent_gradient(FieldDamping::None);
        // Site 0 only feels site 2, which sits along +y.
        assert!(damped[0].x.abs() < 1e-12);
        assert!(damped[0].y > 0.0);
        assert!(undamped[0].x.abs() > 0.1);
    }
}
