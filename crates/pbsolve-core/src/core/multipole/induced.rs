use super::damping::TholeScales;
use super::{MultipoleKernel, separation};
use crate::core::models::topology::ExclusionScale;
use nalgebra::{Matrix3, Vector3};

/// One Thole-damped, connectivity-scaled pair seen from site `i`.
struct InducedPair {
    r: Vector3<f64>,
    d: f64,
    scales: TholeScales,
    weight: f64,
    mu: Vector3<f64>,
}

impl MultipoleKernel<'_> {
    fn for_each_induced_pair<F>(&self, i: usize, induced: &[Vector3<f64>], scale: ExclusionScale, mut f: F)
    where
        F: FnMut(&InducedPair),
    {
        let particles = self.particles.as_slice();
        let pi = &particles[i];
        for (j, pj) in particles.iter().enumerate() {
            if j == i {
                continue;
            }
            let Some((r, d)) = separation(&pi.position, &pj.position) else {
                continue;
            };
            f(&InducedPair {
                r,
                d,
                scales: TholeScales::between(pi, pj, d),
                weight: self.topology.pair_scale(i, j, scale),
                mu: induced[j],
            });
        }
    }

    /// Potential of the induced dipoles at every site.
    ///
    /// # Panics
    ///
    /// Panics if `induced` does not have one entry per site.
    pub fn induced_potential(&self, induced: &[Vector3<f64>], scale: ExclusionScale) -> Vec<f64> {
        assert_eq!(induced.len(), self.len(), "one induced dipole per site");
        self.rows(|i| {
            let mut phi = 0.0;
            self.for_each_induced_pair(i, induced, scale, |p| {
                phi += p.weight * p.scales.s3 * p.r.dot(&p.mu) / (p.d * p.d * p.d);
            });
            phi
        })
    }

    /// Gradient of the induced-dipole potential at every site.
    pub fn induced_gradient(&self, induced: &[Vector3<f64>], scale: ExclusionScale) -> Vec<Vector3<f64>> {
        assert_eq!(induced.len(), self.len(), "one induced dipole per site");
        self.rows(|i| {
            let mut grad = Vector3::zeros();
            self.for_each_induced_pair(i, induced, scale, |p| {
                let d3 = p.d * p.d * p.d;
                let d5 = d3 * p.d * p.d;
                let r_dot_mu = p.r.dot(&p.mu);
                grad += (p.mu * (p.scales.s3 / d3) - p.r * (3.0 * p.scales.s5 * r_dot_mu / d5)) * p.weight;
            });
            grad
        })
    }

    /// Hessian of the induced-dipole potential at every site.
    pub fn induced_hessian(&self, induced: &[Vector3<f64>], scale: ExclusionScale) -> Vec<Matrix3<f64>> {
        assert_eq!(induced.len(), self.len(), "one induced dipole per site");
        self.rows(|i| {
            let mut hess = Matrix3::zeros();
            self.for_each_induced_pair(i, induced, scale, |p| {
                let d2 = p.d * p.d;
                let d5 = d2 * d2 * p.d;
                let d7 = d5 * d2;
                let r_dot_mu = p.r.dot(&p.mu);
                let outer = p.mu * p.r.transpose() + p.r * p.mu.transpose() + Matrix3::identity() * r_dot_mu;
                hess += (outer * (-3.0 * p.scales.s5 / d5)
                    + p.r * p.r.transpose() * (15.0 * p.scales.s7 * r_dot_mu / d7))
                    * p.weight;
            });
            hess
        })
    }
}
