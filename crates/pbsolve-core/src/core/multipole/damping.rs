use crate::core::models::particle::Particle;

/// Thole screening factors for the rank-1, rank-3 and rank-5 interaction tensors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TholeScales {
    pub s3: f64,
    pub s5: f64,
    pub s7: f64,
}

impl TholeScales {
    pub const UNDAMPED: Self = Self {
        s3: 1.0,
        s5: 1.0,
        s7: 1.0,
    };

    /// Exponential Thole damping between two sites at distance `r`.
    #[inline]
    pub fn between(pi: &Particle, pj: &Particle, r: f64) -> Self {
        let damp = (pi.polarizability * pj.polarizability).powf(1.0 / 6.0) + 1e-12;
        let gamma = pi.thole.min(pj.thole);
        let u = -gamma * (r / damp).powi(3);
        let e = u.exp();
        Self {
            s3: 1.0 - e,
            s5: 1.0 - e * (1.0 - u),
            s7: 1.0 - e * (1.0 - u + 0.6 * u * u),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Point3;

    fn site(alpha: f64, thole: f64) -> Particle {
        Particle::point_charge(Point3::origin(), 0.0, 0).with_polarization(alpha, thole)
    }

    #[test]
    fn scales_approach_one_at_long_range() {
        let s = TholeScales::between(&site(1.0, 0.39), &site(1.0, 0.39), 50.0);
        assert!((s.s3 - 1.0).abs() < 1e-12);
        assert!((s.s5 - 1.0).abs() < 1e-12);
        assert!((s.s7 - 1.0).abs() < 1e-12);
    }

    #[test]
    fn scales_are_ordered_and_damped_at_short_range() {
        let s = TholeScales::between(&site(1.5, 0.39), &site(1.2, 0.39), 0.8);
        assert!(s.s3 > 0.0 && s.s3 < 1.0);
        assert!(s.s5 < s.s3);
        assert!(s.s7 < s.s5);
    }

    #[test]
    fn smaller_thole_parameter_is_used() {
        let a = TholeScales::between(&site(1.0, 0.1), &site(1.0, 0.9), 1.0);
        let b = TholeScales::between(&site(1.0, 0.1), &site(1.0, 0.1), 1.0);
        assert_eq!(a, b);
    }
}
