use crate::core::models::interface::Interface;
use nalgebra::{Point3, Vector3};
use std::fmt;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Decides which points lie inside the volume enclosed by an interface.
pub trait PointContainment: Send + Sync + fmt::Debug {
    fn contains(&self, interface: &Interface, points: &[Point3<f64>]) -> Vec<bool>;
}

/// Ray-parity containment test against a closed triangle mesh.
///
/// A ray is cast from each point in a fixed, generic direction; an odd number
/// of crossings means the point is inside.
#[derive(Debug, Clone, Copy)]
pub struct RayCastContainment {
    direction: Vector3<f64>,
}

impl Default for RayCastContainment {
    fn default() -> Self {
        Self {
            direction: Vector3::new(0.5773, 0.5779, 0.5769).normalize(),
        }
    }
}

impl RayCastContainment {
    pub fn new() -> Self {
        Self::default()
    }

    fn crossings(&self, interface: &Interface, origin: &Point3<f64>) -> usize {
        let vertices = interface.vertices();
        interface
            .triangles()
            .iter()
            .filter(|tri| {
                let [a, b, c] = tri.map(|v| vertices[v]);
                ray_hits_triangle(origin, &self.direction, &a, &b, &c)
            })
            .count()
    }
}

impl PointContainment for RayCastContainment {
    fn contains(&self, interface: &Interface, points: &[Point3<f64>]) -> Vec<bool> {
        #[cfg(not(feature = "parallel"))]
        let iter = points.iter();

        #[cfg(feature = "parallel")]
        let iter = points.par_iter();

        iter.map(|p| self.crossings(interface, p) % 2 == 1).collect()
    }
}

/// Möller–Trumbore intersection for rays with `t > 0`.
fn ray_hits_triangle(
    origin: &Point3<f64>,
    direction: &Vector3<f64>,
    a: &Point3<f64>,
    b: &Point3<f64>,
    c: &Point3<f64>,
) -> bool {
    const EPSILON: f64 = 1e-12;
    let edge1 = b - a;
    let edge2 = c - a;
    let p = direction.cross(&edge2);
    let det = edge1.dot(&p);
    if det.abs() < EPSILON {
        return false;
    }
    let inv_det = 1.0 / det;
    let s = origin - a;
    let u = s.dot(&p) * inv_det;
    if !(0.0..=1.0).contains(&u) {
        return false;
    }
    let q = s.cross(&edge1);
    let v = direction.dot(&q) * inv_det;
    if v < 0.0 || u + v > 1.0 {
        return false;
    }
    edge2.dot(&q) * inv_det > EPSILON
}
