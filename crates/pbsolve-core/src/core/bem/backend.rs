use super::operator::{BoundaryOperator, GridFunction, PotentialOperator};
use crate::core::models::interface::Interface;
use nalgebra::{DMatrix, DVector, Point3, Vector3};
use std::f64::consts::PI;
use std::fmt;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

const COINCIDENT: f64 = 1e-12;
const FOUR_PI: f64 = 4.0 * PI;

/// Green's function of the boundary integral operators.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Kernel {
    /// 1 / (4 pi r)
    Laplace,
    /// exp(-kappa r) / (4 pi r)
    ModifiedHelmholtz { kappa: f64 },
}

impl Kernel {
    #[inline]
    fn kappa(self) -> f64 {
        match self {
            Kernel::Laplace => 0.0,
            Kernel::ModifiedHelmholtz { kappa } => kappa,
        }
    }

    #[inline]
    fn value(self, r: f64) -> f64 {
        (-self.kappa() * r).exp() / (FOUR_PI * r)
    }

    /// Normal derivative with respect to the source point, `d/dn_y G(x, y)`.
    #[inline]
    fn normal_derivative(self, diff: &Vector3<f64>, r: f64, normal: &Vector3<f64>) -> f64 {
        let kappa = self.kappa();
        diff.dot(normal) * (-kappa * r).exp() * (1.0 + kappa * r) / (FOUR_PI * r * r * r)
    }

    /// Integral of the kernel over a flat disc of the given area, seen from its center.
    #[inline]
    fn self_patch(self, area: f64) -> f64 {
        let a = (area / PI).sqrt();
        match self {
            Kernel::Laplace => 0.5 * a,
            Kernel::ModifiedHelmholtz { kappa } if kappa < COINCIDENT => 0.5 * a,
            Kernel::ModifiedHelmholtz { kappa } => (1.0 - (-kappa * a).exp()) / (2.0 * kappa),
        }
    }
}

/// Construction of discretized boundary integral operators.
pub trait OperatorBackend: Send + Sync + fmt::Debug {
    fn identity(&self, space: &Interface) -> BoundaryOperator;

    fn single_layer(&self, kernel: Kernel, domain: &Interface, range: &Interface) -> BoundaryOperator;

    fn double_layer(&self, kernel: Kernel, domain: &Interface, range: &Interface) -> BoundaryOperator;

    fn single_layer_potential(
        &self,
        kernel: Kernel,
        domain: &Interface,
        points: &[Point3<f64>],
    ) -> PotentialOperator;

    fn double_layer_potential(
        &self,
        kernel: Kernel,
        domain: &Interface,
        points: &[Point3<f64>],
    ) -> PotentialOperator;

    /// Projects a function defined in space onto the interface's function space.
    fn project(&self, space: &Interface, f: &(dyn Fn(&Point3<f64>) -> f64 + Sync)) -> GridFunction;
}

/// Piecewise-constant elements with one collocation point per triangle centroid.
///
/// Off-diagonal entries use one-point quadrature. The single-layer self term is
/// the exact integral over a disc of equal area and the double-layer self term
/// vanishes on flat triangles. The weak form is the collocation matrix scaled
/// row-wise by the range element areas (lumped mass).
#[derive(Debug, Clone, Copy, Default)]
pub struct CollocationBackend;

impl CollocationBackend {
    pub fn new() -> Self {
        Self
    }

    fn mass(space: &Interface) -> DVector<f64> {
        DVector::from_column_slice(space.areas())
    }

    fn assemble<F>(n_rows: usize, n_cols: usize, entry: F) -> DMatrix<f64>
    where
        F: Fn(usize, usize) -> f64 + Sync,
    {
        #[cfg(not(feature = "parallel"))]
        let row_iter = 0..n_rows;

        #[cfg(feature = "parallel")]
        let row_iter = (0..n_rows).into_par_iter();

        let rows: Vec<Vec<f64>> = row_iter
            .map(|i| (0..n_cols).map(|j| entry(i, j)).collect())
            .collect();
        let data: Vec<f64> = rows.into_iter().flatten().collect();
        DMatrix::from_row_slice(n_rows, n_cols, &data)
    }

    fn single_layer_matrix(kernel: Kernel, domain: &Interface, points: &[Point3<f64>]) -> DMatrix<f64> {
        let centroids = domain.centroids();
        let areas = domain.areas();
        Self::assemble(points.len(), domain.dof_count(), |i, j| {
            let r = (points[i] - centroids[j]).norm();
            if r < COINCIDENT {
                kernel.self_patch(areas[j])
            } else {
                areas[j] * kernel.value(r)
            }
        })
    }

    fn double_layer_matrix(kernel: Kernel, domain: &Interface, points: &[Point3<f64>]) -> DMatrix<f64> {
        let centroids = domain.centroids();
        let normals = domain.normals();
        let areas = domain.areas();
        Self::assemble(points.len(), domain.dof_count(), |i, j| {
            let diff = points[i] - centroids[j];
            let r = diff.norm();
            if r < COINCIDENT {
                0.0
            } else {
                areas[j] * kernel.normal_derivative(&diff, r, &normals[j])
            }
        })
    }

    fn to_weak(collocation: DMatrix<f64>, range: &Interface) -> BoundaryOperator {
        let mass = Self::mass(range);
        let mut weak = collocation;
        for (mut row, m) in weak.row_iter_mut().zip(mass.iter()) {
            row *= *m;
        }
        BoundaryOperator::new(weak, mass)
    }
}

impl OperatorBackend for CollocationBackend {
    fn identity(&self, space: &Interface) -> BoundaryOperator {
        BoundaryOperator::identity(Self::mass(space))
    }

    fn single_layer(&self, kernel: Kernel, domain: &Interface, range: &Interface) -> BoundaryOperator {
        Self::to_weak(Self::single_layer_matrix(kernel, domain, range.centroids()), range)
    }

    fn double_layer(&self, kernel: Kernel, domain: &Interface, range: &Interface) -> BoundaryOperator {
        Self::to_weak(Self::double_layer_matrix(kernel, domain, range.centroids()), range)
    }

    fn single_layer_potential(
        &self,
        kernel: Kernel,
        domain: &Interface,
        points: &[Point3<f64>],
    ) -> PotentialOperator {
        PotentialOperator::new(Self::single_layer_matrix(kernel, domain, points))
    }

    fn double_layer_potential(
        &self,
        kernel: Kernel,
        domain: &Interface,
        points: &[Point3<f64>],
    ) -> PotentialOperator {
        PotentialOperator::new(Self::double_layer_matrix(kernel, domain, points))
    }

    fn project(&self, space: &Interface, f: &(dyn Fn(&Point3<f64>) -> f64 + Sync)) -> GridFunction {
        let coefficients = DVector::from_iterator(space.dof_count(), space.centroids().iter().map(f));
        let projections = coefficients.component_mul(&Self::mass(space));
        GridFunction {
            coefficients,
            projections,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bem::operator::DiscreteForm;

    fn unit_sphere() -> Interface {
        Interface::sphere(Point3::origin(), 1.0, 3).unwrap()
    }

    #[test]
    fn double_layer_of_constant_density_obeys_gauss_law() {
        // Gauss: the Laplace double-layer potential of a unit density is -1 inside.
        let sphere = unit_sphere();
        let backend = CollocationBackend::new();
        let dl = backend.double_layer_potential(Kernel::Laplace, &sphere, &[Point3::new(0.1, 0.2, 0.0)]);
        let value = dl.evaluate(&DVector::from_element(sphere.dof_count(), 1.0)).unwrap()[0];
        assert!((value + 1.0).abs() < 2e-2, "got {value}");

        let k = backend.double_layer(Kernel::Laplace, &sphere, &sphere).strong_form();
        let row_sum: f64 = k.row(0).sum();
        assert!((row_sum + 0.5).abs() < 5e-2, "got {row_sum}");
    }

    #[test]
    fn single_layer_of_constant_matches_sphere_potential() {
        // A unit density on a sphere of radius R gives R everywhere inside and on it.
        let sphere = unit_sphere();
        let backend = CollocationBackend::new();
        let v = backend.single_layer(Kernel::Laplace, &sphere, &sphere);
        let values = v.strong_form() * DVector::from_element(sphere.dof_count(), 1.0);
        for value in values.iter() {
            assert!((value - 1.0).abs() < 3e-2, "got {value}");
        }
    }

    #[test]
    fn helmholtz_kernel_reduces_to_laplace_at_zero_kappa() {
        let sphere = Interface::sphere(Point3::origin(), 1.0, 1).unwrap();
        let backend = CollocationBackend::new();
        let laplace = backend.single_layer(Kernel::Laplace, &sphere, &sphere);
        let helmholtz = backend.single_layer(Kernel::ModifiedHelmholtz { kappa: 0.0 }, &sphere, &sphere);
        assert!((laplace.weak_form() - helmholtz.weak_form()).norm() < 1e-12);
    }

    #[test]
    fn helmholtz_decays_faster_than_laplace() {
        let sphere = Interface::sphere(Point3::origin(), 1.0, 1).unwrap();
        let far = sphere.translated(&Vector3::new(20.0, 0.0, 0.0));
        let backend = CollocationBackend::new();
        let laplace = backend.single_layer(Kernel::Laplace, &sphere, &far);
        let screened = backend.single_layer(Kernel::ModifiedHelmholtz { kappa: 0.5 }, &sphere, &far);
        assert!(screened.weak_form().norm() < 1e-3 * laplace.weak_form().norm());
    }

    #[test]
    fn project_stores_centroid_values_and_weighted_projections() {
        let sphere = Interface::sphere(Point3::origin(), 2.0, 1).unwrap();
        let grid = CollocationBackend::new().project(&sphere, &|p: &Point3<f64>| p.x);
        for (k, c) in sphere.centroids().iter().enumerate() {
            assert_eq!(grid.coefficients[k], c.x);
            assert!((grid.projections[k] - c.x * sphere.areas()[k]).abs() < 1e-14);
        }
        assert_eq!(grid.vector(DiscreteForm::Strong), &grid.coefficients);
    }
}
