use nalgebra::{Point3, Vector3};
use std::collections::HashMap;
use std::f64::consts::PI;
use thiserror::Error;

const DEGENERATE_AREA: f64 = 1e-14;

#[derive(Debug, Error, PartialEq)]
pub enum InterfaceError {
    #[error("Interface mesh has no triangles")]
    Empty,

    #[error("Triangle {triangle} references vertex {vertex}, but the mesh has {count} vertices")]
    VertexOutOfRange {
        triangle: usize,
        vertex: usize,
        count: usize,
    },

    #[error("Triangle {0} is degenerate (zero area)")]
    DegenerateTriangle(usize),

    #[error("Invalid surface parameter: {0}")]
    InvalidParameter(String),

    #[error("Expected {expected} {what} values, found {found}")]
    ValueCount {
        what: &'static str,
        expected: usize,
        found: usize,
    },
}

/// A closed, outward-oriented triangle surface.
///
/// Each triangle is one piecewise-constant degree of freedom. Centroids, unit
/// normals and areas are computed once at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct Interface {
    vertices: Vec<Point3<f64>>,
    triangles: Vec<[usize; 3]>,
    centroids: Vec<Point3<f64>>,
    normals: Vec<Vector3<f64>>,
    areas: Vec<f64>,
}

impl Interface {
    /// Builds an interface from a vertex list and counter-clockwise triangles.
    ///
    /// # Errors
    ///
    /// Returns [`InterfaceError`] for an empty mesh, an out-of-range vertex index,
    /// or a triangle with (numerically) zero area.
    pub fn new(vertices: Vec<Point3<f64>>, triangles: Vec<[usize; 3]>) -> Result<Self, InterfaceError> {
        if triangles.is_empty() {
            return Err(InterfaceError::Empty);
        }

        let mut centroids = Vec::with_capacity(triangles.len());
        let mut normals = Vec::with_capacity(triangles.len());
        let mut areas = Vec::with_capacity(triangles.len());

        for (t, tri) in triangles.iter().enumerate() {
            if let Some(&vertex) = tri.iter().find(|&&v| v >= vertices.len()) {
                return Err(InterfaceError::VertexOutOfRange {
                    triangle: t,
                    vertex,
                    count: vertices.len(),
                });
            }
            let [a, b, c] = tri.map(|v| vertices[v]);
            let cross = (b - a).cross(&(c - a));
            let norm = cross.norm();
            if norm < DEGENERATE_AREA {
                return Err(InterfaceError::DegenerateTriangle(t));
            }
            centroids.push(Point3::from((a.coords + b.coords + c.coords) / 3.0));
            normals.push(cross / norm);
            areas.push(0.5 * norm);
        }

        Ok(Self {
            vertices,
            triangles,
            centroids,
            normals,
            areas,
        })
    }

    /// Generates a geodesic sphere by recursive subdivision of an icosahedron.
    ///
    /// Level 0 has 20 triangles and each level multiplies the count by four.
    pub fn sphere(center: Point3<f64>, radius: f64, subdivisions: u32) -> Result<Self, InterfaceError> {
        if !(radius > 0.0) {
            return Err(InterfaceError::InvalidParameter(format!(
                "sphere radius must be positive, got {radius}"
            )));
        }

        let (mut unit, mut triangles) = icosahedron();
        for _ in 0..subdivisions {
            (unit, triangles) = subdivide(&unit, &triangles);
        }

        let vertices = unit
            .iter()
            .map(|u| center + u * radius)
            .collect::<Vec<_>>();

        // Orient every face away from the center.
        for tri in triangles.iter_mut() {
            let [a, b, c] = tri.map(|v| vertices[v]);
            let normal = (b - a).cross(&(c - a));
            let outward = Point3::from((a.coords + b.coords + c.coords) / 3.0) - center;
            if normal.dot(&outward) < 0.0 {
                tri.swap(1, 2);
            }
        }

        Self::new(vertices, triangles)
    }

    /// Returns a copy of this surface with every vertex moved `width` along its
    /// area-weighted vertex normal. Used to build Stern layers.
    pub fn offset(&self, width: f64) -> Result<Self, InterfaceError> {
        let mut vertex_normals = vec![Vector3::zeros(); self.vertices.len()];
        for (tri, (normal, area)) in self.triangles.iter().zip(self.normals.iter().zip(&self.areas)) {
            for &v in tri {
                vertex_normals[v] += normal * *area;
            }
        }
        let vertices = self
            .vertices
            .iter()
            .zip(&vertex_normals)
            .map(|(p, n)| match n.try_normalize(f64::EPSILON) {
                Some(unit) => p + unit * width,
                None => *p,
            })
            .collect();
        Self::new(vertices, self.triangles.clone())
    }

    /// Returns a rigidly translated copy.
    pub fn translated(&self, shift: &Vector3<f64>) -> Self {
        Self {
            vertices: self.vertices.iter().map(|p| p + shift).collect(),
            triangles: self.triangles.clone(),
            centroids: self.centroids.iter().map(|p| p + shift).collect(),
            normals: self.normals.clone(),
            areas: self.areas.clone(),
        }
    }

    /// Number of piecewise-constant degrees of freedom.
    #[inline]
    pub fn dof_count(&self) -> usize {
        self.triangles.len()
    }

    #[inline]
    pub fn vertices(&self) -> &[Point3<f64>] {
        &self.vertices
    }

    #[inline]
    pub fn triangles(&self) -> &[[usize; 3]] {
        &self.triangles
    }

    #[inline]
    pub fn centroids(&self) -> &[Point3<f64>] {
        &self.centroids
    }

    #[inline]
    pub fn normals(&self) -> &[Vector3<f64>] {
        &self.normals
    }

    #[inline]
    pub fn areas(&self) -> &[f64] {
        &self.areas
    }

    pub fn total_area(&self) -> f64 {
        self.areas.iter().sum()
    }

    /// Area-weighted average of piecewise-constant element values at every vertex.
    pub fn vertex_values(&self, element_values: &[f64]) -> Result<Vec<f64>, InterfaceError> {
        if element_values.len() != self.triangles.len() {
            return Err(InterfaceError::ValueCount {
                what: "element",
                expected: self.triangles.len(),
                found: element_values.len(),
            });
        }
        let mut sums = vec![0.0; self.vertices.len()];
        let mut weights = vec![0.0; self.vertices.len()];
        for ((tri, &area), &value) in self.triangles.iter().zip(&self.areas).zip(element_values) {
            for &v in tri {
                sums[v] += area * value;
                weights[v] += area;
            }
        }
        Ok(sums
            .into_iter()
            .zip(weights)
            .map(|(sum, weight)| if weight > 0.0 { sum / weight } else { 0.0 })
            .collect())
    }

    /// In-plane gradient, per triangle, of the linear interpolant of vertex values.
    pub fn tangential_gradients(&self, vertex_values: &[f64]) -> Result<Vec<Vector3<f64>>, InterfaceError> {
        if vertex_values.len() != self.vertices.len() {
            return Err(InterfaceError::ValueCount {
                what: "vertex",
                expected: self.vertices.len(),
                found: vertex_values.len(),
            });
        }
        Ok(self
            .triangles
            .iter()
            .map(|&[a, b, c]| {
                let [xa, xb, xc] = [a, b, c].map(|v| self.vertices[v]);
                let doubled = (xb - xa).cross(&(xc - xa));
                // Unit normal divided by twice the area.
                let n = doubled / doubled.norm_squared();
                n.cross(&(xc - xb)) * vertex_values[a]
                    + n.cross(&(xa - xc)) * vertex_values[b]
                    + n.cross(&(xb - xa)) * vertex_values[c]
            })
            .collect())
    }

    /// Volume enclosed by the surface (divergence theorem).
    pub fn enclosed_volume(&self) -> f64 {
        self.triangles
            .iter()
            .map(|tri| {
                let [a, b, c] = tri.map(|v| self.vertices[v].coords);
                a.dot(&b.cross(&c)) / 6.0
            })
            .sum()
    }
}

fn icosahedron() -> (Vec<Vector3<f64>>, Vec<[usize; 3]>) {
    let t = (1.0 + 5.0_f64.sqrt()) / 2.0;
    let vertices = [
        (-1.0, t, 0.0),
        (1.0, t, 0.0),
        (-1.0, -t, 0.0),
        (1.0, -t, 0.0),
        (0.0, -1.0, t),
        (0.0, 1.0, t),
        (0.0, -1.0, -t),
        (0.0, 1.0, -t),
        (t, 0.0, -1.0),
        (t, 0.0, 1.0),
        (-t, 0.0, -1.0),
        (-t, 0.0, 1.0),
    ]
    .iter()
    .map(|&(x, y, z)| Vector3::new(x, y, z).normalize())
    .collect();

    let triangles = vec![
        [0, 11, 5],
        [0, 5, 1],
        [0, 1, 7],
        [0, 7, 10],
        [0, 10, 11],
        [1, 5, 9],
        [5, 11, 4],
        [11, 10, 2],
        [10, 7, 6],
        [7, 1, 8],
        [3, 9, 4],
        [3, 4, 2],
        [3, 2, 6],
        [3, 6, 8],
        [3, 8, 9],
        [4, 9, 5],
        [2, 4, 11],
        [6, 2, 10],
        [8, 6, 7],
        [9, 8, 1],
    ];
    (vertices, triangles)
}

fn subdivide(vertices: &[Vector3<f64>], triangles: &[[usize; 3]]) -> (Vec<Vector3<f64>>, Vec<[usize; 3]>) {
    let mut vertices = vertices.to_vec();
    let mut midpoints: HashMap<(usize, usize), usize> = HashMap::new();
    let mut midpoint = |a: usize, b: usize, vertices: &mut Vec<Vector3<f64>>| -> usize {
        let key = (a.min(b), a.max(b));
        *midpoints.entry(key).or_insert_with(|| {
            vertices.push(((vertices[a] + vertices[b]) * 0.5).normalize());
            vertices.len() - 1
        })
    };

    let mut refined = Vec::with_capacity(triangles.len() * 4);
    for &[a, b, c] in triangles {
        let ab = midpoint(a, b, &mut vertices);
        let bc = midpoint(b, c, &mut vertices);
        let ca = midpoint(c, a, &mut vertices);
        refined.push([a, ab, ca]);
        refined.push([b, bc, ab]);
        refined.push([c, ca, bc]);
        refined.push([ab, bc, ca]);
    }
    (vertices, refined)
}

/// Surface area of a sphere, for comparisons against tessellations.
pub fn sphere_area(radius: f64) -> f64 {
    4.0 * PI * radius * radius
}
