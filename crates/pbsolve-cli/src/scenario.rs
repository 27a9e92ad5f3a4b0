use crate::error::{CliError, Result};
use nalgebra::{Matrix3, Point3, Vector3};
use pbsolve::core::models::interface::Interface;
use pbsolve::core::models::particle::{Particle, ParticleSet};
use pbsolve::core::models::topology::{ExclusionScale, ExclusionTopology};
use pbsolve::engine::body::Body;
use pbsolve::engine::config::SimulationConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

/// A scenario file: simulation settings, spherical bodies and sample points.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Scenario {
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(rename = "body")]
    pub bodies: Vec<BodySpec>,
    /// Points at which the potential in the solvent is reported.
    #[serde(default)]
    pub samples: Vec<[f64; 3]>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct BodySpec {
    pub name: String,
    pub center: [f64; 3],
    pub radius: f64,
    #[serde(default = "default_subdivisions")]
    pub subdivisions: u32,
    pub ep_in: Option<f64>,
    pub ep_stern: Option<f64>,
    pub stern_width: Option<f64>,
    #[serde(default)]
    pub bonds: Vec<[usize; 2]>,
    pub exclusion_scale: Option<ExclusionScaleSpec>,
    #[serde(rename = "particle")]
    pub particles: Vec<ParticleSpec>,
}

fn default_subdivisions() -> u32 {
    3
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ExclusionScaleSpec {
    pub p12: f64,
    pub p13: f64,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ParticleSpec {
    /// Absolute position in Angstroms.
    pub position: [f64; 3],
    #[serde(default)]
    pub charge: f64,
    pub dipole: Option<[f64; 3]>,
    /// Row-major 3x3 quadrupole.
    pub quadrupole: Option<[[f64; 3]; 3]>,
    #[serde(default)]
    pub polarizability: f64,
    #[serde(default)]
    pub thole: f64,
    pub polar_group: Option<usize>,
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content).map_err(|source| CliError::Scenario {
            path: path.to_path_buf(),
            source,
        })
    }

    fn parse(content: &str) -> anyhow::Result<Self> {
        let scenario: Self = toml::from_str(content)?;
        if scenario.bodies.is_empty() {
            anyhow::bail!("at least one [[body]] is required");
        }
        scenario.simulation.validate()?;
        Ok(scenario)
    }

    pub fn sample_points(&self) -> Vec<Point3<f64>> {
        self.samples.iter().map(|&p| Point3::from(p)).collect()
    }

    pub fn build_bodies(&self, path: &Path) -> Result<Vec<Body>> {
        self.bodies
            .iter()
            .map(|spec| {
                spec.build().map_err(|source| CliError::Scenario {
                    path: PathBuf::from(path),
                    source: source.context(format!("body '{}'", spec.name)),
                })
            })
            .collect()
    }
}

impl BodySpec {
    fn build(&self) -> anyhow::Result<Body> {
        let interface = Interface::sphere(Point3::from(self.center), self.radius, self.subdivisions)?;
        let particles = ParticleSet::new(
            self.particles
                .iter()
                .enumerate()
                .map(|(i, p)| p.to_particle(i))
                .collect(),
        );
        let bonds: Vec<(usize, usize)> = self.bonds.iter().map(|&[a, b]| (a, b)).collect();
        let topology = ExclusionTopology::from_bonds(particles.len(), &bonds)?;
        debug!(
            body = %self.name,
            elements = interface.dof_count(),
            particles = particles.len(),
            "Body built from scenario"
        );

        let mut body = Body::new(self.name.clone(), interface, particles)?.with_topology(topology)?;
        if let Some(ep_in) = self.ep_in {
            body = body.with_ep_in(ep_in);
        }
        if let Some(ep_stern) = self.ep_stern {
            body = body.with_ep_stern(ep_stern);
        }
        if let Some(width) = self.stern_width {
            body = body.with_stern_width(width);
        }
        if let Some(scale) = self.exclusion_scale {
            body = body.with_exclusion_scale(ExclusionScale::new(scale.p12, scale.p13));
        }
        Ok(body)
    }
}

impl ParticleSpec {
    fn to_particle(&self, index: usize) -> Particle {
        let group = self.polar_group.unwrap_or(index);
        let mut particle = Particle::point_charge(Point3::from(self.position), self.charge, group)
            .with_polarization(self.polarizability, self.thole);
        if let Some(d) = self.dipole {
            particle = particle.with_dipole(Vector3::from(d));
        }
        if let Some(q) = self.quadrupole {
            particle = particle.with_quadrupole(Matrix3::from_fn(|r, c| q[r][c]));
        }
        particle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pbsolve::engine::body::ForceField;
    use pbsolve::engine::formulation::FormulationKind;
    use std::io::Write;

    const TWO_IONS: &str = r#"
samples = [[10.0, 0.0, 0.0]]

[simulation]
formulation = "direct"

[simulation.solvent]
ep-ex = 80.0
kappa = 0.125

[[body]]
name = "cation"
center = [0.0, 0.0, 0.0]
radius = 2.0
subdivisions = 1
ep-in = 1.0

[[body.particle]]
position = [0.0, 0.0, 0.0]
charge = 1.0

[[body]]
name = "polar"
center = [20.0, 0.0, 0.0]
radius = 3.0
bonds = [[0, 1]]
exclusion-scale = { p12 = 0.0, p13 = 0.5 }

[[body.particle]]
position = [19.5, 0.0, 0.0]
charge = -0.5
polarizability = 1.0
thole = 0.39

[[body.particle]]
position = [20.5, 0.0, 0.0]
charge = 0.5
dipole = [0.0, 0.0, 0.1]
polarizability = 1.0
thole = 0.39
"#;

    #[test]
    fn parses_bodies_and_settings() {
        let scenario = Scenario::parse(TWO_IONS).unwrap();
        assert_eq!(scenario.simulation.formulation, FormulationKind::Direct);
        assert_eq!(scenario.bodies.len(), 2);
        assert_eq!(scenario.bodies[1].subdivisions, 3);
        assert_eq!(scenario.sample_points(), vec![Point3::new(10.0, 0.0, 0.0)]);
    }

    #[test]
    fn builds_bodies_with_topology_and_force_field() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(TWO_IONS.as_bytes()).unwrap();
        let scenario = Scenario::load(file.path()).unwrap();
        let bodies = scenario.build_bodies(file.path()).unwrap();

        assert_eq!(bodies[0].force_field(), ForceField::Amber);
        assert_eq!(bodies[0].ep_in(), 1.0);
        assert_eq!(bodies[1].force_field(), ForceField::Amoeba);
        assert!(bodies[1].topology().one_two().contains(0, 1));
        assert_eq!(bodies[1].particles().get(1).dipole, Vector3::new(0.0, 0.0, 0.1));
        assert_eq!(bodies[1].particles().get(0).polar_group, 0);
    }

    #[test]
    fn scenario_without_bodies_is_rejected() {
        let err = Scenario::parse("body = []").unwrap_err();
        assert!(err.to_string().contains("at least one"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let content = TWO_IONS.replace("ep-in = 1.0", "epsilon = 1.0");
        assert!(Scenario::parse(&content).is_err());
    }

    #[test]
    fn body_errors_name_the_body() {
        let content = TWO_IONS.replace("bonds = [[0, 1]]", "bonds = [[0, 7]]");
        let scenario = Scenario::parse(&content).unwrap();
        let err = scenario.build_bodies(Path::new("scenario.toml")).unwrap_err();
        match err {
            CliError::Scenario { source, .. } => assert!(format!("{source:#}").contains("polar")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Scenario::load(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, CliError::Io(_)));
    }
}
