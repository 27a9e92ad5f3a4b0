use crate::cli::RunArgs;
use crate::error::Result;
use crate::scenario::Scenario;
use crate::utils::progress::CliProgressHandler;
use pbsolve::core::geometry::RayCastContainment;
use pbsolve::engine::config::SimulationConfig;
use pbsolve::engine::progress::ProgressReporter;
use pbsolve::workflows::simulation::{Rerun, Simulation};
use serde::Serialize;
use std::path::Path;
use tracing::info;

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct RunReport {
    pub formulation: String,
    pub solver_iterations: usize,
    pub total_energy: f64,
    #[serde(rename = "body")]
    pub bodies: Vec<BodyReport>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sample: Vec<SampleReport>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct BodyReport {
    pub name: String,
    pub energy: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub force: Option<[f64; 3]>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct SampleReport {
    pub position: [f64; 3],
    pub potential: f64,
}

pub fn run(args: RunArgs) -> Result<()> {
    info!("Loading scenario from {:?}", &args.config);
    let scenario = Scenario::load(&args.config)?;
    let config = apply_overrides(scenario.simulation.clone(), &args)?;

    let progress_handler = CliProgressHandler::new();
    let reporter = ProgressReporter::with_callback(progress_handler.get_callback());

    println!("Solving {} bod{}...", scenario.bodies.len(), if scenario.bodies.len() == 1 { "y" } else { "ies" });
    let report = solve(&scenario, &args.config, config, args.forces, reporter)?;
    print_report(&report);

    if let Some(path) = &args.output {
        write_report(&report, path)?;
        println!("Results written to: {}", path.display());
    }
    Ok(())
}

fn apply_overrides(mut config: SimulationConfig, args: &RunArgs) -> Result<SimulationConfig> {
    if let Some(kind) = args.formulation {
        config.formulation = kind;
    }
    if let Some(kind) = args.preconditioner {
        config.preconditioning = true;
        config.preconditioner = Some(kind);
    }
    if args.no_preconditioning {
        config.preconditioning = false;
    }
    if let Some(kind) = args.force_formulation {
        config.forces.formulation = kind;
    }
    config.validate()?;
    Ok(config)
}

fn solve(
    scenario: &Scenario,
    path: &Path,
    config: SimulationConfig,
    with_forces: bool,
    reporter: ProgressReporter<'_>,
) -> Result<RunReport> {
    let mut simulation = Simulation::new(config)?.with_reporter(reporter);
    for body in scenario.build_bodies(path)? {
        simulation.add_body(body);
    }

    simulation.calculate_surface_potential(Rerun::All)?;
    let energies = simulation.calculate_solvation_energy()?;
    let forces = if with_forces {
        Some(simulation.calculate_solvation_forces()?)
    } else {
        None
    };

    let samples = scenario.sample_points();
    let sample = if samples.is_empty() {
        Vec::new()
    } else {
        let phi = simulation.calculate_potential_solvent(&samples, &RayCastContainment::new())?;
        samples
            .iter()
            .zip(phi.iter())
            .map(|(p, &potential)| SampleReport {
                position: [p.x, p.y, p.z],
                potential,
            })
            .collect()
    };

    let bodies = simulation
        .bodies()
        .iter()
        .zip(&energies)
        .enumerate()
        .map(|(i, (body, &energy))| BodyReport {
            name: body.name().to_string(),
            energy,
            force: forces.as_ref().map(|f| {
                let v = f[i].f_solv;
                [v.x, v.y, v.z]
            }),
        })
        .collect();

    Ok(RunReport {
        formulation: simulation
            .formulation()
            .map(|k| k.to_string())
            .unwrap_or_default(),
        solver_iterations: simulation.iterations().unwrap_or(0),
        total_energy: energies.iter().sum(),
        bodies,
        sample,
    })
}

fn print_report(report: &RunReport) {
    println!(
        "Formulation: {} ({} solver iterations)",
        report.formulation, report.solver_iterations
    );
    for body in &report.bodies {
        match body.force {
            Some([x, y, z]) => println!(
                "  {:<16} {:>14.6} kcal/mol   force [{x:.4e}, {y:.4e}, {z:.4e}] kcal/(mol A)",
                body.name, body.energy
            ),
            None => println!("  {:<16} {:>14.6} kcal/mol", body.name, body.energy),
        }
    }
    println!("Total solvation energy: {:.6} kcal/mol", report.total_energy);
    for sample in &report.sample {
        let [x, y, z] = sample.position;
        println!("  phi({x:.3}, {y:.3}, {z:.3}) = {:.6e}", sample.potential);
    }
}

fn write_report(report: &RunReport, path: &Path) -> Result<()> {
    let text = toml::to_string(report).map_err(|e| anyhow::anyhow!("failed to serialize results: {e}"))?;
    std::fs::write(path, text)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::RunArgs;
    use pbsolve::engine::config::ForceFormulation;
    use pbsolve::engine::formulation::{FormulationKind, PreconditionerKind};
    use std::io::Write;

    const BORN: &str = r#"
samples = [[0.0, 0.0, 0.0], [6.0, 0.0, 0.0]]

[simulation]
formulation = "direct"

[simulation.solvent]
ep-ex = 80.0
kappa = 0.0

[[body]]
name = "ion"
center = [0.0, 0.0, 0.0]
radius = 2.0
subdivisions = 2
ep-in = 1.0

[[body.particle]]
position = [0.0, 0.0, 0.0]
charge = 1.0
"#;

    fn args(config: &Path) -> RunArgs {
        RunArgs {
            config: config.to_path_buf(),
            output: None,
            formulation: None,
            preconditioner: None,
            no_preconditioning: false,
            forces: true,
            force_formulation: None,
        }
    }

    #[test]
    fn overrides_replace_file_settings() {
        let mut run_args = args(Path::new("unused.toml"));
        run_args.formulation = Some(FormulationKind::DirectStern);
        run_args.preconditioner = Some(PreconditionerKind::MassMatrix);
        let config = apply_overrides(SimulationConfig::default(), &run_args).unwrap();
        assert_eq!(config.formulation, FormulationKind::DirectStern);
        assert_eq!(config.preconditioner, Some(PreconditionerKind::MassMatrix));

        let mut run_args = args(Path::new("unused.toml"));
        run_args.no_preconditioning = true;
        let config = apply_overrides(SimulationConfig::default(), &run_args).unwrap();
        assert!(!config.preconditioning);

        let mut run_args = args(Path::new("unused.toml"));
        run_args.force_formulation = Some(ForceFormulation::EnergyFunctional);
        let config = apply_overrides(SimulationConfig::default(), &run_args).unwrap();
        assert_eq!(config.forces.formulation, ForceFormulation::EnergyFunctional);
    }

    #[test]
    fn slic_with_mass_matrix_is_rejected() {
        let mut run_args = args(Path::new("unused.toml"));
        run_args.formulation = Some(FormulationKind::Slic);
        run_args.preconditioner = Some(PreconditionerKind::MassMatrix);
        assert!(apply_overrides(SimulationConfig::default(), &run_args).is_err());
    }

    #[test]
    fn born_scenario_reports_energy_forces_and_samples() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("born.toml");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(BORN.as_bytes())
            .unwrap();
        let scenario = Scenario::load(&path).unwrap();
        let config = scenario.simulation.clone();
        let report = solve(&scenario, &path, config, true, ProgressReporter::new()).unwrap();

        assert_eq!(report.formulation, "direct");
        assert!(report.solver_iterations > 0);
        let expected = -332.064 / 4.0 * (1.0 - 1.0 / 80.0);
        assert!((report.total_energy - expected).abs() < 0.15 * expected.abs());
        assert!(report.bodies[0].force.is_some());
        assert_eq!(report.sample[0].potential, 0.0);
        assert!(report.sample[1].potential > 0.0);

        let out = dir.path().join("results.toml");
        write_report(&report, &out).unwrap();
        let text = std::fs::read_to_string(out).unwrap();
        assert!(text.contains("total-energy"));
        assert!(text.contains("[[body]]"));
    }
}
