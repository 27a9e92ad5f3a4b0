use crate::core::bem::backend::{CollocationBackend, OperatorBackend};
use crate::core::bem::operator::DiscreteOperator;
use crate::core::bem::solver::{Gmres, LinearSolver};
use crate::core::geometry::PointContainment;
use crate::engine::assembly::{AssembledSystem, BlockOperatorAssembler};
use crate::engine::body::{Body, ForceField, SharedParameters, SolvationForces};
use crate::engine::config::SimulationConfig;
use crate::engine::error::EngineError;
use crate::engine::formulation::{FormulationKind, formulation_for};
use crate::engine::progress::{Progress, ProgressReporter};
use nalgebra::{DVector, Point3};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// How much of a previous surface-potential computation may be reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rerun {
    /// Reuse the last solution if every body still holds one.
    #[default]
    Cached,
    /// Drop every cache and start from scratch.
    All,
    /// Keep the operator and preconditioner, rebuild the right-hand side and re-solve.
    Rhs,
}

/// Ordered bodies in one solvent, solved together.
#[derive(Debug)]
pub struct Simulation<'a> {
    config: SimulationConfig,
    bodies: Vec<Body>,
    backend: Arc<dyn OperatorBackend>,
    solver: Arc<dyn LinearSolver>,
    reporter: ProgressReporter<'a>,
    formulation: Option<FormulationKind>,
    system: Option<AssembledSystem>,
    solution: Option<DVector<f64>>,
    iterations: Option<usize>,
}

impl<'a> Simulation<'a> {
    pub fn new(config: SimulationConfig) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self {
            config,
            bodies: Vec::new(),
            backend: Arc::new(CollocationBackend::new()),
            solver: Arc::new(Gmres::new()),
            reporter: ProgressReporter::new(),
            formulation: None,
            system: None,
            solution: None,
            iterations: None,
        })
    }

    pub fn with_backend(mut self, backend: Arc<dyn OperatorBackend>) -> Self {
        self.backend = backend;
        self.drop_global_state();
        self
    }

    pub fn with_solver(mut self, solver: Arc<dyn LinearSolver>) -> Self {
        self.solver = solver;
        self
    }

    pub fn with_reporter(mut self, reporter: ProgressReporter<'a>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Replaces the configuration and reconfigures every body.
    pub fn set_config(&mut self, config: SimulationConfig) -> Result<(), EngineError> {
        config.validate()?;
        self.config = config;
        self.invalidate_and_rebuild()
    }

    /// Appends a body; returns its index.
    pub fn add_body(&mut self, body: Body) -> usize {
        self.bodies.push(body);
        self.drop_global_state();
        self.bodies.len() - 1
    }

    pub fn bodies(&self) -> &[Body] {
        &self.bodies
    }

    pub fn body(&self, index: usize) -> Option<&Body> {
        self.bodies.get(index)
    }

    /// Formulation in effect after the last rebuild.
    pub fn formulation(&self) -> Option<FormulationKind> {
        self.formulation
    }

    pub fn system(&self) -> Option<&AssembledSystem> {
        self.system.as_ref()
    }

    /// Concatenated surface unknowns of the last solve.
    pub fn solution(&self) -> Option<&DVector<f64>> {
        self.solution.as_ref()
    }

    /// Linear-solver iterations of the last solve.
    pub fn iterations(&self) -> Option<usize> {
        self.iterations
    }

    fn drop_global_state(&mut self) {
        self.formulation = None;
        self.system = None;
        self.solution = None;
        self.iterations = None;
    }

    fn resolved_formulation(&self) -> FormulationKind {
        let polarizable = self.bodies.iter().any(|b| b.force_field() == ForceField::Amoeba);
        self.config.formulation.resolve(self.config.stern_layer, polarizable)
    }

    fn shared_parameters(&self, formulation: FormulationKind) -> SharedParameters {
        SharedParameters {
            formulation,
            preconditioner: self.config.effective_preconditioner(formulation),
            ep_ex: self.config.solvent.ep_ex,
            kappa: self.config.solvent.kappa,
        }
    }

    /// Resolves the formulation and pushes the shared parameters into every body.
    ///
    /// Bodies whose parameters changed drop their caches; the global system is
    /// always dropped.
    pub fn invalidate_and_rebuild(&mut self) -> Result<(), EngineError> {
        if self.bodies.is_empty() {
            return Err(EngineError::Configuration("simulation has no bodies".to_string()));
        }
        let formulation = self.resolved_formulation();
        if formulation != self.config.formulation {
            debug!(requested = %self.config.formulation, resolved = %formulation, "Formulation promoted");
        }
        let shared = self.shared_parameters(formulation);
        for body in &mut self.bodies {
            body.configure(shared)?;
        }
        self.drop_global_state();
        self.formulation = Some(formulation);
        Ok(())
    }

    fn ensure_configured(&mut self) -> Result<FormulationKind, EngineError> {
        match self.formulation {
            Some(kind) if kind == self.resolved_formulation() => Ok(kind),
            _ => {
                self.invalidate_and_rebuild()?;
                self.formulation
                    .ok_or_else(|| EngineError::Configuration("formulation could not be resolved".to_string()))
            }
        }
    }

    /// Builds all self systems, couplings, the global preconditioner and right-hand side.
    pub fn create_and_assemble_linear_system(&mut self) -> Result<&AssembledSystem, EngineError> {
        self.ensure_configured()?;
        let assembler = BlockOperatorAssembler::new(self.backend.as_ref());
        let system = assembler.assemble(&mut self.bodies)?;
        Ok(self.system.insert(system))
    }

    /// Rebuilds only the right-hand side of the assembled system.
    pub fn create_and_assemble_rhs(&mut self) -> Result<&AssembledSystem, EngineError> {
        let previous = self
            .system
            .as_ref()
            .ok_or_else(|| EngineError::MissingResult("assembled linear system".to_string()))?;
        let assembler = BlockOperatorAssembler::new(self.backend.as_ref());
        let system = assembler.assemble_rhs(&mut self.bodies, previous)?;
        Ok(self.system.insert(system))
    }

    fn solve(&mut self) -> Result<(), EngineError> {
        let system = self
            .system
            .as_ref()
            .ok_or_else(|| EngineError::MissingResult("assembled linear system".to_string()))?;
        let preconditioner = system.preconditioner.as_deref().map(|p| p as &dyn DiscreteOperator);
        let outcome = self
            .solver
            .solve(system.operator.as_ref(), preconditioner, &system.rhs, &self.config.solver)?;
        debug!(iterations = outcome.iterations, residual = outcome.residual, "Linear system solved");

        let pieces = system.layout.split(&outcome.solution)?;
        for (body, blocks) in self.bodies.iter_mut().zip(pieces) {
            body.set_solution(blocks);
        }
        self.iterations = Some(outcome.iterations);
        self.solution = Some(outcome.solution);
        Ok(())
    }

    fn has_cached_solution(&self) -> bool {
        self.solution.is_some() && self.bodies.iter().all(|b| b.solution().is_some())
    }

    /// Solves for the surface potential and its normal derivative on every body.
    #[instrument(skip_all, name = "surface_potential", fields(rerun = ?rerun))]
    pub fn calculate_surface_potential(&mut self, rerun: Rerun) -> Result<(), EngineError> {
        let formulation = self.ensure_configured()?;
        match rerun {
            Rerun::Cached if self.has_cached_solution() => {
                debug!("Reusing cached surface potential");
                return Ok(());
            }
            Rerun::Rhs if self.system.is_some() => {
                self.in_phase("Right-hand side", |s| s.create_and_assemble_rhs().map(|_| ()))?;
                return self.in_phase("Solve", Self::solve);
            }
            Rerun::All => {
                for body in &mut self.bodies {
                    body.invalidate();
                }
                self.drop_global_state();
                self.formulation = Some(formulation);
            }
            Rerun::Cached | Rerun::Rhs => {}
        }

        info!(
            formulation = %formulation,
            bodies = self.bodies.len(),
            "Computing surface potential"
        );
        match formulation {
            FormulationKind::Direct | FormulationKind::DirectStern => self.solve_once(),
            FormulationKind::Slic => self.solve_slic(),
            FormulationKind::DirectAmoeba => self.solve_polarizable(),
        }
    }

    /// Runs `f` between `PhaseStart` and `PhaseFinish`, reporting the finish on failure too.
    fn in_phase<T>(
        &mut self,
        name: &'static str,
        f: impl FnOnce(&mut Self) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        self.reporter.report(Progress::PhaseStart { name });
        let out = f(self);
        self.reporter.report(Progress::PhaseFinish);
        out
    }

    fn assemble_and_solve(&mut self) -> Result<(), EngineError> {
        self.in_phase("Assembly", |s| s.create_and_assemble_linear_system().map(|_| ()))?;
        self.in_phase("Solve", Self::solve)
    }

    fn solve_once(&mut self) -> Result<(), EngineError> {
        self.assemble_and_solve()?;
        info!(iterations = ?self.iterations, "Surface potential converged");
        Ok(())
    }

    /// Outer loop of the field-dependent Stern layer.
    fn solve_slic(&mut self) -> Result<(), EngineError> {
        self.assemble_and_solve()?;
        let max_iterations = self.config.slic.max_iterations;
        let tolerance = self.config.slic.tolerance;
        self.reporter.report(Progress::TaskStart {
            total_steps: max_iterations as u64,
        });

        let mut change = f64::INFINITY;
        for iteration in 1..=max_iterations {
            let previous = self
                .solution
                .clone()
                .ok_or_else(|| EngineError::MissingResult("surface potential".to_string()))?;
            for body in &mut self.bodies {
                body.update_slic_ratio()?;
            }
            self.assemble_and_solve()?;
            let current = self
                .solution
                .as_ref()
                .ok_or_else(|| EngineError::MissingResult("surface potential".to_string()))?;
            change = relative_change(current, &previous);

            self.reporter.report(Progress::TaskIncrement);
            self.reporter.report(Progress::Iteration {
                stage: "slic",
                iteration,
                residual: change,
            });
            debug!(iteration, change, "SLIC iteration");
            if change < tolerance {
                self.reporter.report(Progress::TaskFinish);
                info!(iterations = iteration, change, "SLIC iteration converged");
                return Ok(());
            }
        }

        self.reporter.report(Progress::TaskFinish);
        warn!(iterations = max_iterations, change, "SLIC iteration did not converge");
        Err(EngineError::Convergence {
            what: "SLIC Stern layer",
            iterations: max_iterations,
            residual: change,
        })
    }

    /// Self-consistent loop between the surface solve and the dissolved induced dipoles.
    fn solve_polarizable(&mut self) -> Result<(), EngineError> {
        self.assemble_and_solve()?;
        let polarization = self.config.polarization;
        let h = self.config.fd_step;
        let backend = Arc::clone(&self.backend);
        self.reporter.report(Progress::TaskStart {
            total_steps: polarization.max_outer_iterations as u64,
        });

        let mut residual = f64::INFINITY;
        for iteration in 1..=polarization.max_outer_iterations {
            #[cfg(not(feature = "parallel"))]
            let iter = self.bodies.iter_mut();

            #[cfg(feature = "parallel")]
            let iter = self.bodies.par_iter_mut();

            let residuals = iter
                .map(|body| body.relax_dissolved(backend.as_ref(), h, &polarization))
                .collect::<Result<Vec<f64>, EngineError>>()?;
            residual = residuals.into_iter().fold(0.0, f64::max);

            self.create_and_assemble_rhs()?;
            self.in_phase("Solve", Self::solve)?;

            self.reporter.report(Progress::TaskIncrement);
            self.reporter.report(Progress::Iteration {
                stage: "polarization",
                iteration,
                residual,
            });
            debug!(iteration, residual, "Polarization iteration");
            if residual < polarization.tolerance {
                self.reporter.report(Progress::TaskFinish);
                info!(iterations = iteration, residual, "Induced dipoles converged");
                return Ok(());
            }
        }

        self.reporter.report(Progress::TaskFinish);
        warn!(
            iterations = polarization.max_outer_iterations,
            residual, "Induced dipoles did not converge"
        );
        Err(EngineError::Convergence {
            what: "dissolved induced dipoles",
            iterations: polarization.max_outer_iterations,
            residual,
        })
    }

    /// Solvation energy of every body in kcal/mol, in insertion order.
    #[instrument(skip_all, name = "simulation_energy")]
    pub fn calculate_solvation_energy(&mut self) -> Result<Vec<f64>, EngineError> {
        self.calculate_surface_potential(Rerun::Cached)?;
        let backend = self.backend.as_ref();
        let h = self.config.fd_step;
        let polarization = self.config.polarization;

        #[cfg(not(feature = "parallel"))]
        let iter = self.bodies.iter_mut();

        #[cfg(feature = "parallel")]
        let iter = self.bodies.par_iter_mut();

        let energies = iter
            .map(|body| body.calculate_solvation_energy(backend, h, &polarization))
            .collect::<Result<Vec<f64>, EngineError>>()?;
        info!(total = energies.iter().sum::<f64>(), "Solvation energy computed");
        Ok(energies)
    }

    /// Solvation forces of every body in kcal/(mol Angstrom), in insertion order.
    #[instrument(skip_all, name = "simulation_forces")]
    pub fn calculate_solvation_forces(&mut self) -> Result<Vec<SolvationForces>, EngineError> {
        self.calculate_surface_potential(Rerun::Cached)?;
        let backend = self.backend.as_ref();
        let h = self.config.fd_step;
        let options = self.config.forces;

        #[cfg(not(feature = "parallel"))]
        let iter = self.bodies.iter_mut();

        #[cfg(feature = "parallel")]
        let iter = self.bodies.par_iter_mut();

        iter.map(|body| body.calculate_solvation_forces(backend, h, &options).cloned())
            .collect()
    }

    /// Electrostatic potential in the solvent; points inside any body read zero.
    #[instrument(skip_all, name = "solvent_potential", fields(points = points.len()))]
    pub fn calculate_potential_solvent(
        &mut self,
        points: &[Point3<f64>],
        containment: &dyn PointContainment,
    ) -> Result<DVector<f64>, EngineError> {
        let formulation = self.ensure_configured()?;
        self.calculate_surface_potential(Rerun::Cached)?;
        let stern = formulation_for(formulation).has_stern_layer();

        let mut inside = vec![false; points.len()];
        for body in &self.bodies {
            let mask = containment.contains(body.outer_interface(stern)?, points);
            for (flag, hit) in inside.iter_mut().zip(mask) {
                *flag |= hit;
            }
        }
        let outside: Vec<usize> = (0..points.len()).filter(|&i| !inside[i]).collect();
        let targets: Vec<Point3<f64>> = outside.iter().map(|&i| points[i]).collect();

        let mut total = DVector::zeros(targets.len());
        for body in &self.bodies {
            total += body.solvent_potential_at(self.backend.as_ref(), &targets)?;
        }

        let mut potential = DVector::zeros(points.len());
        for (k, &i) in outside.iter().enumerate() {
            potential[i] = total[k];
        }
        debug!(masked = points.len() - outside.len(), "Solvent potential evaluated");
        Ok(potential)
    }
}

/// `|a - b| / |a|`, or the absolute change when `a` vanishes.
fn relative_change(current: &DVector<f64>, previous: &DVector<f64>) -> f64 {
    let norm = current.norm();
    let diff = (current - previous).norm();
    if norm > 0.0 { diff / norm } else { diff }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::geometry::RayCastContainment;
    use crate::core::models::interface::Interface;
    use crate::core::models::particle::{Particle, ParticleSet};
    use crate::engine::body::SlicParameters;
    use crate::engine::config::{ForceConfig, ForceFormulation, SimulationConfigBuilder};
    use std::f64::consts::PI;
    use std::sync::Mutex;

    const ENERGY_PREFACTOR: f64 = 332.064;

    fn f64_approx_equal(a: f64, b: f64, rel: f64) -> bool {
        (a - b).abs() <= rel * b.abs()
    }

    fn ion(name: &str, center: Point3<f64>, charge: f64, radius: f64, subdivisions: u32) -> Body {
        let particles = ParticleSet::from_point_charges(&[center], &[charge]).unwrap();
        let interface = Interface::sphere(center, radius, subdivisions).unwrap();
        Body::new(name, interface, particles).unwrap()
    }

    fn config(kind: FormulationKind, ep_ex: f64, kappa: f64) -> SimulationConfig {
        SimulationConfigBuilder::new()
            .formulation(kind)
            .solvent(ep_ex, kappa)
            .build()
            .unwrap()
    }

    fn born_energy(charge: f64, radius: f64, ep_in: f64, ep_ex: f64) -> f64 {
        -ENERGY_PREFACTOR / (2.0 * radius) * (1.0 / ep_in - 1.0 / ep_ex) * charge * charge
    }

    fn born_error(subdivisions: u32) -> f64 {
        let mut simulation = Simulation::new(config(FormulationKind::Direct, 80.0, 0.0)).unwrap();
        simulation.add_body(ion("born", Point3::origin(), 1.0, 2.0, subdivisions).with_ep_in(1.0));
        let energy = simulation.calculate_solvation_energy().unwrap()[0];
        let expected = born_energy(1.0, 2.0, 1.0, 80.0);
        ((energy - expected) / expected).abs()
    }

    #[test]
    fn born_ion_matches_analytic_energy() {
        let coarse = born_error(1);
        let fine = born_error(3);
        assert!(fine < 0.05, "relative error {fine} on the fine mesh");
        assert!(fine < coarse, "refinement did not help: {coarse} -> {fine}");
    }

    #[test]
    fn zero_iteration_ceiling_is_rejected_up_front() {
        let mut cfg = SimulationConfig::default();
        cfg.polarization.max_outer_iterations = 0;
        let err = Simulation::new(cfg).unwrap_err();
        assert!(matches!(err, EngineError::Config { .. }));
    }

    #[test]
    fn empty_simulation_is_rejected() {
        let mut simulation = Simulation::new(config(FormulationKind::Direct, 80.0, 0.125)).unwrap();
        let err = simulation.calculate_surface_potential(Rerun::All).unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }

    #[test]
    fn cached_rerun_does_not_solve_again() {
        let mut simulation = Simulation::new(config(FormulationKind::Direct, 80.0, 0.125)).unwrap();
        simulation.add_body(ion("ion", Point3::origin(), 1.0, 2.0, 1));
        simulation.calculate_surface_potential(Rerun::Cached).unwrap();
        let first = simulation.system().unwrap().operator.clone();

        simulation.calculate_surface_potential(Rerun::Cached).unwrap();
        assert!(Arc::ptr_eq(&first, &simulation.system().unwrap().operator));

        simulation.calculate_surface_potential(Rerun::Rhs).unwrap();
        assert!(Arc::ptr_eq(&first, &simulation.system().unwrap().operator));

        simulation.calculate_surface_potential(Rerun::All).unwrap();
        assert!(!Arc::ptr_eq(&first, &simulation.system().unwrap().operator));
    }

    #[test]
    fn distant_ions_solvate_independently() {
        let mut single = Simulation::new(config(FormulationKind::Direct, 80.0, 0.125)).unwrap();
        single.add_body(ion("a", Point3::origin(), 1.0, 2.0, 2));
        let alone = single.calculate_solvation_energy().unwrap()[0];

        let mut pair = Simulation::new(config(FormulationKind::Direct, 80.0, 0.125)).unwrap();
        pair.add_body(ion("a", Point3::origin(), 1.0, 2.0, 2));
        pair.add_body(ion("b", Point3::new(200.0, 0.0, 0.0), 1.0, 2.0, 2));
        let energies = pair.calculate_solvation_energy().unwrap();

        assert_eq!(pair.system().unwrap().layout.body_count(), 2);
        assert!(f64_approx_equal(energies[0], alone, 1e-3));
        assert!(f64_approx_equal(energies[1], alone, 1e-3));
    }

    #[test]
    fn stern_layer_flag_promotes_direct() {
        let cfg = SimulationConfigBuilder::new()
            .formulation(FormulationKind::Direct)
            .stern_layer(true)
            .solvent(80.0, 0.125)
            .build()
            .unwrap();
        let mut simulation = Simulation::new(cfg).unwrap();
        simulation.add_body(ion("ion", Point3::origin(), 1.0, 2.0, 1));
        simulation.calculate_surface_potential(Rerun::Cached).unwrap();

        assert_eq!(simulation.formulation(), Some(FormulationKind::DirectStern));
        assert!(simulation.bodies()[0].solution().unwrap().has_stern_layer());
        assert_eq!(simulation.system().unwrap().layout.block_count(), 4);
    }

    #[test]
    fn solvent_potential_is_masked_inside_and_decays_outside() {
        let mut simulation = Simulation::new(config(FormulationKind::Direct, 80.0, 0.125)).unwrap();
        simulation.add_body(ion("ion", Point3::origin(), 1.0, 1.0, 3));
        let points = [
            Point3::new(0.1, 0.0, 0.0),
            Point3::new(5.0, 0.0, 0.0),
            Point3::new(0.0, 8.0, 0.0),
        ];
        let phi = simulation
            .calculate_potential_solvent(&points, &RayCastContainment::new())
            .unwrap();

        assert_eq!(phi[0], 0.0);
        let analytic = |r: f64| (-0.125 * (r - 1.0)).exp() / (4.0 * PI * 80.0 * r * 1.125);
        assert!(f64_approx_equal(phi[1], analytic(5.0), 0.25), "phi(5) = {}", phi[1]);
        assert!(phi[2].abs() < phi[1].abs());
    }

    #[test]
    fn slic_converges_with_a_weak_field_response() {
        let mut simulation = Simulation::new(config(FormulationKind::Slic, 80.0, 0.125)).unwrap();
        let weak = SlicParameters {
            alpha: 0.01,
            ..SlicParameters::default()
        };
        simulation.add_body(ion("ion", Point3::origin(), 1.0, 2.0, 1).with_slic_parameters(weak));
        simulation.calculate_surface_potential(Rerun::All).unwrap();

        let e_hat = simulation.bodies()[0].slic_e_hat().unwrap();
        assert!(e_hat.iter().all(|v| v.is_finite() && (v - 0.05).abs() < 0.02));
        assert!(simulation.calculate_solvation_energy().unwrap()[0] < 0.0);
    }

    #[test]
    fn polarizable_body_reaches_self_consistency() {
        let particles = ParticleSet::new(vec![
            Particle::point_charge(Point3::origin(), 1.0, 0).with_polarization(0.0, 0.39),
            Particle::point_charge(Point3::new(1.0, 0.0, 0.0), 0.0, 1).with_polarization(1.0, 0.39),
        ]);
        let interface = Interface::sphere(Point3::origin(), 3.0, 2).unwrap();
        let body = Body::new("polar", interface, particles).unwrap().with_ep_in(1.0);
        assert_eq!(body.force_field(), ForceField::Amoeba);

        let events = Mutex::new(Vec::new());
        let reporter = ProgressReporter::with_callback(Box::new(|e| {
            if let Progress::Iteration { stage, .. } = e {
                events.lock().unwrap().push(stage);
            }
        }));
        let mut simulation = Simulation::new(config(FormulationKind::Direct, 80.0, 0.125))
            .unwrap()
            .with_reporter(reporter);
        simulation.add_body(body);
        let energy = simulation.calculate_solvation_energy().unwrap()[0];

        assert_eq!(simulation.formulation(), Some(FormulationKind::DirectAmoeba));
        let state = simulation.bodies()[0].dissolved_state();
        assert!(state.iterations() >= 1);
        assert!(state.residual() < simulation.config().polarization.tolerance);
        assert!(state.current()[1].x > 0.0);
        assert!(energy < 0.0);
        drop(simulation);
        let stages = events.into_inner().unwrap();
        assert!(!stages.is_empty());
        assert!(stages.iter().all(|&s| s == "polarization"));
    }

    #[test]
    fn forces_on_a_centered_ion_cancel() {
        let mut simulation = Simulation::new(config(FormulationKind::Direct, 80.0, 0.125)).unwrap();
        simulation.add_body(ion("ion", Point3::origin(), 1.0, 2.0, 2));
        let forces = simulation.calculate_solvation_forces().unwrap();
        assert_eq!(forces[0].formulation, ForceFormulation::MaxwellTensor);
        let gross = forces[0].element_force.as_ref().unwrap().sum();
        assert!(gross > 0.0);
        assert!(forces[0].f_solv.norm() < 1e-3 * gross);
    }

    fn ion_pair_forces(formulation: ForceFormulation) -> Vec<SolvationForces> {
        let config = SimulationConfigBuilder::new()
            .formulation(FormulationKind::Direct)
            .solvent(80.0, 0.125)
            .forces(ForceConfig {
                formulation,
                approximate_dielectric_boundary: false,
            })
            .build()
            .unwrap();
        let mut simulation = Simulation::new(config).unwrap();
        simulation.add_body(ion("left", Point3::new(-3.0, 0.0, 0.0), 1.0, 2.0, 2));
        simulation.add_body(ion("right", Point3::new(3.0, 0.0, 0.0), 1.0, 2.0, 2));
        simulation.calculate_solvation_forces().unwrap()
    }

    #[test]
    fn like_ions_repel_under_both_force_formulations() {
        let maxwell = ion_pair_forces(ForceFormulation::MaxwellTensor);
        let functional = ion_pair_forces(ForceFormulation::EnergyFunctional);

        for forces in [&maxwell, &functional] {
            let (left, right) = (forces[0].f_solv, forces[1].f_solv);
            assert!(left.x < 0.0, "left ion pulled toward its neighbor: {left:?}");
            assert!((left + right).norm() < 1e-2 * left.norm());
            assert!(left.y.abs().max(left.z.abs()) < 1e-2 * left.x.abs());
        }
        assert_eq!(functional[0].per_particle.as_ref().map(Vec::len), Some(1));
        assert!(maxwell[0].per_particle.is_none());

        let ratio = maxwell[0].f_solv.x / functional[0].f_solv.x;
        assert!((0.25..=4.0).contains(&ratio), "formulations disagree: ratio {ratio}");
    }
}
