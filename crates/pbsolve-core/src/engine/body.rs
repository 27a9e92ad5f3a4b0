use crate::core::bem::backend::{Kernel, OperatorBackend};
use crate::core::bem::operator::{BlockedBoundaryOperator, BlockedDiscreteOperator, DiscreteForm};
use crate::core::bem::sparse::CsrMatrix;
use crate::core::models::interface::Interface;
use crate::core::models::particle::ParticleSet;
use crate::core::models::topology::{ExclusionScale, ExclusionTopology};
use crate::core::multipole::{MultipoleKernel, SiteField, coulomb_energy};
use crate::engine::config::{ForceConfig, ForceFormulation, PolarizationConfig};
use crate::engine::error::EngineError;
use crate::engine::formulation::slic::field_dependent_ratio;
use crate::engine::formulation::{FormulationKind, PreconditionerKind, formulation_for};
use crate::engine::polarization::{InducedDipoleSolver, InducedDipoleState};
use nalgebra::{DVector, Matrix3, Point3, Vector3};
use std::f64::consts::PI;
use std::sync::Arc;
use tracing::{debug, instrument};

/// `332.064` kcal/mol, the electrostatic energy of two unit charges one Angstrom apart.
const ENERGY_PREFACTOR: f64 = 332.064;
/// Force conversion to kcal/(mol Angstrom).
const FORCE_PREFACTOR: f64 = 4.0 * PI * 332.063_681_782_383_6;
const KAPPA_EPSILON: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForceField {
    /// Fixed point charges.
    Amber,
    /// Permanent multipoles with induced dipoles.
    Amoeba,
}

/// Shape of the field-dependent Stern-layer response.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlicParameters {
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
}

impl Default for SlicParameters {
    fn default() -> Self {
        Self {
            alpha: 0.5,
            beta: -60.0,
            gamma: -0.5,
        }
    }
}

/// Simulation-wide values every body is configured with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SharedParameters {
    pub formulation: FormulationKind,
    pub preconditioner: Option<PreconditionerKind>,
    pub ep_ex: f64,
    pub kappa: f64,
}

/// Surface unknowns of one body, one vector per sub-block.
#[derive(Debug, Clone, PartialEq)]
pub struct SurfaceSolution {
    blocks: Vec<DVector<f64>>,
}

impl SurfaceSolution {
    pub fn new(blocks: Vec<DVector<f64>>) -> Self {
        Self { blocks }
    }

    pub fn blocks(&self) -> &[DVector<f64>] {
        &self.blocks
    }

    /// Potential on the dielectric interface.
    pub fn potential(&self) -> &DVector<f64> {
        &self.blocks[0]
    }

    /// Normal derivative on the dielectric interface, taken on the solute side.
    pub fn normal_derivative(&self) -> &DVector<f64> {
        &self.blocks[1]
    }

    /// Potential on the surface bordering the ionic solvent.
    pub fn outer_potential(&self) -> &DVector<f64> {
        &self.blocks[self.blocks.len() - 2]
    }

    pub fn outer_normal_derivative(&self) -> &DVector<f64> {
        &self.blocks[self.blocks.len() - 1]
    }

    pub fn has_stern_layer(&self) -> bool {
        self.blocks.len() == 4
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SolvationForces {
    pub formulation: ForceFormulation,
    /// Reaction-field force on every particle. Energy functional only.
    pub per_particle: Option<Vec<Vector3<f64>>>,
    pub f_qf: Option<Vector3<f64>>,
    pub f_db: Option<Vector3<f64>>,
    pub f_ib: Vector3<f64>,
    /// Magnitude of the Maxwell force on each dielectric-interface element. Maxwell tensor only.
    pub element_force: Option<DVector<f64>>,
    pub f_solv: Vector3<f64>,
}

/// The self system of one body, ready to be placed in the global block operator.
#[derive(Debug, Clone)]
pub struct BodySystem {
    pub lhs: BlockedBoundaryOperator,
    pub operator: Arc<BlockedDiscreteOperator>,
    pub preconditioner: Option<Arc<CsrMatrix>>,
    pub rhs: Vec<DVector<f64>>,
    pub form: DiscreteForm,
}

/// A solute: its surfaces, its multipole sites and everything cached about it.
#[derive(Debug, Clone)]
pub struct Body {
    name: String,
    interface: Arc<Interface>,
    stern_interface: Option<Arc<Interface>>,
    particles: ParticleSet,
    topology: ExclusionTopology,
    force_field: ForceField,
    ep_in: f64,
    ep_stern: Option<f64>,
    stern_width: f64,
    slic: SlicParameters,
    exclusion_scale: ExclusionScale,

    shared: Option<SharedParameters>,
    slic_e_hat: Option<DVector<f64>>,
    system: Option<BodySystem>,
    solution: Option<SurfaceSolution>,
    dissolved: InducedDipoleState,
    vacuum: InducedDipoleState,
    polarizing_gradient: Option<Vec<Vector3<f64>>>,
    reaction: Option<(f64, SiteField)>,
    energy: Option<f64>,
    forces: Option<SolvationForces>,
}

impl Body {
    pub fn new(name: impl Into<String>, interface: Interface, particles: ParticleSet) -> Result<Self, EngineError> {
        let name = name.into();
        if particles.is_empty() {
            return Err(EngineError::Configuration(format!("body '{name}' has no particles")));
        }
        let n = particles.len();
        let force_field = if particles.is_polarizable() {
            ForceField::Amoeba
        } else {
            ForceField::Amber
        };
        Ok(Self {
            name,
            interface: Arc::new(interface),
            stern_interface: None,
            topology: ExclusionTopology::empty(n),
            particles,
            force_field,
            ep_in: 4.0,
            ep_stern: None,
            stern_width: 2.0,
            slic: SlicParameters::default(),
            exclusion_scale: ExclusionScale::NONE,
            shared: None,
            slic_e_hat: None,
            system: None,
            solution: None,
            dissolved: InducedDipoleState::new(n),
            vacuum: InducedDipoleState::new(n),
            polarizing_gradient: None,
            reaction: None,
            energy: None,
            forces: None,
        })
    }

    pub fn with_topology(mut self, topology: ExclusionTopology) -> Result<Self, EngineError> {
        if topology.particle_count() != self.particles.len() {
            return Err(EngineError::ShapeMismatch(format!(
                "topology covers {} particles, body '{}' has {}",
                topology.particle_count(),
                self.name,
                self.particles.len()
            )));
        }
        self.topology = topology;
        Ok(self)
    }

    pub fn with_force_field(mut self, force_field: ForceField) -> Self {
        self.force_field = force_field;
        self
    }

    pub fn with_ep_in(mut self, ep_in: f64) -> Self {
        self.ep_in = ep_in;
        self
    }

    pub fn with_ep_stern(mut self, ep_stern: f64) -> Self {
        self.ep_stern = Some(ep_stern);
        self
    }

    /// Distance of the generated Stern surface from the dielectric interface.
    pub fn with_stern_width(mut self, width: f64) -> Self {
        self.stern_width = width;
        self
    }

    /// Uses an explicit Stern surface instead of offsetting the dielectric interface.
    pub fn with_stern_interface(mut self, stern: Interface) -> Self {
        self.stern_interface = Some(Arc::new(stern));
        self
    }

    pub fn with_slic_parameters(mut self, params: SlicParameters) -> Self {
        self.slic = params;
        self
    }

    /// Scaling of bonded induced-dipole pairs in the multipole Coulomb energy.
    pub fn with_exclusion_scale(mut self, scale: ExclusionScale) -> Self {
        self.exclusion_scale = scale;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interface(&self) -> &Interface {
        &self.interface
    }

    pub fn stern_interface(&self) -> Option<&Interface> {
        self.stern_interface.as_deref()
    }

    pub fn particles(&self) -> &ParticleSet {
        &self.particles
    }

    pub fn topology(&self) -> &ExclusionTopology {
        &self.topology
    }

    pub fn force_field(&self) -> ForceField {
        self.force_field
    }

    pub fn ep_in(&self) -> f64 {
        self.ep_in
    }

    /// Permittivity of the Stern layer, the solvent's when not set explicitly.
    pub fn ep_stern(&self, ep_ex: f64) -> f64 {
        self.ep_stern.unwrap_or(ep_ex)
    }

    pub fn slic_parameters(&self) -> &SlicParameters {
        &self.slic
    }

    pub fn shared(&self) -> Result<&SharedParameters, EngineError> {
        self.shared
            .as_ref()
            .ok_or_else(|| EngineError::Configuration(format!("body '{}' is not configured", self.name)))
    }

    /// Applies shared parameters, dropping every cache if they changed.
    pub fn configure(&mut self, shared: SharedParameters) -> Result<(), EngineError> {
        if self.shared != Some(shared) {
            self.invalidate();
            self.shared = Some(shared);
        }
        if formulation_for(shared.formulation).has_stern_layer() && self.stern_interface.is_none() {
            debug!(body = %self.name, width = self.stern_width, "Generating Stern surface");
            self.stern_interface = Some(Arc::new(self.interface.offset(self.stern_width)?));
        }
        Ok(())
    }

    pub fn invalidate(&mut self) {
        self.slic_e_hat = None;
        self.system = None;
        self.solution = None;
        self.dissolved.reset();
        self.vacuum.reset();
        self.polarizing_gradient = None;
        self.clear_results();
    }

    fn clear_results(&mut self) {
        self.reaction = None;
        self.energy = None;
        self.forces = None;
    }

    /// Sub-block sizes: `[n_d, n_d]`, or `[n_d, n_d, n_s, n_s]` with a Stern layer.
    pub fn block_dofs(&self, stern: bool) -> Result<Vec<usize>, EngineError> {
        let nd = self.interface.dof_count();
        if stern {
            let ns = self.required_stern()?.dof_count();
            Ok(vec![nd, nd, ns, ns])
        } else {
            Ok(vec![nd, nd])
        }
    }

    /// The surface in contact with the ionic solvent.
    pub fn outer_interface(&self, stern: bool) -> Result<&Interface, EngineError> {
        if stern { self.required_stern() } else { Ok(&self.interface) }
    }

    /// Permittivity on the inner side of the outer surface.
    pub fn outer_permittivity(&self, stern: bool, ep_ex: f64) -> f64 {
        if stern { self.ep_stern(ep_ex) } else { self.ep_in }
    }

    fn required_stern(&self) -> Result<&Interface, EngineError> {
        self.stern_interface()
            .ok_or_else(|| EngineError::Configuration(format!("body '{}' has no Stern surface", self.name)))
    }

    fn uses_stern(&self) -> Result<bool, EngineError> {
        Ok(formulation_for(self.shared()?.formulation).has_stern_layer())
    }

    pub fn slic_e_hat(&self) -> Option<&DVector<f64>> {
        self.slic_e_hat.as_ref()
    }

    /// Replaces the per-dof Stern ratio; the self system must be rebuilt afterwards.
    pub(crate) fn set_slic_e_hat(&mut self, e_hat: DVector<f64>) {
        self.slic_e_hat = Some(e_hat);
        self.system = None;
    }

    /// Recomputes the per-dof Stern ratio from the current solution.
    pub(crate) fn update_slic_ratio(&mut self) -> Result<(), EngineError> {
        let shared = *self.shared()?;
        let solution = self.require_solution()?;
        let e_hat = field_dependent_ratio(
            solution.normal_derivative(),
            self.ep_in,
            self.ep_stern(shared.ep_ex),
            &self.slic,
        );
        self.set_slic_e_hat(e_hat);
        Ok(())
    }

    pub fn dissolved_dipoles(&self) -> &[Vector3<f64>] {
        self.dissolved.current()
    }

    pub fn dissolved_state(&self) -> &InducedDipoleState {
        &self.dissolved
    }

    pub fn vacuum_state(&self) -> &InducedDipoleState {
        &self.vacuum
    }

    pub(crate) fn set_dissolved_dipoles(&mut self, dipoles: Vec<Vector3<f64>>) {
        self.dissolved.seed(dipoles);
    }

    pub fn system(&self) -> Option<&BodySystem> {
        self.system.as_ref()
    }

    /// Builds the self blocks, right-hand side and local preconditioner.
    #[instrument(skip_all, name = "body_system", fields(body = %self.name))]
    pub(crate) fn build_system(&mut self, backend: &dyn OperatorBackend) -> Result<(), EngineError> {
        let shared = *self.shared()?;
        let formulation = formulation_for(shared.formulation);
        if !formulation.verify_applicable(self) {
            return Err(EngineError::Configuration(format!(
                "formulation '{}' is not applicable to body '{}'",
                shared.formulation, self.name
            )));
        }
        if let Some(kind) = shared.preconditioner {
            if !formulation.supports_preconditioner(kind) {
                return Err(EngineError::Configuration(format!(
                    "formulation '{}' does not support the '{kind}' preconditioner",
                    shared.formulation
                )));
            }
        }

        let lhs = formulation.build_self_lhs(self, backend)?;
        let rhs = formulation.build_rhs(self, backend)?;
        let form = PreconditionerKind::discrete_form(shared.preconditioner);
        let preconditioner = match shared.preconditioner {
            Some(PreconditionerKind::BlockDiagonal) => Some(Arc::new(formulation.build_preconditioner(self, &lhs)?)),
            Some(PreconditionerKind::MassMatrix) | None => None,
        };
        let operator = Arc::new(lhs.discrete(form)?);
        let rhs = formulation.build_rhs_preconditioner(&rhs, form);
        debug!(blocks = lhs.block_shape().0, ?form, "Self system assembled");

        self.system = Some(BodySystem {
            lhs,
            operator,
            preconditioner,
            rhs,
            form,
        });
        Ok(())
    }

    /// Recomputes only the right-hand side of an existing self system.
    pub(crate) fn rebuild_rhs(&mut self, backend: &dyn OperatorBackend) -> Result<(), EngineError> {
        let shared = *self.shared()?;
        let formulation = formulation_for(shared.formulation);
        let rhs = formulation.build_rhs(self, backend)?;
        let system = self
            .system
            .as_mut()
            .ok_or_else(|| EngineError::MissingResult(format!("self system of body '{}'", self.name)))?;
        system.rhs = formulation.build_rhs_preconditioner(&rhs, system.form);
        Ok(())
    }

    pub fn solution(&self) -> Option<&SurfaceSolution> {
        self.solution.as_ref()
    }

    pub(crate) fn set_solution(&mut self, blocks: Vec<DVector<f64>>) {
        self.solution = Some(SurfaceSolution::new(blocks));
        self.clear_results();
    }

    fn require_solution(&self) -> Result<&SurfaceSolution, EngineError> {
        self.solution
            .as_ref()
            .ok_or_else(|| EngineError::MissingResult(format!("surface potential of body '{}'", self.name)))
    }

    /// Reaction potential `V dphi - K phi` of the dielectric interface at arbitrary points.
    pub fn reaction_potential_at(
        &self,
        backend: &dyn OperatorBackend,
        points: &[Point3<f64>],
    ) -> Result<DVector<f64>, EngineError> {
        let solution = self.require_solution()?;
        let slp = backend.single_layer_potential(Kernel::Laplace, &self.interface, points);
        let dlp = backend.double_layer_potential(Kernel::Laplace, &self.interface, points);
        Ok(slp.evaluate(solution.normal_derivative())? - dlp.evaluate(solution.potential())?)
    }

    /// Reaction potential, gradient and Hessian at the particles by central differences.
    pub fn reaction_field(&mut self, backend: &dyn OperatorBackend, h: f64) -> Result<&SiteField, EngineError> {
        let stale = !matches!(&self.reaction, Some((step, _)) if *step == h);
        if stale {
            let centers = self.particles.positions();
            let field = finite_difference_field(&centers, h, |points| self.reaction_potential_at(backend, points))?;
            self.reaction = Some((h, field));
        }
        match &self.reaction {
            Some((_, field)) => Ok(field),
            None => Err(EngineError::MissingResult(format!("reaction field of body '{}'", self.name))),
        }
    }

    /// One dissolved-regime relaxation of the induced dipoles; returns its residual.
    pub(crate) fn relax_dissolved(
        &mut self,
        backend: &dyn OperatorBackend,
        h: f64,
        polarization: &PolarizationConfig,
    ) -> Result<f64, EngineError> {
        let reaction_gradient = self.reaction_field(backend, h)?.gradient.clone();
        let kernel = MultipoleKernel::new(&self.particles, &self.topology)?;
        let permanent = cached_polarizing_gradient(&mut self.polarizing_gradient, &kernel);
        let solver = InducedDipoleSolver::new(kernel, permanent, self.ep_in, polarization.sor)?;
        solver.step_dissolved(&mut self.dissolved, &reaction_gradient, polarization.tolerance)
    }

    /// Cached polarizing field gradient of the permanent multipoles, once computed.
    pub fn polarizing_gradient(&self) -> Option<&[Vector3<f64>]> {
        self.polarizing_gradient.as_deref()
    }

    /// Solvation free energy in kcal/mol.
    #[instrument(skip_all, name = "solvation_energy", fields(body = %self.name))]
    pub fn calculate_solvation_energy(
        &mut self,
        backend: &dyn OperatorBackend,
        h: f64,
        polarization: &PolarizationConfig,
    ) -> Result<f64, EngineError> {
        let energy = match self.force_field {
            ForceField::Amber => {
                let phi = self.reaction_potential_at(backend, &self.particles.positions())?;
                let sum: f64 = self.particles.iter().zip(phi.iter()).map(|(p, v)| p.charge * v).sum();
                2.0 * PI * ENERGY_PREFACTOR * sum
            }
            ForceField::Amoeba => self.polarizable_energy(backend, h, polarization)?,
        };
        debug!(energy, "Solvation energy computed");
        self.energy = Some(energy);
        Ok(energy)
    }

    fn polarizable_energy(
        &mut self,
        backend: &dyn OperatorBackend,
        h: f64,
        polarization: &PolarizationConfig,
    ) -> Result<f64, EngineError> {
        let reaction = self.reaction_field(backend, h)?.clone();
        let solvent: f64 = self
            .particles
            .iter()
            .enumerate()
            .map(|(i, p)| {
                p.charge * reaction.potential[i]
                    + p.dipole.dot(&reaction.gradient[i])
                    + p.quadrupole.component_mul(&reaction.hessian[i]).sum() / 6.0
            })
            .sum();

        let kernel = MultipoleKernel::new(&self.particles, &self.topology)?;
        let permanent = cached_polarizing_gradient(&mut self.polarizing_gradient, &kernel);
        let solver = InducedDipoleSolver::new(kernel, permanent, self.ep_in, polarization.sor)?;
        self.vacuum.reset();
        solver.solve_vacuum(&mut self.vacuum, polarization.tolerance, polarization.max_iterations)?;

        let dissolved_field = kernel.total_field(self.dissolved.current(), self.exclusion_scale);
        let vacuum_field = kernel.total_field(self.vacuum.current(), self.exclusion_scale);
        let coulomb_dissolved = coulomb_energy(&self.particles, &dissolved_field, self.ep_in);
        let coulomb_vacuum = coulomb_energy(&self.particles, &vacuum_field, self.ep_in);

        Ok(2.0 * PI * ENERGY_PREFACTOR * solvent + coulomb_dissolved - coulomb_vacuum)
    }

    /// Total solvation force in kcal/(mol Angstrom), with the terms of the chosen formulation.
    #[instrument(skip_all, name = "solvation_forces", fields(body = %self.name, formulation = %options.formulation))]
    pub fn calculate_solvation_forces(
        &mut self,
        backend: &dyn OperatorBackend,
        h: f64,
        options: &ForceConfig,
    ) -> Result<&SolvationForces, EngineError> {
        let shared = *self.shared()?;
        let stern = self.uses_stern()?;
        let outer = surface_sum(self.outer_interface(stern)?, self.require_solution()?.outer_potential());
        let f_ib = -0.5 * FORCE_PREFACTOR * shared.ep_ex * shared.kappa * shared.kappa * outer;

        let forces = match options.formulation {
            ForceFormulation::EnergyFunctional => {
                let gradient = self.reaction_field(backend, h)?.gradient.clone();
                let per_particle: Vec<Vector3<f64>> = self
                    .particles
                    .iter()
                    .zip(&gradient)
                    .map(|(p, g)| g * (-FORCE_PREFACTOR * p.charge))
                    .collect();
                let f_qf = per_particle.iter().sum::<Vector3<f64>>();
                let f_db = if options.approximate_dielectric_boundary {
                    self.approximate_dielectric_boundary_force(shared.ep_ex)?
                } else {
                    self.dielectric_boundary_force(shared.ep_ex)?
                };
                SolvationForces {
                    formulation: options.formulation,
                    per_particle: Some(per_particle),
                    f_qf: Some(f_qf),
                    f_db: Some(f_db),
                    f_ib,
                    element_force: None,
                    f_solv: f_qf + f_db + f_ib,
                }
            }
            ForceFormulation::MaxwellTensor => {
                let (total, element_force) = self.maxwell_stress_force(shared.ep_ex)?;
                SolvationForces {
                    formulation: options.formulation,
                    per_particle: None,
                    f_qf: None,
                    f_db: None,
                    f_ib,
                    element_force: Some(element_force),
                    f_solv: total + f_ib,
                }
            }
        };
        debug!(f_solv = ?forces.f_solv, "Solvation forces computed");
        self.forces = Some(forces);
        match &self.forces {
            Some(forces) => Ok(forces),
            None => Err(EngineError::MissingResult(format!("forces of body '{}'", self.name))),
        }
    }

    /// Solvent-side field on the dielectric interface, split into the normal
    /// component and the in-plane vector of every element.
    fn interface_field(&self, ep_ex: f64) -> Result<(Vec<f64>, Vec<Vector3<f64>>), EngineError> {
        let solution = self.require_solution()?;
        let ep_hat = self.ep_in / ep_ex;
        let normal = solution.normal_derivative().iter().map(|d| -ep_hat * d).collect();
        let potential = solution.potential().as_slice();
        let vertex_potential = self.interface.vertex_values(potential)?;
        let tangential = self
            .interface
            .tangential_gradients(&vertex_potential)?
            .into_iter()
            .map(|g| -g)
            .collect();
        Ok((normal, tangential))
    }

    /// Dielectric boundary force from the normal derivative alone.
    fn approximate_dielectric_boundary_force(&self, ep_ex: f64) -> Result<Vector3<f64>, EngineError> {
        let dielectric = surface_sum(&self.interface, self.require_solution()?.normal_derivative());
        Ok(-0.5 * FORCE_PREFACTOR * (ep_ex - self.ep_in) * (self.ep_in / ep_ex) * dielectric)
    }

    /// Dielectric boundary force from the full field, including its tangential part.
    fn dielectric_boundary_force(&self, ep_ex: f64) -> Result<Vector3<f64>, EngineError> {
        let (normal, tangential) = self.interface_field(ep_ex)?;
        let ep_hat = self.ep_in / ep_ex;
        let sum: Vector3<f64> = self
            .interface
            .normals()
            .iter()
            .zip(self.interface.areas())
            .zip(normal.iter().zip(&tangential))
            .map(|((n, a), (e_n, e_t))| n * (a * (e_n * e_n / ep_hat + e_t.norm_squared())))
            .sum();
        Ok(-0.5 * FORCE_PREFACTOR * (ep_ex - self.ep_in) * sum)
    }

    /// Maxwell stress integrated over the dielectric interface, and the force
    /// magnitude on each element.
    fn maxwell_stress_force(&self, ep_ex: f64) -> Result<(Vector3<f64>, DVector<f64>), EngineError> {
        let (normal, tangential) = self.interface_field(ep_ex)?;
        let element_forces: Vec<Vector3<f64>> = self
            .interface
            .normals()
            .iter()
            .zip(self.interface.areas())
            .zip(normal.iter().zip(&tangential))
            .map(|((n, a), (&e_n, e_t))| {
                let magnitude_sq = e_n * e_n + e_t.norm_squared();
                (n * (e_n * e_n - 0.5 * magnitude_sq) + e_t * e_n) * (ep_ex * a)
            })
            .collect();
        let total = FORCE_PREFACTOR * element_forces.iter().sum::<Vector3<f64>>();
        let magnitudes = DVector::from_iterator(
            element_forces.len(),
            element_forces.iter().map(|f| FORCE_PREFACTOR * f.norm()),
        );
        Ok((total, magnitudes))
    }

    /// Potential in the solvent produced by this body's outer surface.
    pub fn solvent_potential_at(
        &self,
        backend: &dyn OperatorBackend,
        points: &[Point3<f64>],
    ) -> Result<DVector<f64>, EngineError> {
        let shared = *self.shared()?;
        let stern = self.uses_stern()?;
        let solution = self.require_solution()?;
        let surface = self.outer_interface(stern)?;
        let kernel = if shared.kappa < KAPPA_EPSILON {
            Kernel::Laplace
        } else {
            Kernel::ModifiedHelmholtz { kappa: shared.kappa }
        };
        let ratio = self.outer_permittivity(stern, shared.ep_ex) / shared.ep_ex;
        let dlp = backend.double_layer_potential(kernel, surface, points);
        let slp = backend.single_layer_potential(kernel, surface, points);
        Ok(dlp.evaluate(solution.outer_potential())? - slp.evaluate(solution.outer_normal_derivative())? * ratio)
    }

    pub fn energy(&self) -> Option<f64> {
        self.energy
    }

    pub fn forces(&self) -> Option<&SolvationForces> {
        self.forces.as_ref()
    }

    /// Last reaction field evaluated at the particles.
    pub fn cached_reaction_field(&self) -> Option<&SiteField> {
        self.reaction.as_ref().map(|(_, field)| field)
    }
}

fn cached_polarizing_gradient<'c>(
    cache: &'c mut Option<Vec<Vector3<f64>>>,
    kernel: &MultipoleKernel<'_>,
) -> &'c [Vector3<f64>] {
    cache.get_or_insert_with(|| {
        debug!(particles = kernel.len(), "Computing polarizing permanent gradient");
        InducedDipoleSolver::polarizing_gradient(kernel)
    })
}

/// `sum_j A_j n_j v_j^2` over the elements of a surface.
fn surface_sum(surface: &Interface, values: &DVector<f64>) -> Vector3<f64> {
    surface
        .normals()
        .iter()
        .zip(surface.areas())
        .zip(values.iter())
        .map(|((n, a), v)| n * (a * v * v))
        .sum()
}

/// Axis pairs of the mixed second derivatives.
const AXIS_PAIRS: [(usize, usize); 3] = [(0, 1), (0, 2), (1, 2)];
const PAIR_SIGNS: [(f64, f64); 4] = [(1.0, 1.0), (1.0, -1.0), (-1.0, 1.0), (-1.0, -1.0)];
const STENCIL_SIZE: usize = 19;

/// Nineteen-point stencil: center, six axis neighbors, twelve diagonal neighbors.
fn stencil(h: f64) -> Vec<Vector3<f64>> {
    let mut offsets = Vec::with_capacity(STENCIL_SIZE);
    offsets.push(Vector3::zeros());
    for axis in 0..3 {
        for sign in [1.0, -1.0] {
            let mut e = Vector3::zeros();
            e[axis] = sign * h;
            offsets.push(e);
        }
    }
    for (a, b) in AXIS_PAIRS {
        for (sa, sb) in PAIR_SIGNS {
            let mut e = Vector3::zeros();
            e[a] = sa * h;
            e[b] = sb * h;
            offsets.push(e);
        }
    }
    offsets
}

/// Potential, gradient and Hessian of `eval` at `centers` by central differences.
///
/// All stencil points are handed to `eval` in a single call.
fn finite_difference_field<F>(centers: &[Point3<f64>], h: f64, eval: F) -> Result<SiteField, EngineError>
where
    F: FnOnce(&[Point3<f64>]) -> Result<DVector<f64>, EngineError>,
{
    let offsets = stencil(h);
    let points: Vec<Point3<f64>> = centers
        .iter()
        .flat_map(|c| offsets.iter().map(move |o| c + o))
        .collect();
    let values = eval(&points)?;
    if values.len() != points.len() {
        return Err(EngineError::ShapeMismatch(format!(
            "expected {} stencil values, got {}",
            points.len(),
            values.len()
        )));
    }

    let mut field = SiteField::zeros(centers.len());
    for (i, v) in values.as_slice().chunks_exact(STENCIL_SIZE).enumerate() {
        let center = v[0];
        let mut grad = Vector3::zeros();
        let mut hess = Matrix3::zeros();
        for axis in 0..3 {
            let (plus, minus) = (v[1 + 2 * axis], v[2 + 2 * axis]);
            grad[axis] = (plus - minus) / (2.0 * h);
            hess[(axis, axis)] = (plus - 2.0 * center + minus) / (h * h);
        }
        for (k, &(a, b)) in AXIS_PAIRS.iter().enumerate() {
            let base = 7 + 4 * k;
            let mixed = (v[base] - v[base + 1] - v[base + 2] + v[base + 3]) / (4.0 * h * h);
            hess[(a, b)] = mixed;
            hess[(b, a)] = mixed;
        }
        field.potential[i] = center;
        field.gradient[i] = grad;
        field.hessian[i] = hess;
    }
    Ok(field)
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;

    /// A single charge at the center of an icosphere.
    pub fn born_ion(charge: f64, radius: f64, subdivisions: u32) -> Body {
        let particles = ParticleSet::from_point_charges(&[Point3::origin()], &[charge]).unwrap();
        let interface = Interface::sphere(Point3::origin(), radius, subdivisions).unwrap();
        Body::new("ion", interface, particles).unwrap()
    }

    pub fn configured(mut body: Body, formulation: FormulationKind, ep_ex: f64, kappa: f64) -> Body {
        body.configure(SharedParameters {
            formulation,
            preconditioner: Some(PreconditionerKind::BlockDiagonal),
            ep_ex,
            kappa,
        })
        .unwrap();
        body
    }
}

#[cfg(test)]
mod tests {
    use super::tests_support::*;
    use super::*;
    use crate::core::bem::backend::CollocationBackend;
    use crate::core::models::particle::Particle;

    fn f64_approx_equal(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() < tol
    }

    #[test]
    fn new_rejects_empty_particle_sets() {
        let interface = Interface::sphere(Point3::origin(), 1.0, 0).unwrap();
        let err = Body::new("empty", interface, ParticleSet::default()).unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }

    #[test]
    fn force_field_follows_polarizability() {
        assert_eq!(born_ion(1.0, 1.0, 0).force_field(), ForceField::Amber);
    }

    #[test]
    fn topology_must_match_particle_count() {
        let err = born_ion(1.0, 1.0, 0)
            .with_topology(ExclusionTopology::empty(3))
            .unwrap_err();
        assert!(matches!(err, EngineError::ShapeMismatch(_)));
    }

    #[test]
    fn configure_builds_stern_surface_on_demand() {
        let body = configured(born_ion(1.0, 1.0, 1), FormulationKind::Direct, 80.0, 0.125);
        assert!(body.stern_interface().is_none());
        assert_eq!(body.block_dofs(false).unwrap().len(), 2);
        assert!(body.block_dofs(true).is_err());

        let body = configured(body, FormulationKind::DirectStern, 80.0, 0.125);
        let stern = body.stern_interface().unwrap();
        assert!(stern.enclosed_volume() > body.interface().enclosed_volume());
        assert_eq!(body.block_dofs(true).unwrap().len(), 4);
        assert!(f64_approx_equal(body.outer_permittivity(true, 80.0), 80.0, 1e-15));
        assert!(f64_approx_equal(body.outer_permittivity(false, 80.0), 4.0, 1e-15));
    }

    #[test]
    fn changing_shared_parameters_invalidates_caches() {
        let backend = CollocationBackend::new();
        let mut body = configured(born_ion(1.0, 1.0, 1), FormulationKind::Direct, 80.0, 0.125);
        body.build_system(&backend).unwrap();
        assert!(body.system().is_some());

        let same = *body.shared().unwrap();
        body.configure(same).unwrap();
        assert!(body.system().is_some());

        body.configure(SharedParameters { kappa: 0.0, ..same }).unwrap();
        assert!(body.system().is_none());
    }

    #[test]
    fn build_system_rejects_inapplicable_formulation() {
        let backend = CollocationBackend::new();
        let mut body = configured(born_ion(1.0, 1.0, 1), FormulationKind::DirectAmoeba, 80.0, 0.125);
        let err = body.build_system(&backend).unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }

    #[test]
    fn mass_matrix_system_uses_strong_form_without_preconditioner() {
        let backend = CollocationBackend::new();
        let mut body = born_ion(1.0, 1.0, 1);
        body.configure(SharedParameters {
            formulation: FormulationKind::Direct,
            preconditioner: Some(PreconditionerKind::MassMatrix),
            ep_ex: 80.0,
            kappa: 0.125,
        })
        .unwrap();
        body.build_system(&backend).unwrap();
        let system = body.system().unwrap();
        assert_eq!(system.form, DiscreteForm::Strong);
        assert!(system.preconditioner.is_none());
    }

    #[test]
    fn post_processing_requires_a_solution() {
        let backend = CollocationBackend::new();
        let mut body = configured(born_ion(1.0, 1.0, 1), FormulationKind::Direct, 80.0, 0.125);
        let err = body
            .calculate_solvation_energy(&backend, 1e-3, &PolarizationConfig::default())
            .unwrap_err();
        assert!(matches!(err, EngineError::MissingResult(_)));
    }

    #[test]
    fn polarizing_gradient_is_computed_once_per_configuration() {
        let backend = CollocationBackend::new();
        let particles = ParticleSet::new(vec![
            Particle::point_charge(Point3::origin(), 1.0, 0).with_polarization(0.0, 0.39),
            Particle::point_charge(Point3::new(1.0, 0.0, 0.0), 0.0, 1).with_polarization(1.0, 0.39),
        ]);
        let interface = Interface::sphere(Point3::origin(), 3.0, 1).unwrap();
        let body = Body::new("polar", interface, particles).unwrap();
        let mut body = configured(body, FormulationKind::DirectAmoeba, 80.0, 0.125);
        assert!(body.polarizing_gradient().is_none());

        let n = body.interface().dof_count();
        body.set_solution(vec![DVector::from_element(n, 0.01), DVector::from_element(n, -0.02)]);
        let config = PolarizationConfig::default();
        body.relax_dissolved(&backend, 1e-3, &config).unwrap();
        let first = body.polarizing_gradient().unwrap().as_ptr();
        body.relax_dissolved(&backend, 1e-3, &config).unwrap();
        assert_eq!(body.polarizing_gradient().unwrap().as_ptr(), first);
        assert_eq!(body.dissolved_state().iterations(), 2);

        let kernel = MultipoleKernel::new(body.particles(), body.topology()).unwrap();
        let fresh = InducedDipoleSolver::polarizing_gradient(&kernel);
        assert_eq!(body.polarizing_gradient().unwrap(), fresh.as_slice());

        let shared = *body.shared().unwrap();
        body.configure(SharedParameters { kappa: 0.0, ..shared }).unwrap();
        assert!(body.polarizing_gradient().is_none());
    }

    #[test]
    fn stencil_is_exact_for_quadratics() {
        let centers = [Point3::new(0.3, -0.2, 1.1), Point3::new(-1.0, 2.0, 0.5)];
        let phi = |p: &Point3<f64>| p.x * p.x + 3.0 * p.x * p.y - 2.0 * p.z * p.z + p.y * p.z + p.z;
        let field = finite_difference_field(&centers, 1e-2, |points| {
            Ok(DVector::from_iterator(points.len(), points.iter().map(phi)))
        })
        .unwrap();

        for (i, c) in centers.iter().enumerate() {
            assert!(f64_approx_equal(field.potential[i], phi(c), 1e-12));
            let grad = Vector3::new(2.0 * c.x + 3.0 * c.y, 3.0 * c.x + c.z, -4.0 * c.z + c.y + 1.0);
            assert!((field.gradient[i] - grad).norm() < 1e-9);
            let hess = Matrix3::new(2.0, 3.0, 0.0, 3.0, 0.0, 1.0, 0.0, 1.0, -4.0);
            assert!((field.hessian[i] - hess).norm() < 1e-6);
        }
    }

    #[test]
    fn surface_sum_vanishes_for_uniform_values_on_closed_surface() {
        let sphere = Interface::sphere(Point3::origin(), 1.5, 2).unwrap();
        let values = DVector::from_element(sphere.dof_count(), 0.7);
        assert!(surface_sum(&sphere, &values).norm() < 1e-12);
    }

    #[test]
    fn forces_on_symmetric_solution_cancel() {
        let backend = CollocationBackend::new();
        let mut body = configured(born_ion(1.0, 1.5, 2), FormulationKind::Direct, 80.0, 0.125);
        let n = body.interface().dof_count();
        body.set_solution(vec![DVector::from_element(n, 0.2), DVector::from_element(n, -0.1)]);
        let options = ForceConfig {
            formulation: ForceFormulation::EnergyFunctional,
            approximate_dielectric_boundary: true,
        };
        let forces = body.calculate_solvation_forces(&backend, 1e-3, &options).unwrap();
        assert!(forces.f_db.unwrap().norm() < 1e-9);
        assert!(forces.f_ib.norm() < 1e-9);
        assert!(forces.f_qf.unwrap().norm() < 1e-6);
        assert_eq!(forces.per_particle.as_ref().map(Vec::len), Some(1));

        let forces = body.calculate_solvation_forces(&backend, 1e-3, &ForceConfig::default()).unwrap();
        assert_eq!(forces.formulation, ForceFormulation::MaxwellTensor);
        assert!(forces.f_solv.norm() < 1e-9);
        assert!(forces.per_particle.is_none());
    }

    #[test]
    fn exact_dielectric_boundary_force_reduces_to_normal_term_for_uniform_potential() {
        let backend = CollocationBackend::new();
        let mut body = configured(born_ion(1.0, 2.0, 2), FormulationKind::Direct, 80.0, 0.0);
        let n = body.interface().dof_count();
        let centroids = body.interface().centroids().to_vec();
        let derivative = DVector::from_iterator(n, centroids.iter().map(|c| 0.3 + 0.05 * c.x - 0.02 * c.z));
        body.set_solution(vec![DVector::from_element(n, 0.4), derivative]);

        let mut options = ForceConfig {
            formulation: ForceFormulation::EnergyFunctional,
            approximate_dielectric_boundary: true,
        };
        let approximate = body.calculate_solvation_forces(&backend, 1e-3, &options).unwrap().f_db.unwrap();
        options.approximate_dielectric_boundary = false;
        let exact = body.calculate_solvation_forces(&backend, 1e-3, &options).unwrap().f_db.unwrap();

        assert!(approximate.norm() > 1e-6);
        assert!((exact - approximate).norm() < 1e-9 * approximate.norm());
    }

    #[test]
    fn tangential_field_adds_to_exact_dielectric_boundary_force() {
        let backend = CollocationBackend::new();
        let mut body = configured(born_ion(1.0, 2.0, 2), FormulationKind::Direct, 80.0, 0.0);
        let n = body.interface().dof_count();
        let potential = DVector::from_iterator(
            n,
            body.interface().centroids().iter().map(|c| 0.1 * (c.x + c.x * c.x)),
        );
        body.set_solution(vec![potential, DVector::zeros(n)]);

        let mut options = ForceConfig {
            formulation: ForceFormulation::EnergyFunctional,
            approximate_dielectric_boundary: true,
        };
        let approximate = body.calculate_solvation_forces(&backend, 1e-3, &options).unwrap().f_db.unwrap();
        assert!(approximate.norm() < 1e-12);

        options.approximate_dielectric_boundary = false;
        let exact = body.calculate_solvation_forces(&backend, 1e-3, &options).unwrap().f_db.unwrap();
        assert!(exact.x.abs() > 1e-6);
        assert!(exact.y.abs() < 1e-6 * exact.x.abs());
        assert!(exact.z.abs() < 1e-6 * exact.x.abs());

        let forces = body.calculate_solvation_forces(&backend, 1e-3, &ForceConfig::default()).unwrap();
        let magnitudes = forces.element_force.as_ref().unwrap();
        assert_eq!(magnitudes.len(), n);
        assert!(magnitudes.iter().all(|m| *m >= 0.0));
        assert!(magnitudes.max() > 0.0);
    }
}
