use crate::core::models::topology::ExclusionScale;
use crate::core::multipole::{FieldDamping, MultipoleKernel};
use crate::engine::error::EngineError;
use nalgebra::Vector3;
use std::f64::consts::PI;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RelaxationPhase {
    #[default]
    Uninitialized,
    Iterating,
    Converged,
}

/// Induced dipoles of one body in one regime, with the previous iterate kept
/// for the residual.
#[derive(Debug, Clone, PartialEq)]
pub struct InducedDipoleState {
    current: Vec<Vector3<f64>>,
    previous: Vec<Vector3<f64>>,
    phase: RelaxationPhase,
    iterations: usize,
    residual: f64,
}

impl InducedDipoleState {
    pub fn new(particle_count: usize) -> Self {
        Self {
            current: vec![Vector3::zeros(); particle_count],
            previous: vec![Vector3::zeros(); particle_count],
            phase: RelaxationPhase::Uninitialized,
            iterations: 0,
            residual: f64::INFINITY,
        }
    }

    pub fn current(&self) -> &[Vector3<f64>] {
        &self.current
    }

    pub fn previous(&self) -> &[Vector3<f64>] {
        &self.previous
    }

    pub fn phase(&self) -> RelaxationPhase {
        self.phase
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// Residual of the last relaxation step, infinite before the first one.
    pub fn residual(&self) -> f64 {
        self.residual
    }

    /// Replaces the dipoles, e.g. to seed a warm restart.
    pub fn seed(&mut self, dipoles: Vec<Vector3<f64>>) {
        self.previous = std::mem::replace(&mut self.current, dipoles);
        self.phase = RelaxationPhase::Uninitialized;
        self.iterations = 0;
        self.residual = f64::INFINITY;
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.current.len());
    }
}

/// Environment in which the dipoles are relaxed.
#[derive(Debug, Clone, Copy)]
pub enum Regime<'a> {
    /// Inside the solvent: the reaction field of the solved surface adds to the polarizing field.
    Dissolved { reaction_gradient: &'a [Vector3<f64>] },
    Vacuum,
}

impl Regime<'_> {
    fn name(&self) -> &'static str {
        match self {
            Regime::Dissolved { .. } => "dissolved",
            Regime::Vacuum => "vacuum",
        }
    }

    fn external_field(&self, i: usize) -> Vector3<f64> {
        match self {
            Regime::Dissolved { reaction_gradient } => -4.0 * PI * reaction_gradient[i],
            Regime::Vacuum => Vector3::zeros(),
        }
    }

    fn exclusion_scale(&self) -> ExclusionScale {
        ExclusionScale::NONE
    }
}

/// Self-consistent induced dipoles by successive over-relaxation.
///
/// The damped permanent-multipole field gradient does not depend on the
/// dipoles. Callers compute it once with [`InducedDipoleSolver::polarizing_gradient`]
/// and keep it for as long as the particles do not change.
#[derive(Debug, Clone, Copy)]
pub struct InducedDipoleSolver<'a> {
    kernel: MultipoleKernel<'a>,
    permanent_gradient: &'a [Vector3<f64>],
    ep_in: f64,
    sor: f64,
}

impl<'a> InducedDipoleSolver<'a> {
    pub fn new(
        kernel: MultipoleKernel<'a>,
        permanent_gradient: &'a [Vector3<f64>],
        ep_in: f64,
        sor: f64,
    ) -> Result<Self, EngineError> {
        if permanent_gradient.len() != kernel.len() {
            return Err(EngineError::ShapeMismatch(format!(
                "permanent gradient holds {} sites, body has {}",
                permanent_gradient.len(),
                kernel.len()
            )));
        }
        Ok(Self {
            kernel,
            permanent_gradient,
            ep_in,
            sor,
        })
    }

    /// Thole-damped permanent field gradient with same-group pairs excluded.
    pub fn polarizing_gradient(kernel: &MultipoleKernel<'_>) -> Vec<Vector3<f64>> {
        kernel.permanent_gradient(FieldDamping::PolarGroups)
    }

    /// One relaxation sweep; returns the RMS change of the dipoles.
    pub fn relax(&self, state: &mut InducedDipoleState, regime: &Regime<'_>) -> Result<f64, EngineError> {
        let n = self.kernel.len();
        if state.current.len() != n {
            return Err(EngineError::ShapeMismatch(format!(
                "induced dipole state holds {} sites, body has {n}",
                state.current.len()
            )));
        }
        if let Regime::Dissolved { reaction_gradient } = regime {
            if reaction_gradient.len() != n {
                return Err(EngineError::ShapeMismatch(format!(
                    "reaction gradient holds {} sites, body has {n}",
                    reaction_gradient.len()
                )));
            }
        }
        if state.phase == RelaxationPhase::Uninitialized {
            state.phase = RelaxationPhase::Iterating;
        }

        let induced_gradient = self.kernel.induced_gradient(&state.current, regime.exclusion_scale());
        let particles = self.kernel.particles();
        let next: Vec<Vector3<f64>> = (0..n)
            .map(|i| {
                let field = -(self.permanent_gradient[i] + induced_gradient[i]) / self.ep_in
                    + regime.external_field(i);
                state.current[i] * (1.0 - self.sor) + field * (particles.get(i).polarizability * self.sor)
            })
            .collect();

        let squared: f64 = next
            .iter()
            .zip(&state.current)
            .map(|(a, b)| (a - b).norm_squared())
            .sum();
        let residual = if n == 0 { 0.0 } else { (squared / n as f64).sqrt() };

        state.previous = std::mem::replace(&mut state.current, next);
        state.iterations += 1;
        state.residual = residual;
        trace!(
            regime = regime.name(),
            iteration = state.iterations,
            residual,
            "Induced dipole relaxation step"
        );
        Ok(residual)
    }

    /// Relaxes vacuum dipoles to convergence.
    pub fn solve_vacuum(
        &self,
        state: &mut InducedDipoleState,
        tolerance: f64,
        max_iterations: usize,
    ) -> Result<(), EngineError> {
        loop {
            let residual = self.relax(state, &Regime::Vacuum)?;
            if residual < tolerance {
                state.phase = RelaxationPhase::Converged;
                debug!(iterations = state.iterations, residual, "Vacuum induced dipoles converged");
                return Ok(());
            }
            if state.iterations >= max_iterations {
                return Err(EngineError::Convergence {
                    what: "vacuum induced dipoles",
                    iterations: state.iterations,
                    residual,
                });
            }
        }
    }

    /// A single dissolved-regime step driven by the current reaction field.
    pub fn step_dissolved(
        &self,
        state: &mut InducedDipoleState,
        reaction_gradient: &[Vector3<f64>],
        tolerance: f64,
    ) -> Result<f64, EngineError> {
        let residual = self.relax(state, &Regime::Dissolved { reaction_gradient })?;
        state.phase = if residual < tolerance {
            RelaxationPhase::Converged
        } else {
            RelaxationPhase::Iterating
        };
        Ok(residual)
    }
}
