//! # Boundary-Integral Formulations
//!
//! Each physical model of the solute/solvent boundary is a [`Formulation`]:
//! a strategy that knows how to build a body's self-interaction blocks, its
//! right-hand side, the coupling blocks between two bodies, and its local
//! preconditioner.
//!
//! ## Key Components
//!
//! - [`direct`] - A single dielectric interface between solute and ionic solvent
//! - [`direct_stern`] - Dielectric interface plus an ion-exclusion (Stern) surface
//! - [`slic`] - Stern layer with a field-dependent, self-consistently updated coupling
//! - [`direct_amoeba`] - Single interface driven by permanent multipoles and induced dipoles
//! - [`preconditioner`] - Block-diagonal inverse of the per-interface 2x2 diagonals
//!
//! Formulations are selected by [`FormulationKind`] and looked up through the
//! fixed table in [`formulation_for`].

pub mod direct;
pub mod direct_amoeba;
pub mod direct_stern;
pub mod preconditioner;
pub mod slic;

use crate::core::bem::backend::{Kernel, OperatorBackend};
use crate::core::bem::operator::{BlockedBoundaryOperator, BoundaryOperator, DiscreteForm, GridFunction};
use crate::core::bem::sparse::CsrMatrix;
use crate::engine::body::Body;
use crate::engine::config::ConfigError;
use crate::engine::error::EngineError;
use nalgebra::{DVector, Point3};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormulationKind {
    Direct,
    DirectStern,
    Slic,
    DirectAmoeba,
}

impl FormulationKind {
    pub const ALL: [FormulationKind; 4] = [Self::Direct, Self::DirectStern, Self::Slic, Self::DirectAmoeba];

    pub fn name(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::DirectStern => "direct_stern",
            Self::Slic => "slic",
            Self::DirectAmoeba => "direct_amoeba",
        }
    }

    /// Applies the implicit promotions of the simulation settings.
    ///
    /// A polarizable solute always uses `direct_amoeba`. Otherwise a requested
    /// Stern layer turns `direct` into `direct_stern`; `slic` already has one.
    pub fn resolve(self, stern_layer: bool, polarizable: bool) -> Self {
        if polarizable {
            Self::DirectAmoeba
        } else if stern_layer && self == Self::Direct {
            Self::DirectStern
        } else {
            self
        }
    }
}

impl fmt::Display for FormulationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FormulationKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == s.trim().to_lowercase())
            .ok_or_else(|| ConfigError::UnknownFormulation(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreconditionerKind {
    BlockDiagonal,
    MassMatrix,
}

impl PreconditionerKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::BlockDiagonal => "block_diagonal",
            Self::MassMatrix => "mass_matrix",
        }
    }

    /// Discrete form in which self blocks and right-hand sides are handed to the solver.
    pub fn discrete_form(kind: Option<Self>) -> DiscreteForm {
        match kind {
            Some(Self::MassMatrix) => DiscreteForm::Strong,
            Some(Self::BlockDiagonal) | None => DiscreteForm::Weak,
        }
    }
}

impl fmt::Display for PreconditionerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PreconditionerKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "block_diagonal" => Ok(Self::BlockDiagonal),
            "mass_matrix" => Ok(Self::MassMatrix),
            _ => Err(ConfigError::UnknownPreconditioner(s.to_string())),
        }
    }
}

/// Strategy interface of one boundary-integral formulation.
pub trait Formulation: Send + Sync + fmt::Debug {
    fn kind(&self) -> FormulationKind;

    /// Whether bodies carry a second (Stern) surface, giving 4x4 self blocks.
    fn has_stern_layer(&self) -> bool {
        false
    }

    fn default_preconditioner(&self) -> PreconditionerKind {
        PreconditionerKind::BlockDiagonal
    }

    fn supports_preconditioner(&self, _kind: PreconditionerKind) -> bool {
        true
    }

    fn verify_applicable(&self, body: &Body) -> bool;

    fn build_self_lhs(
        &self,
        body: &Body,
        backend: &dyn OperatorBackend,
    ) -> Result<BlockedBoundaryOperator, EngineError>;

    fn build_rhs(&self, body: &Body, backend: &dyn OperatorBackend) -> Result<Vec<GridFunction>, EngineError>;

    /// Coupling of `source`'s outer unknowns into `target`'s outermost equation.
    fn build_inter_body(
        &self,
        target: &Body,
        source: &Body,
        backend: &dyn OperatorBackend,
    ) -> Result<BlockedBoundaryOperator, EngineError> {
        outer_coupling(self.has_stern_layer(), target, source, backend)
    }

    fn build_preconditioner(&self, _body: &Body, lhs: &BlockedBoundaryOperator) -> Result<CsrMatrix, EngineError> {
        preconditioner::block_diagonal(lhs)
    }

    /// Right-hand-side vectors in the discrete form matching the finalized self block.
    fn build_rhs_preconditioner(&self, rhs: &[GridFunction], form: DiscreteForm) -> Vec<DVector<f64>> {
        rhs.iter().map(|g| g.vector(form).clone()).collect()
    }
}

static DIRECT: direct::Direct = direct::Direct;
static DIRECT_STERN: direct_stern::DirectStern = direct_stern::DirectStern;
static SLIC: slic::Slic = slic::Slic;
static DIRECT_AMOEBA: direct_amoeba::DirectAmoeba = direct_amoeba::DirectAmoeba;

/// Fixed lookup table from kind to implementation.
pub fn formulation_for(kind: FormulationKind) -> &'static dyn Formulation {
    match kind {
        FormulationKind::Direct => &DIRECT,
        FormulationKind::DirectStern => &DIRECT_STERN,
        FormulationKind::Slic => &SLIC,
        FormulationKind::DirectAmoeba => &DIRECT_AMOEBA,
    }
}

/// Permittivity scaling of a Stern-side normal derivative.
pub(crate) enum SternRatio<'a> {
    Uniform(f64),
    PerDof(&'a DVector<f64>),
}

impl SternRatio<'_> {
    fn apply(&self, op: BoundaryOperator) -> BoundaryOperator {
        match self {
            SternRatio::Uniform(ratio) => op * *ratio,
            SternRatio::PerDof(ratios) => op.scale_domain(ratios),
        }
    }
}

/// `[[1/2 I + K_L, -V_L], [1/2 I - K_Y, (eps_in / eps_out) V_Y]]` on the dielectric interface.
pub(crate) fn single_interface_lhs(
    body: &Body,
    backend: &dyn OperatorBackend,
) -> Result<BlockedBoundaryOperator, EngineError> {
    let shared = body.shared()?;
    let gamma = body.interface();
    let n = gamma.dof_count();
    let helmholtz = Kernel::ModifiedHelmholtz { kappa: shared.kappa };

    let identity = backend.identity(gamma);
    let k_in = backend.double_layer(Kernel::Laplace, gamma, gamma);
    let v_in = backend.single_layer(Kernel::Laplace, gamma, gamma);
    let k_out = backend.double_layer(helmholtz, gamma, gamma);
    let v_out = backend.single_layer(helmholtz, gamma, gamma);

    let mut lhs = BlockedBoundaryOperator::new(vec![n, n], vec![n, n]);
    lhs.set(0, 0, identity.clone() * 0.5 + k_in)?;
    lhs.set(0, 1, -v_in)?;
    lhs.set(1, 0, identity * 0.5 - k_out)?;
    lhs.set(1, 1, v_out * (body.ep_in() / shared.ep_ex))?;
    Ok(lhs)
}

/// The 4x4 self block of a body with dielectric surface `d` and Stern surface `s`.
pub(crate) fn stern_lhs(
    body: &Body,
    backend: &dyn OperatorBackend,
    ratio: SternRatio<'_>,
) -> Result<BlockedBoundaryOperator, EngineError> {
    let shared = body.shared()?;
    let dielectric = body.interface();
    let stern = body.stern_interface().ok_or_else(|| {
        EngineError::Configuration(format!("body '{}' has no Stern surface", body.name()))
    })?;
    let (nd, ns) = (dielectric.dof_count(), stern.dof_count());
    let helmholtz = Kernel::ModifiedHelmholtz { kappa: shared.kappa };
    let ep_stern = body.ep_stern(shared.ep_ex);

    let id_d = backend.identity(dielectric);
    let id_s = backend.identity(stern);
    let k_dd = backend.double_layer(Kernel::Laplace, dielectric, dielectric);
    let v_dd = backend.single_layer(Kernel::Laplace, dielectric, dielectric);
    let k_sd = backend.double_layer(Kernel::Laplace, stern, dielectric);
    let v_sd = backend.single_layer(Kernel::Laplace, stern, dielectric);
    let k_ds = backend.double_layer(Kernel::Laplace, dielectric, stern);
    let v_ds = backend.single_layer(Kernel::Laplace, dielectric, stern);
    let k_ss = backend.double_layer(Kernel::Laplace, stern, stern);
    let v_ss = backend.single_layer(Kernel::Laplace, stern, stern);
    let k_ss_out = backend.double_layer(helmholtz, stern, stern);
    let v_ss_out = backend.single_layer(helmholtz, stern, stern);

    let mut lhs = BlockedBoundaryOperator::new(vec![nd, nd, ns, ns], vec![nd, nd, ns, ns]);
    lhs.set(0, 0, id_d.clone() * 0.5 + k_dd.clone())?;
    lhs.set(0, 1, -v_dd.clone())?;

    lhs.set(1, 0, id_d * 0.5 - k_dd)?;
    lhs.set(1, 1, ratio.apply(v_dd))?;
    lhs.set(1, 2, k_sd)?;
    lhs.set(1, 3, -v_sd)?;

    lhs.set(2, 0, -k_ds)?;
    lhs.set(2, 1, ratio.apply(v_ds))?;
    lhs.set(2, 2, id_s.clone() * 0.5 + k_ss)?;
    lhs.set(2, 3, -v_ss)?;

    lhs.set(3, 2, id_s * 0.5 - k_ss_out)?;
    lhs.set(3, 3, v_ss_out * (ep_stern / shared.ep_ex))?;
    Ok(lhs)
}

/// Coupling block shared by every formulation.
pub(crate) fn outer_coupling(
    stern: bool,
    target: &Body,
    source: &Body,
    backend: &dyn OperatorBackend,
) -> Result<BlockedBoundaryOperator, EngineError> {
    let shared = target.shared()?;
    let helmholtz = Kernel::ModifiedHelmholtz { kappa: shared.kappa };
    let target_dofs = target.block_dofs(stern)?;
    let source_dofs = source.block_dofs(stern)?;
    let target_surface = target.outer_interface(stern)?;
    let source_surface = source.outer_interface(stern)?;
    let outer_row = target_dofs.len() - 1;
    let source_col = source_dofs.len() - 2;
    let ep_source = source.outer_permittivity(stern, shared.ep_ex);

    let k = backend.double_layer(helmholtz, source_surface, target_surface);
    let v = backend.single_layer(helmholtz, source_surface, target_surface);

    let mut coupling = BlockedBoundaryOperator::new(target_dofs, source_dofs);
    coupling.set(outer_row, source_col, -k)?;
    coupling.set(outer_row, source_col + 1, v * (ep_source / shared.ep_ex))?;
    Ok(coupling)
}

/// `sum_k q_k / (4 pi eps_in |x - x_k|)`
pub(crate) fn coulomb_source(body: &Body) -> impl Fn(&Point3<f64>) -> f64 + Sync + '_ {
    let ep_in = body.ep_in();
    move |x: &Point3<f64>| {
        body.particles()
            .iter()
            .map(|p| p.charge / (4.0 * PI * ep_in * (x - p.position).norm()))
            .sum()
    }
}

/// Right-hand side `[phi_coul, 0, ...]` with `blocks` sub-blocks.
pub(crate) fn source_rhs(
    body: &Body,
    backend: &dyn OperatorBackend,
    source: &(dyn Fn(&Point3<f64>) -> f64 + Sync),
    stern: bool,
) -> Result<Vec<GridFunction>, EngineError> {
    let dofs = body.block_dofs(stern)?;
    let mut rhs = Vec::with_capacity(dofs.len());
    rhs.push(backend.project(body.interface(), source));
    rhs.extend(dofs[1..].iter().map(|&n| GridFunction::zeros(n)));
    Ok(rhs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formulation_names_parse() {
        for kind in FormulationKind::ALL {
            assert_eq!(kind.name().parse::<FormulationKind>().unwrap(), kind);
            assert_eq!(formulation_for(kind).kind(), kind);
        }
        assert_eq!(" Direct ".parse::<FormulationKind>().unwrap(), FormulationKind::Direct);
    }

    #[test]
    fn unknown_names_are_rejected() {
        assert!(matches!(
            "galerkin".parse::<FormulationKind>(),
            Err(ConfigError::UnknownFormulation(_))
        ));
        assert!(matches!(
            "jacobi".parse::<PreconditionerKind>(),
            Err(ConfigError::UnknownPreconditioner(_))
        ));
    }

    #[test]
    fn resolve_promotes_stern_and_polarizable() {
        assert_eq!(FormulationKind::Direct.resolve(true, false), FormulationKind::DirectStern);
        assert_eq!(FormulationKind::Slic.resolve(true, false), FormulationKind::Slic);
        assert_eq!(FormulationKind::Direct.resolve(false, false), FormulationKind::Direct);
        assert_eq!(FormulationKind::Direct.resolve(true, true), FormulationKind::DirectAmoeba);
    }

    #[test]
    fn every_formulation_defaults_to_block_diagonal() {
        for kind in FormulationKind::ALL {
            let formulation = formulation_for(kind);
            assert_eq!(formulation.default_preconditioner(), PreconditionerKind::BlockDiagonal);
            assert!(formulation.supports_preconditioner(PreconditionerKind::BlockDiagonal));
        }
        assert!(!formulation_for(FormulationKind::Slic).supports_preconditioner(PreconditionerKind::MassMatrix));
        assert!(formulation_for(FormulationKind::Slic).has_stern_layer());
        assert!(formulation_for(FormulationKind::DirectStern).has_stern_layer());
    }
}
