use super::{Formulation, FormulationKind, PreconditionerKind, SternRatio, coulomb_source, source_rhs, stern_lhs};
use crate::core::bem::backend::OperatorBackend;
use crate::core::bem::operator::{BlockedBoundaryOperator, GridFunction};
use crate::engine::body::{Body, ForceField, SlicParameters};
use crate::engine::error::EngineError;
use nalgebra::DVector;

/// Solvation-layer interface condition: a Stern layer whose permittivity ratio
/// on the dielectric surface responds to the local normal field.
#[derive(Debug, Clone, Copy, Default)]
pub struct Slic;

impl Formulation for Slic {
    fn kind(&self) -> FormulationKind {
        FormulationKind::Slic
    }

    fn has_stern_layer(&self) -> bool {
        true
    }

    fn supports_preconditioner(&self, kind: PreconditionerKind) -> bool {
        kind == PreconditionerKind::BlockDiagonal
    }

    fn verify_applicable(&self, body: &Body) -> bool {
        let Ok(shared) = body.shared() else {
            return false;
        };
        body.force_field() == ForceField::Amber
            && body.stern_interface().is_some()
            && body.ep_stern(shared.ep_ex) > body.ep_in()
    }

    fn build_self_lhs(
        &self,
        body: &Body,
        backend: &dyn OperatorBackend,
    ) -> Result<BlockedBoundaryOperator, EngineError> {
        match body.slic_e_hat() {
            Some(e_hat) => stern_lhs(body, backend, SternRatio::PerDof(e_hat)),
            None => {
                let shared = body.shared()?;
                let ratio = body.ep_in() / body.ep_stern(shared.ep_ex);
                stern_lhs(body, backend, SternRatio::Uniform(ratio))
            }
        }
    }

    fn build_rhs(&self, body: &Body, backend: &dyn OperatorBackend) -> Result<Vec<GridFunction>, EngineError> {
        let source = coulomb_source(body);
        source_rhs(body, backend, &source, true)
    }
}

/// Per-dof permittivity ratio from the normal field on the dielectric side.
///
/// `h = alpha tanh(beta E_n - gamma) - mu` with the offset `mu = alpha tanh(-gamma)`
/// chosen so that `h(0) = 0`, then `f = eps_in / (eps_stern - eps_in) - h` and
/// `e_hat = f / (1 + f)`.
pub fn field_dependent_ratio(
    normal_field: &DVector<f64>,
    ep_in: f64,
    ep_stern: f64,
    params: &SlicParameters,
) -> DVector<f64> {
    let mu = params.alpha * (-params.gamma).tanh();
    let base = ep_in / (ep_stern - ep_in);
    normal_field.map(|en| {
        let h = params.alpha * (params.beta * en - params.gamma).tanh() - mu;
        let f = base - h;
        f / (1.0 + f)
    })
}
