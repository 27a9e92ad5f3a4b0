use super::{Formulation, FormulationKind, coulomb_source, single_interface_lhs, source_rhs};
use crate::core::bem::backend::OperatorBackend;
use crate::core::bem::operator::{BlockedBoundaryOperator, GridFunction};
use crate::engine::body::{Body, ForceField};
use crate::engine::error::EngineError;

/// Fixed charges inside a single dielectric interface.
#[derive(Debug, Clone, Copy, Default)]
pub struct Direct;

impl Formulation for Direct {
    fn kind(&self) -> FormulationKind {
        FormulationKind::Direct
    }

    fn verify_applicable(&self, body: &Body) -> bool {
        body.force_field() == ForceField::Amber
    }

    fn build_self_lhs(
        &self,
        body: &Body,
        backend: &dyn OperatorBackend,
    ) -> Result<BlockedBoundaryOperator, EngineError> {
        single_interface_lhs(body, backend)
    }

    fn build_rhs(&self, body: &Body, backend: &dyn OperatorBackend) -> Result<Vec<GridFunction>, EngineError> {
        let source = coulomb_source(body);
        source_rhs(body, backend, &source, false)
    }
}
