use super::{Formulation, FormulationKind, SternRatio, coulomb_source, source_rhs, stern_lhs};
use crate::core::bem::backend::OperatorBackend;
use crate::core::bem::operator::{BlockedBoundaryOperator, GridFunction};
use crate::engine::body::{Body, ForceField};
use crate::engine::error::EngineError;

/// Fixed charges with a dielectric interface enclosed by an ion-exclusion surface.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectStern;

impl Formulation for DirectStern {
    fn kind(&self) -> FormulationKind {
        FormulationKind::DirectStern
    }

    fn has_stern_layer(&self) -> bool {
        true
    }

    fn verify_applicable(&self, body: &Body) -> bool {
        body.force_field() == ForceField::Amber && body.stern_interface().is_some()
    }

    fn build_self_lhs(
        &self,
        body: &Body,
        backend: &dyn OperatorBackend,
    ) -> Result<BlockedBoundaryOperator, EngineError> {
        let shared = body.shared()?;
        let ratio = body.ep_in() / body.ep_stern(shared.ep_ex);
        stern_lhs(body, backend, SternRatio::Uniform(ratio))
    }

    fn build_rhs(&self, body: &Body, backend: &dyn OperatorBackend) -> Result<Vec<GridFunction>, EngineError> {
        let source = coulomb_source(body);
        source_rhs(body, backend, &source, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bem::backend::CollocationBackend;
    use crate::engine::body::tests_support::{born_ion, configured};

    #[test]
    fn self_block_is_four_by_four_with_zero_corners() {
        let backend = CollocationBackend::new();
        let body = configured(born_ion(1.0, 2.0, 1), FormulationKind::DirectStern, 80.0, 0.125);
        let lhs = DirectStern.build_self_lhs(&body, &backend).unwrap();
        assert_eq!(lhs.block_shape(), (4, 4));
        let nd = body.interface().dof_count();
        let ns = body.stern_interface().unwrap().dof_count();
        assert_eq!(lhs.row_dofs(), &[nd, nd, ns, ns]);
        for (r, c) in [(0, 2), (0, 3), (3, 0), (3, 1)] {
            assert!(lhs.get(r, c).is_none(), "block ({r}, {c}) must be empty");
        }
    }

    #[test]
    fn rhs_has_four_sub_blocks() {
        let backend = CollocationBackend::new();
        let body = configured(born_ion(1.0, 2.0, 1), FormulationKind::DirectStern, 80.0, 0.125);
        let rhs = DirectStern.build_rhs(&body, &backend).unwrap();
        assert_eq!(rhs.len(), 4);
        assert!(rhs[0].coefficients.iter().all(|&v| v > 0.0));
        assert!(rhs[3].projections.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn requires_a_stern_surface() {
        assert!(!DirectStern.verify_applicable(&born_ion(1.0, 2.0, 1)));
    }
}
