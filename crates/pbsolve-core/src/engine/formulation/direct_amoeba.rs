use super::{Formulation, FormulationKind, single_interface_lhs, source_rhs};
use crate::core::bem::backend::OperatorBackend;
use crate::core::bem::operator::{BlockedBoundaryOperator, GridFunction};
use crate::engine::body::{Body, ForceField};
use crate::engine::error::EngineError;
use nalgebra::Point3;
use std::f64::consts::PI;

/// Polarizable multipoles inside a single dielectric interface.
///
/// The operator is the one of [`super::direct::Direct`]; only the source term
/// differs, and it changes every time the dissolved induced dipoles move.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectAmoeba;

impl Formulation for DirectAmoeba {
    fn kind(&self) -> FormulationKind {
        FormulationKind::DirectAmoeba
    }

    fn verify_applicable(&self, body: &Body) -> bool {
        body.force_field() == ForceField::Amoeba
    }

    fn build_self_lhs(
        &self,
        body: &Body,
        backend: &dyn OperatorBackend,
    ) -> Result<BlockedBoundaryOperator, EngineError> {
        single_interface_lhs(body, backend)
    }

    fn build_rhs(&self, body: &Body, backend: &dyn OperatorBackend) -> Result<Vec<GridFunction>, EngineError> {
        let ep_in = body.ep_in();
        let particles = body.particles().as_slice();
        let induced = body.dissolved_dipoles();
        let source = |x: &Point3<f64>| -> f64 {
            particles
                .iter()
                .zip(induced)
                .map(|(p, mu)| {
                    let r = x - p.position;
                    let d = r.norm();
                    let d3 = d * d * d;
                    let d5 = d3 * d * d;
                    p.charge / d + (p.dipole + mu).dot(&r) / d3 + 0.5 * r.dot(&(p.quadrupole * r)) / d5
                })
                .sum::<f64>()
                / (4.0 * PI * ep_in)
        };
        source_rhs(body, backend, &source, false)
    }
}
