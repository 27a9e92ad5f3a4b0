use crate::core::bem::backend::OperatorBackend;
use crate::core::bem::operator::{BlockedDiscreteOperator, DiscreteForm, DiscreteOperator};
use crate::core::bem::sparse::CsrMatrix;
use crate::engine::body::{Body, BodySystem};
use crate::engine::error::EngineError;
use crate::engine::formulation::{Formulation, formulation_for};
use nalgebra::DVector;
use std::ops::Range;
use std::sync::Arc;
use tracing::{debug, info, instrument};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Placement of every body's sub-blocks in the global system.
///
/// Bodies occupy consecutive sub-blocks in insertion order. Coupling
/// operators are addressed by ordered `(target, source)` body pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockLayout {
    body_blocks: Vec<usize>,
    block_dofs: Vec<usize>,
    dof_offsets: Vec<usize>,
}

impl BlockLayout {
    pub fn new(per_body: &[Vec<usize>]) -> Self {
        let mut body_blocks = Vec::with_capacity(per_body.len() + 1);
        let mut block_dofs = Vec::new();
        body_blocks.push(0);
        for dofs in per_body {
            block_dofs.extend_from_slice(dofs);
            body_blocks.push(block_dofs.len());
        }
        let mut dof_offsets = Vec::with_capacity(block_dofs.len() + 1);
        dof_offsets.push(0);
        for &n in &block_dofs {
            dof_offsets.push(dof_offsets[dof_offsets.len() - 1] + n);
        }
        Self {
            body_blocks,
            block_dofs,
            dof_offsets,
        }
    }

    pub fn body_count(&self) -> usize {
        self.body_blocks.len() - 1
    }

    /// Total number of sub-blocks over all bodies.
    pub fn block_count(&self) -> usize {
        self.block_dofs.len()
    }

    pub fn total_dofs(&self) -> usize {
        self.dof_offsets[self.dof_offsets.len() - 1]
    }

    /// Global sub-block indices of a body.
    pub fn sub_blocks(&self, body: usize) -> Range<usize> {
        self.body_blocks[body]..self.body_blocks[body + 1]
    }

    /// Global sub-block index of sub-block `sub` of `body`.
    pub fn block_index(&self, body: usize, sub: usize) -> usize {
        let range = self.sub_blocks(body);
        assert!(sub < range.len(), "body {body} has only {} sub-blocks", range.len());
        range.start + sub
    }

    pub fn block_dofs(&self, body: usize) -> &[usize] {
        &self.block_dofs[self.sub_blocks(body)]
    }

    /// Global dof offset of a sub-block, counted in sub-block order.
    pub fn block_offset(&self, block: usize) -> usize {
        self.dof_offsets[block]
    }

    /// Global dof range of a body.
    pub fn body_dofs(&self, body: usize) -> Range<usize> {
        let blocks = self.sub_blocks(body);
        self.dof_offsets[blocks.start]..self.dof_offsets[blocks.end]
    }

    /// Position of the `(target, source)` coupling in target-major order, diagonal skipped.
    pub fn coupling_index(&self, target: usize, source: usize) -> Option<usize> {
        let m = self.body_count();
        if target == source || target >= m || source >= m {
            return None;
        }
        let column = if source < target { source } else { source - 1 };
        Some(target * (m - 1) + column)
    }

    /// Every ordered coupling pair, target-major with sources in insertion order.
    pub fn coupling_pairs(&self) -> Vec<(usize, usize)> {
        let m = self.body_count();
        (0..m)
            .flat_map(|target| (0..m).filter(move |&source| source != target).map(move |source| (target, source)))
            .collect()
    }

    /// Splits a global vector into per-body, per-sub-block pieces.
    pub fn split(&self, vector: &DVector<f64>) -> Result<Vec<Vec<DVector<f64>>>, EngineError> {
        if vector.len() != self.total_dofs() {
            return Err(EngineError::ShapeMismatch(format!(
                "vector has {} entries, layout has {} dofs",
                vector.len(),
                self.total_dofs()
            )));
        }
        Ok((0..self.body_count())
            .map(|body| {
                self.sub_blocks(body)
                    .map(|block| {
                        let start = self.dof_offsets[block];
                        vector.rows(start, self.block_dofs[block]).into_owned()
                    })
                    .collect()
            })
            .collect())
    }
}

/// The global system handed to the linear solver.
#[derive(Debug, Clone)]
pub struct AssembledSystem {
    /// `M x M` body-level blocks; diagonal entries are the finalized self systems.
    pub operator: Arc<BlockedDiscreteOperator>,
    pub preconditioner: Option<Arc<CsrMatrix>>,
    pub rhs: DVector<f64>,
    pub layout: BlockLayout,
}

/// Builds the global block operator, preconditioner and right-hand side.
#[derive(Debug, Clone, Copy)]
pub struct BlockOperatorAssembler<'a> {
    backend: &'a dyn OperatorBackend,
}

impl<'a> BlockOperatorAssembler<'a> {
    pub fn new(backend: &'a dyn OperatorBackend) -> Self {
        Self { backend }
    }

    #[instrument(skip_all, name = "assemble_system", fields(bodies = bodies.len()))]
    pub fn assemble(&self, bodies: &mut [Body]) -> Result<AssembledSystem, EngineError> {
        let formulation = shared_formulation(bodies)?;
        self.build_self_systems(bodies)?;

        let systems = collect_systems(bodies)?;
        let layout = layout_of(bodies, &systems)?;
        let rhs = concatenate_rhs(&systems, &layout)?;
        let preconditioner = global_preconditioner(bodies, &systems)?;

        let couplings = self.build_couplings(bodies, formulation, &layout)?;
        let m = bodies.len();
        let mut couplings = couplings.into_iter();
        let mut grid: Vec<Vec<Arc<dyn DiscreteOperator>>> = Vec::with_capacity(m);
        for (i, system) in systems.iter().enumerate() {
            let mut row: Vec<Arc<dyn DiscreteOperator>> = Vec::with_capacity(m);
            for j in 0..m {
                if i == j {
                    row.push(system.operator.clone());
                } else {
                    let block = couplings.next().ok_or_else(|| {
                        EngineError::ShapeMismatch(format!("missing coupling block ({i}, {j})"))
                    })?;
                    row.push(block);
                }
            }
            grid.push(row);
        }

        let operator = Arc::new(BlockedDiscreteOperator::new(grid)?);
        info!(
            bodies = m,
            dofs = layout.total_dofs(),
            preconditioned = preconditioner.is_some(),
            "Global system assembled"
        );
        Ok(AssembledSystem {
            operator,
            preconditioner,
            rhs,
            layout,
        })
    }

    /// Recomputes the right-hand side only, reusing operator and preconditioner.
    #[instrument(skip_all, name = "assemble_rhs")]
    pub fn assemble_rhs(&self, bodies: &mut [Body], previous: &AssembledSystem) -> Result<AssembledSystem, EngineError> {
        let backend = self.backend;

        #[cfg(not(feature = "parallel"))]
        let iter = bodies.iter_mut();

        #[cfg(feature = "parallel")]
        let iter = bodies.par_iter_mut();

        iter.try_for_each(|body| body.rebuild_rhs(backend))?;

        let systems = collect_systems(bodies)?;
        let layout = layout_of(bodies, &systems)?;
        if layout != previous.layout {
            return Err(EngineError::ShapeMismatch(
                "block layout changed since the operator was assembled".to_string(),
            ));
        }
        let rhs = concatenate_rhs(&systems, &layout)?;
        Ok(AssembledSystem {
            operator: previous.operator.clone(),
            preconditioner: previous.preconditioner.clone(),
            rhs,
            layout,
        })
    }

    fn build_self_systems(&self, bodies: &mut [Body]) -> Result<(), EngineError> {
        let backend = self.backend;

        #[cfg(not(feature = "parallel"))]
        let iter = bodies.iter_mut();

        #[cfg(feature = "parallel")]
        let iter = bodies.par_iter_mut();

        iter.try_for_each(|body| {
            if body.system().is_none() {
                body.build_system(backend)?;
            }
            Ok(())
        })
    }

    fn build_couplings(
        &self,
        bodies: &[Body],
        formulation: &dyn Formulation,
        layout: &BlockLayout,
    ) -> Result<Vec<Arc<dyn DiscreteOperator>>, EngineError> {
        let pairs = layout.coupling_pairs();
        let backend = self.backend;

        #[cfg(not(feature = "parallel"))]
        let iter = pairs.iter();

        #[cfg(feature = "parallel")]
        let iter = pairs.par_iter();

        let blocks = iter
            .map(|&(target, source)| {
                let coupling = formulation.build_inter_body(&bodies[target], &bodies[source], backend)?;
                // Couplings are never preconditioned, whatever form the target's self block uses.
                let discrete = coupling.discrete(DiscreteForm::Weak)?;
                Ok(Arc::new(discrete) as Arc<dyn DiscreteOperator>)
            })
            .collect::<Result<Vec<_>, EngineError>>()?;
        debug!(count = blocks.len(), "Coupling blocks built");
        Ok(blocks)
    }
}

fn shared_formulation(bodies: &[Body]) -> Result<&'static dyn Formulation, EngineError> {
    let first = bodies
        .first()
        .ok_or_else(|| EngineError::Configuration("simulation has no bodies".to_string()))?;
    let kind = first.shared()?.formulation;
    for body in bodies {
        if body.shared()?.formulation != kind {
            return Err(EngineError::Configuration(format!(
                "body '{}' uses formulation '{}' but '{}' was expected",
                body.name(),
                body.shared()?.formulation,
                kind
            )));
        }
    }
    Ok(formulation_for(kind))
}

fn collect_systems(bodies: &[Body]) -> Result<Vec<&BodySystem>, EngineError> {
    bodies
        .iter()
        .map(|body| {
            body.system()
                .ok_or_else(|| EngineError::MissingResult(format!("self system of body '{}'", body.name())))
        })
        .collect()
}

fn layout_of(bodies: &[Body], systems: &[&BodySystem]) -> Result<BlockLayout, EngineError> {
    let per_body: Vec<Vec<usize>> = systems.iter().map(|s| s.lhs.row_dofs().to_vec()).collect();
    for ((body, system), dofs) in bodies.iter().zip(systems).zip(&per_body) {
        if system.rhs.len() != dofs.len() {
            return Err(EngineError::ShapeMismatch(format!(
                "body '{}' has {} right-hand side blocks for {} sub-blocks",
                body.name(),
                system.rhs.len(),
                dofs.len()
            )));
        }
    }
    Ok(BlockLayout::new(&per_body))
}

fn concatenate_rhs(systems: &[&BodySystem], layout: &BlockLayout) -> Result<DVector<f64>, EngineError> {
    let mut rhs = DVector::zeros(layout.total_dofs());
    for (body, system) in systems.iter().enumerate() {
        for (sub, piece) in system.rhs.iter().enumerate() {
            let block = layout.block_index(body, sub);
            if piece.len() != layout.block_dofs(body)[sub] {
                return Err(EngineError::ShapeMismatch(format!(
                    "right-hand side block {sub} of body {body} has {} entries, expected {}",
                    piece.len(),
                    layout.block_dofs(body)[sub]
                )));
            }
            rhs.rows_mut(layout.block_offset(block), piece.len()).copy_from(piece);
        }
    }
    Ok(rhs)
}

/// Body-diagonal preconditioner with explicit zero blocks between bodies.
fn global_preconditioner(bodies: &[Body], systems: &[&BodySystem]) -> Result<Option<Arc<CsrMatrix>>, EngineError> {
    let present = systems.iter().filter(|s| s.preconditioner.is_some()).count();
    if present == 0 {
        return Ok(None);
    }
    if present != systems.len() {
        let missing: Vec<&str> = bodies
            .iter()
            .zip(systems)
            .filter(|(_, s)| s.preconditioner.is_none())
            .map(|(b, _)| b.name())
            .collect();
        return Err(EngineError::Precondition(format!(
            "bodies without a preconditioner: {}",
            missing.join(", ")
        )));
    }

    let locals: Vec<&Arc<CsrMatrix>> = systems.iter().filter_map(|s| s.preconditioner.as_ref()).collect();
    if let [only] = locals.as_slice() {
        return Ok(Some(Arc::clone(only)));
    }

    let grid: Vec<Vec<CsrMatrix>> = locals
        .iter()
        .enumerate()
        .map(|(i, local)| {
            locals
                .iter()
                .enumerate()
                .map(|(j, other)| {
                    if i == j {
                        CsrMatrix::clone(local)
                    } else {
                        CsrMatrix::zeros(local.n_rows(), other.n_cols())
                    }
                })
                .collect()
        })
        .collect();
    Ok(Some(Arc::new(CsrMatrix::bmat(&grid)?)))
}
