use nalgebra::{DMatrix, DVector};
use std::fmt;
use std::ops::{Add, Mul, Neg, Sub};
use std::sync::Arc;
use thiserror::Error;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

#[derive(Debug, Error, PartialEq)]
pub enum OperatorError {
    #[error("Shape mismatch in {context}: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        context: String,
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("Block ({row}, {col}) is outside a {rows}x{cols} block layout")]
    BlockOutOfRange {
        row: usize,
        col: usize,
        rows: usize,
        cols: usize,
    },

    #[error("Blocked operator must have at least one block row and column")]
    EmptyLayout,

    #[error("Vector of length {found} does not match operator dimension {expected}")]
    VectorLength { expected: usize, found: usize },
}

/// Which discrete representation of a boundary operator to hand to the solver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscreteForm {
    /// Galerkin-style form, tested against the range space.
    Weak,
    /// Weak form with the inverse range mass matrix applied.
    Strong,
}

/// A linear operator as seen by the iterative solver.
///
/// `apply` computes `y = A x` and overwrites `y`.
pub trait DiscreteOperator: Send + Sync + fmt::Debug {
    fn shape(&self) -> (usize, usize);

    fn apply(&self, x: &[f64], y: &mut [f64]);

    fn apply_vec(&self, x: &DVector<f64>) -> DVector<f64> {
        let mut y = DVector::zeros(self.shape().0);
        self.apply(x.as_slice(), y.as_mut_slice());
        y
    }
}

/// A dense matrix operator.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseOperator {
    matrix: DMatrix<f64>,
}

impl DenseOperator {
    pub fn new(matrix: DMatrix<f64>) -> Self {
        Self { matrix }
    }

    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.matrix
    }
}

impl DiscreteOperator for DenseOperator {
    fn shape(&self) -> (usize, usize) {
        self.matrix.shape()
    }

    fn apply(&self, x: &[f64], y: &mut [f64]) {
        dense_mul_vec(&self.matrix, x, y);
    }
}

pub(crate) fn dense_mul_vec(matrix: &DMatrix<f64>, x: &[f64], y: &mut [f64]) {
    let row_value = |i: usize| -> f64 { matrix.row(i).iter().zip(x).map(|(a, b)| a * b).sum() };

    #[cfg(not(feature = "parallel"))]
    let rows = y.iter_mut().enumerate();

    #[cfg(feature = "parallel")]
    let rows = y.par_iter_mut().enumerate();

    rows.for_each(|(i, yi)| *yi = row_value(i));
}

/// A structurally zero operator of a fixed shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZeroOperator {
    rows: usize,
    cols: usize,
}

impl ZeroOperator {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self { rows, cols }
    }
}

impl DiscreteOperator for ZeroOperator {
    fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    fn apply(&self, _x: &[f64], y: &mut [f64]) {
        y.fill(0.0);
    }
}

/// A rectangular array of discrete operators acting on concatenated vectors.
///
/// All blocks in a block row share a row count and all blocks in a block
/// column share a column count. Blocks may themselves be blocked operators.
#[derive(Debug, Clone)]
pub struct BlockedDiscreteOperator {
    blocks: Vec<Vec<Arc<dyn DiscreteOperator>>>,
    row_offsets: Vec<usize>,
    col_offsets: Vec<usize>,
}

impl BlockedDiscreteOperator {
    pub fn new(blocks: Vec<Vec<Arc<dyn DiscreteOperator>>>) -> Result<Self, OperatorError> {
        let block_rows = blocks.len();
        let block_cols = blocks.first().map_or(0, Vec::len);
        if block_rows == 0 || block_cols == 0 {
            return Err(OperatorError::EmptyLayout);
        }

        let row_sizes: Vec<usize> = blocks.iter().map(|row| row[0].shape().0).collect();
        let col_sizes: Vec<usize> = blocks[0].iter().map(|b| b.shape().1).collect();

        for (i, row) in blocks.iter().enumerate() {
            if row.len() != block_cols {
                return Err(OperatorError::ShapeMismatch {
                    context: format!("block row {i} length"),
                    expected: (1, block_cols),
                    found: (1, row.len()),
                });
            }
            for (j, block) in row.iter().enumerate() {
                let expected = (row_sizes[i], col_sizes[j]);
                if block.shape() != expected {
                    return Err(OperatorError::ShapeMismatch {
                        context: format!("block ({i}, {j})"),
                        expected,
                        found: block.shape(),
                    });
                }
            }
        }

        Ok(Self {
            blocks,
            row_offsets: prefix_offsets(&row_sizes),
            col_offsets: prefix_offsets(&col_sizes),
        })
    }

    #[inline]
    pub fn block_shape(&self) -> (usize, usize) {
        (self.row_offsets.len() - 1, self.col_offsets.len() - 1)
    }

    #[inline]
    pub fn block(&self, row: usize, col: usize) -> &Arc<dyn DiscreteOperator> {
        &self.blocks[row][col]
    }

    pub fn row_offsets(&self) -> &[usize] {
        &self.row_offsets
    }

    pub fn col_offsets(&self) -> &[usize] {
        &self.col_offsets
    }
}

impl DiscreteOperator for BlockedDiscreteOperator {
    fn shape(&self) -> (usize, usize) {
        (
            *self.row_offsets.last().unwrap_or(&0),
            *self.col_offsets.last().unwrap_or(&0),
        )
    }

    fn apply(&self, x: &[f64], y: &mut [f64]) {
        y.fill(0.0);
        let mut scratch = Vec::new();
        for (i, row) in self.blocks.iter().enumerate() {
            let (r0, r1) = (self.row_offsets[i], self.row_offsets[i + 1]);
            scratch.resize(r1 - r0, 0.0);
            for (j, block) in row.iter().enumerate() {
                let (c0, c1) = (self.col_offsets[j], self.col_offsets[j + 1]);
                block.apply(&x[c0..c1], &mut scratch);
                for (acc, v) in y[r0..r1].iter_mut().zip(&scratch) {
                    *acc += v;
                }
            }
        }
    }
}

fn prefix_offsets(sizes: &[usize]) -> Vec<usize> {
    let mut offsets = Vec::with_capacity(sizes.len() + 1);
    offsets.push(0);
    let mut total = 0;
    for size in sizes {
        total += size;
        offsets.push(total);
    }
    offsets
}

/// An assembled boundary-integral operator between two interfaces.
///
/// Stores the weak form together with the diagonal (lumped) mass matrix of
/// the range space so that the strong form can be produced on demand.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundaryOperator {
    weak: DMatrix<f64>,
    range_mass: DVector<f64>,
}

impl BoundaryOperator {
    /// # Panics
    ///
    /// Panics if the mass vector length differs from the weak form's row count.
    pub fn new(weak: DMatrix<f64>, range_mass: DVector<f64>) -> Self {
        assert_eq!(weak.nrows(), range_mass.len(), "range mass must match operator rows");
        Self { weak, range_mass }
    }

    /// The zero operator with the given shape.
    pub fn zero(range_mass: DVector<f64>, domain_dofs: usize) -> Self {
        let weak = DMatrix::zeros(range_mass.len(), domain_dofs);
        Self { weak, range_mass }
    }

    /// The identity on a space whose mass matrix is `mass`.
    pub fn identity(mass: DVector<f64>) -> Self {
        let weak = DMatrix::from_diagonal(&mass);
        Self { weak, range_mass: mass }
    }

    #[inline]
    pub fn shape(&self) -> (usize, usize) {
        self.weak.shape()
    }

    pub fn weak_form(&self) -> &DMatrix<f64> {
        &self.weak
    }

    pub fn strong_form(&self) -> DMatrix<f64> {
        let mut strong = self.weak.clone();
        for (mut row, m) in strong.row_iter_mut().zip(self.range_mass.iter()) {
            row /= *m;
        }
        strong
    }

    pub fn range_mass(&self) -> &DVector<f64> {
        &self.range_mass
    }

    pub fn discrete(&self, form: DiscreteForm) -> Arc<dyn DiscreteOperator> {
        match form {
            DiscreteForm::Weak => Arc::new(DenseOperator::new(self.weak.clone())),
            DiscreteForm::Strong => Arc::new(DenseOperator::new(self.strong_form())),
        }
    }

    /// Scales each domain degree of freedom (column) by the matching entry.
    pub fn scale_domain(&self, factors: &DVector<f64>) -> Self {
        assert_eq!(self.weak.ncols(), factors.len(), "domain scaling length mismatch");
        let mut weak = self.weak.clone();
        for (mut col, f) in weak.column_iter_mut().zip(factors.iter()) {
            col *= *f;
        }
        Self {
            weak,
            range_mass: self.range_mass.clone(),
        }
    }

    pub fn weak_diagonal(&self) -> DVector<f64> {
        self.weak.diagonal()
    }
}

impl Add for BoundaryOperator {
    type Output = BoundaryOperator;

    fn add(self, rhs: Self) -> Self::Output {
        Self {
            weak: self.weak + rhs.weak,
            range_mass: self.range_mass,
        }
    }
}

impl Sub for BoundaryOperator {
    type Output = BoundaryOperator;

    fn sub(self, rhs: Self) -> Self::Output {
        Self {
            weak: self.weak - rhs.weak,
            range_mass: self.range_mass,
        }
    }
}

impl Mul<f64> for BoundaryOperator {
    type Output = BoundaryOperator;

    fn mul(self, rhs: f64) -> Self::Output {
        Self {
            weak: self.weak * rhs,
            range_mass: self.range_mass,
        }
    }
}

impl Mul<BoundaryOperator> for f64 {
    type Output = BoundaryOperator;

    fn mul(self, rhs: BoundaryOperator) -> Self::Output {
        rhs * self
    }
}

impl Neg for BoundaryOperator {
    type Output = BoundaryOperator;

    fn neg(self) -> Self::Output {
        self * -1.0
    }
}

/// A rectangular array of boundary operators; `None` entries are zero blocks.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockedBoundaryOperator {
    row_dofs: Vec<usize>,
    col_dofs: Vec<usize>,
    blocks: Vec<Vec<Option<BoundaryOperator>>>,
}

impl BlockedBoundaryOperator {
    pub fn new(row_dofs: Vec<usize>, col_dofs: Vec<usize>) -> Self {
        let blocks = vec![vec![None; col_dofs.len()]; row_dofs.len()];
        Self {
            row_dofs,
            col_dofs,
            blocks,
        }
    }

    pub fn set(&mut self, row: usize, col: usize, op: BoundaryOperator) -> Result<(), OperatorError> {
        let (rows, cols) = self.block_shape();
        if row >= rows || col >= cols {
            return Err(OperatorError::BlockOutOfRange { row, col, rows, cols });
        }
        let expected = (self.row_dofs[row], self.col_dofs[col]);
        if op.shape() != expected {
            return Err(OperatorError::ShapeMismatch {
                context: format!("boundary block ({row}, {col})"),
                expected,
                found: op.shape(),
            });
        }
        self.blocks[row][col] = Some(op);
        Ok(())
    }

    #[inline]
    pub fn block_shape(&self) -> (usize, usize) {
        (self.row_dofs.len(), self.col_dofs.len())
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> Option<&BoundaryOperator> {
        self.blocks.get(row)?.get(col)?.as_ref()
    }

    pub fn row_dofs(&self) -> &[usize] {
        &self.row_dofs
    }

    pub fn col_dofs(&self) -> &[usize] {
        &self.col_dofs
    }

    /// Weak-form diagonal of block `(row, col)`, zero for an empty block.
    pub fn weak_diagonal(&self, row: usize, col: usize) -> DVector<f64> {
        match self.get(row, col) {
            Some(op) => op.weak_diagonal(),
            None => DVector::zeros(self.row_dofs[row].min(self.col_dofs[col])),
        }
    }

    pub fn discrete(&self, form: DiscreteForm) -> Result<BlockedDiscreteOperator, OperatorError> {
        let blocks = self
            .blocks
            .iter()
            .enumerate()
            .map(|(i, row)| {
                row.iter()
                    .enumerate()
                    .map(|(j, block)| match block {
                        Some(op) => op.discrete(form),
                        None => Arc::new(ZeroOperator::new(self.row_dofs[i], self.col_dofs[j]))
                            as Arc<dyn DiscreteOperator>,
                    })
                    .collect()
            })
            .collect();
        BlockedDiscreteOperator::new(blocks)
    }
}

/// Coefficients of a piecewise-constant surface function together with its
/// projections onto the test space.
#[derive(Debug, Clone, PartialEq)]
pub struct GridFunction {
    pub coefficients: DVector<f64>,
    pub projections: DVector<f64>,
}

impl GridFunction {
    pub fn zeros(dofs: usize) -> Self {
        Self {
            coefficients: DVector::zeros(dofs),
            projections: DVector::zeros(dofs),
        }
    }

    pub fn vector(&self, form: DiscreteForm) -> &DVector<f64> {
        match form {
            DiscreteForm::Weak => &self.projections,
            DiscreteForm::Strong => &self.coefficients,
        }
    }
}

/// Evaluates a layer potential of surface data at a fixed set of points.
#[derive(Debug, Clone, PartialEq)]
pub struct PotentialOperator {
    matrix: DMatrix<f64>,
}

impl PotentialOperator {
    pub fn new(matrix: DMatrix<f64>) -> Self {
        Self { matrix }
    }

    pub fn evaluate(&self, coefficients: &DVector<f64>) -> Result<DVector<f64>, OperatorError> {
        if coefficients.len() != self.matrix.ncols() {
            return Err(OperatorError::VectorLength {
                expected: self.matrix.ncols(),
                found: coefficients.len(),
            });
        }
        let mut out = DVector::zeros(self.matrix.nrows());
        dense_mul_vec(&self.matrix, coefficients.as_slice(), out.as_mut_slice());
        Ok(out)
    }

    pub fn point_count(&self) -> usize {
        self.matrix.nrows()
    }
}
