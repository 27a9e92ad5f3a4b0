//! Compressed sparse row matrices for preconditioners.
//!
//! Block-diagonal preconditioners are sparse by construction: every sub-block
//! is either a diagonal matrix or zero. They are assembled block by block with
//! [`CsrMatrix::bmat`] and applied through [`DiscreteOperator`].

use super::operator::{DiscreteOperator, OperatorError};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

#[derive(Debug, Clone, PartialEq)]
pub struct CsrMatrix {
    n_rows: usize,
    n_cols: usize,
    row_ptr: Vec<usize>,
    col_idx: Vec<usize>,
    values: Vec<f64>,
}

impl CsrMatrix {
    /// An all-zero matrix with no stored entries.
    pub fn zeros(n_rows: usize, n_cols: usize) -> Self {
        Self {
            n_rows,
            n_cols,
            row_ptr: vec![0; n_rows + 1],
            col_idx: Vec::new(),
            values: Vec::new(),
        }
    }

    /// A square diagonal matrix. Zero diagonal entries are still stored.
    pub fn from_diagonal(diagonal: &[f64]) -> Self {
        let n = diagonal.len();
        Self {
            n_rows: n,
            n_cols: n,
            row_ptr: (0..=n).collect(),
            col_idx: (0..n).collect(),
            values: diagonal.to_vec(),
        }
    }

    #[inline]
    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    #[inline]
    pub fn n_cols(&self) -> usize {
        self.n_cols
    }

    #[inline]
    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// Value at `(row, col)`, zero if the entry is not stored.
    pub fn get(&self, row: usize, col: usize) -> f64 {
        let (start, end) = (self.row_ptr[row], self.row_ptr[row + 1]);
        self.col_idx[start..end]
            .iter()
            .position(|&c| c == col)
            .map_or(0.0, |k| self.values[start + k])
    }

    /// Concatenates a rectangular grid of blocks into one matrix.
    ///
    /// Every block must be present; zero regions are passed as explicit
    /// [`CsrMatrix::zeros`] blocks of the right shape.
    pub fn bmat(blocks: &[Vec<CsrMatrix>]) -> Result<Self, OperatorError> {
        let block_cols = blocks.first().map_or(0, Vec::len);
        if blocks.is_empty() || block_cols == 0 {
            return Err(OperatorError::EmptyLayout);
        }

        let row_sizes: Vec<usize> = blocks.iter().map(|row| row[0].n_rows).collect();
        let col_sizes: Vec<usize> = blocks[0].iter().map(|b| b.n_cols).collect();
        for (i, row) in blocks.iter().enumerate() {
            if row.len() != block_cols {
                return Err(OperatorError::ShapeMismatch {
                    context: format!("sparse block row {i} length"),
                    expected: (1, block_cols),
                    found: (1, row.len()),
                });
            }
            for (j, block) in row.iter().enumerate() {
                let expected = (row_sizes[i], col_sizes[j]);
                if (block.n_rows, block.n_cols) != expected {
                    return Err(OperatorError::ShapeMismatch {
                        context: format!("sparse block ({i}, {j})"),
                        expected,
                        found: (block.n_rows, block.n_cols),
                    });
                }
            }
        }

        let mut col_offsets = Vec::with_capacity(block_cols);
        let mut acc = 0;
        for size in &col_sizes {
            col_offsets.push(acc);
            acc += size;
        }
        let n_cols = acc;
        let n_rows: usize = row_sizes.iter().sum();
        let nnz: usize = blocks.iter().flatten().map(CsrMatrix::nnz).sum();

        let mut row_ptr = Vec::with_capacity(n_rows + 1);
        let mut col_idx = Vec::with_capacity(nnz);
        let mut values = Vec::with_capacity(nnz);
        row_ptr.push(0);

        for (row_blocks, &rows) in blocks.iter().zip(&row_sizes) {
            for local_row in 0..rows {
                for (block, &offset) in row_blocks.iter().zip(&col_offsets) {
                    let (start, end) = (block.row_ptr[local_row], block.row_ptr[local_row + 1]);
                    col_idx.extend(block.col_idx[start..end].iter().map(|c| c + offset));
                    values.extend_from_slice(&block.values[start..end]);
                }
                row_ptr.push(col_idx.len());
            }
        }

        Ok(Self {
            n_rows,
            n_cols,
            row_ptr,
            col_idx,
            values,
        })
    }

    /// y = A x
    pub fn mul_vec(&self, x: &[f64], y: &mut [f64]) {
        assert_eq!(x.len(), self.n_cols, "x length must equal the column count");
        assert_eq!(y.len(), self.n_rows, "y length must equal the row count");

        let row_value = |row: usize| -> f64 {
            (self.row_ptr[row]..self.row_ptr[row + 1])
                .map(|k| self.values[k] * x[self.col_idx[k]])
                .sum()
        };

        #[cfg(not(feature = "parallel"))]
        let rows = y.iter_mut().enumerate();

        #[cfg(feature = "parallel")]
        let rows = y.par_iter_mut().enumerate();

        rows.for_each(|(row, yi)| *yi = row_value(row));
    }
}

impl DiscreteOperator for CsrMatrix {
    fn shape(&self) -> (usize, usize) {
        (self.n_rows, self.n_cols)
    }

    fn apply(&self, x: &[f64], y: &mut [f64]) {
        self.mul_vec(x, y);
    }
}
