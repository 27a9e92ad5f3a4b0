use crate::core::bem::operator::BlockedBoundaryOperator;
use crate::core::bem::sparse::CsrMatrix;
use crate::engine::error::EngineError;
use nalgebra::DVector;

/// Element-wise inverse of the 2x2 block of weak-form diagonals `[[d11, d12], [d21, d22]]`.
fn inverse_2x2(
    d11: &DVector<f64>,
    d12: &DVector<f64>,
    d21: &DVector<f64>,
    d22: &DVector<f64>,
) -> Result<[Vec<f64>; 4], EngineError> {
    let n = d11.len();
    let mut inv = [vec![0.0; n], vec![0.0; n], vec![0.0; n], vec![0.0; n]];
    for i in 0..n {
        let a = d11[i];
        if a == 0.0 {
            return Err(EngineError::Precondition(format!("zero leading diagonal at dof {i}")));
        }
        let schur = d22[i] - d21[i] * d12[i] / a;
        if schur == 0.0 {
            return Err(EngineError::Precondition(format!("singular Schur complement at dof {i}")));
        }
        let d = 1.0 / schur;
        inv[0][i] = 1.0 / a + (1.0 / a) * d12[i] * d * d21[i] / a;
        inv[1][i] = -(1.0 / a) * d12[i] * d;
        inv[2][i] = -d * d21[i] / a;
        inv[3][i] = d;
    }
    Ok(inv)
}

/// Block-diagonal preconditioner of a 2x2 or 4x4 self block.
///
/// Each interface pair `(2k, 2k + 1)` of sub-blocks is inverted exactly on its
/// diagonals; blocks coupling different interfaces are zero.
pub fn block_diagonal(lhs: &BlockedBoundaryOperator) -> Result<CsrMatrix, EngineError> {
    let (rows, cols) = lhs.block_shape();
    if rows != cols || rows % 2 != 0 {
        return Err(EngineError::Precondition(format!(
            "block-diagonal preconditioning needs an even square block layout, got {rows}x{cols}"
        )));
    }

    let dofs = lhs.row_dofs().to_vec();
    let mut grid: Vec<Vec<CsrMatrix>> = (0..rows)
        .map(|r| (0..cols).map(|c| CsrMatrix::zeros(dofs[r], dofs[c])).collect())
        .collect();

    for pair in 0..rows / 2 {
        let (p, q) = (2 * pair, 2 * pair + 1);
        let inv = inverse_2x2(
            &lhs.weak_diagonal(p, p),
            &lhs.weak_diagonal(p, q),
            &lhs.weak_diagonal(q, p),
            &lhs.weak_diagonal(q, q),
        )?;
        let [i11, i12, i21, i22] = inv;
        grid[p][p] = CsrMatrix::from_diagonal(&i11);
        grid[p][q] = CsrMatrix::from_diagonal(&i12);
        grid[q][p] = CsrMatrix::from_diagonal(&i21);
        grid[q][q] = CsrMatrix::from_diagonal(&i22);
    }

    Ok(CsrMatrix::bmat(&grid)?)
}
