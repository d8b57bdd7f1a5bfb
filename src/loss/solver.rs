//! Minimum-cost linear assignment on rectangular cost matrices.
//!
//! Costs are rounded to fixed point and handed to the Kuhn-Munkres solver of
//! `pathfinding`, which needs totally ordered weights and at most as many rows
//! as columns. Taller matrices are solved on their transpose.

use ndarray::{Array2, ArrayView2};
use pathfinding::prelude::{Matrix, kuhn_munkres_min};

use crate::error::{LossError, LossResult};

/// Magnitude the largest cost is scaled to before rounding.
const FIXED_POINT_RANGE: f64 = (1u64 << 40) as f64;

/// Assign rows to distinct columns minimising the summed cost.
///
/// Returns the column picked for every row. When there are more rows than columns
/// `rows - cols` rows stay unassigned (`None`); otherwise every row gets a column and
/// surplus columns are left uncovered.
///
/// # Errors
///
/// [`LossError::MalformedCostMatrix`] if any entry is NaN or infinite.
pub fn solve(cost: &Array2<f64>) -> LossResult<Vec<Option<usize>>> {
    let (rows, cols) = cost.dim();

    if let Some(((row, col), value)) = cost.indexed_iter().find(|(_, v)| !v.is_finite()) {
        return Err(LossError::MalformedCostMatrix {
            reason: format!("entry ({row}, {col}) of a {rows}x{cols} matrix is {value}"),
        });
    }

    if rows == 0 || cols == 0 {
        return Ok(vec![None; rows]);
    }

    let assignment = if rows <= cols {
        minimum_matching(cost.view()).into_iter().map(Some).collect()
    } else {
        let col_to_row = minimum_matching(cost.t());
        let mut row_to_col = vec![None; rows];
        for (col, row) in col_to_row.into_iter().enumerate() {
            row_to_col[row] = Some(col);
        }
        row_to_col
    };

    tracing::trace!(rows, cols, ?assignment, "solved assignment");
    Ok(assignment)
}

/// Sum of `cost[row, col]` over the assigned rows.
pub fn assignment_cost(cost: &Array2<f64>, assignment: &[Option<usize>]) -> f64 {
    assignment
        .iter()
        .enumerate()
        .filter_map(|(row, col)| col.map(|col| cost[[row, col]]))
        .sum()
}

/// Requires a non-empty `rows <= cols` matrix of finite entries. Returns the column of every row.
fn minimum_matching(cost: ArrayView2<f64>) -> Vec<usize> {
    let (rows, cols) = cost.dim();
    let scale = fixed_point_scale(&cost);
    let weights = Matrix::from_fn(rows, cols, |(row, col)| {
        (cost[[row, col]] * scale).round() as i64
    });
    let (_, col_of_row) = kuhn_munkres_min(&weights);
    col_of_row
}

/// Factor mapping the largest entry onto [`FIXED_POINT_RANGE`].
fn fixed_point_scale(cost: &ArrayView2<f64>) -> f64 {
    let max_abs = cost.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
    if max_abs > 0.0 {
        FIXED_POINT_RANGE / max_abs
    } else {
        1.0
    }
}
