//! Storage-independent access to a gene × cell expression layer.
//!
//! Dense layers are `ndarray::Array2` and sparse layers are `CsrMatrix` with
//! genes as rows. Everything downstream works through [`CountsView`] and never
//! inspects which of the two it was given.

use std::sync::Arc;

use nalgebra_sparse::CsrMatrix;
use ndarray::{Array2, Axis};
use single_utilities::traits::FloatOpsTS;

use crate::error::{ContrastError, Result};

/// Read-only operations the contrast pipeline needs from an expression layer.
pub trait CountsView: Send + Sync {
    fn n_genes(&self) -> usize;

    fn n_cells(&self) -> usize;

    /// Total expression per cell.
    fn column_sums(&self) -> Vec<f64>;

    /// Number of genes with a value strictly greater than zero, per cell.
    fn detected_per_cell(&self) -> Vec<usize>;

    /// Values of one gene for the given cells, in the order of `cells`.
    fn gene_values(&self, gene: usize, cells: &[usize]) -> Vec<f64>;

    /// `log2(value + offset)` for one gene and the given cells.
    fn log2_gene_values(&self, gene: usize, cells: &[usize], offset: f64) -> Vec<f64> {
        self.gene_values(gene, cells)
            .into_iter()
            .map(|v| (v + offset).log2())
            .collect()
    }

    /// A new layer holding only the given cells, in the given order.
    fn select_cells(&self, cells: &[usize]) -> Result<Arc<dyn CountsView>>;
}

fn as_f64<T: FloatOpsTS>(value: T) -> f64 {
    num_traits::ToPrimitive::to_f64(&value).unwrap_or(0.0)
}

fn check_cells(cells: &[usize], n_cells: usize) -> Result<()> {
    if let Some(&bad) = cells.iter().find(|&&c| c >= n_cells) {
        return Err(ContrastError::InvalidInput(format!(
            "cell index {} out of range for a layer with {} cells",
            bad, n_cells
        )));
    }
    Ok(())
}

impl<T> CountsView for Array2<T>
where
    T: FloatOpsTS,
{
    fn n_genes(&self) -> usize {
        self.nrows()
    }

    fn n_cells(&self) -> usize {
        self.ncols()
    }

    fn column_sums(&self) -> Vec<f64> {
        self.axis_iter(Axis(1))
            .map(|col| col.iter().map(|&v| as_f64(v)).sum())
            .collect()
    }

    fn detected_per_cell(&self) -> Vec<usize> {
        self.axis_iter(Axis(1))
            .map(|col| col.iter().filter(|&&v| v > T::zero()).count())
            .collect()
    }

    fn gene_values(&self, gene: usize, cells: &[usize]) -> Vec<f64> {
        let row = self.row(gene);
        cells
            .iter()
            .map(|&c| as_f64(row[c]))
            .collect()
    }

    fn select_cells(&self, cells: &[usize]) -> Result<Arc<dyn CountsView>> {
        check_cells(cells, self.ncols())?;
        let selected: Array2<f64> = self
            .select(Axis(1), cells)
            .mapv(as_f64);
        Ok(Arc::new(selected))
    }
}

impl<T> CountsView for CsrMatrix<T>
where
    T: FloatOpsTS,
{
    fn n_genes(&self) -> usize {
        self.nrows()
    }

    fn n_cells(&self) -> usize {
        self.ncols()
    }

    fn column_sums(&self) -> Vec<f64> {
        let mut sums = vec![0.0; self.ncols()];
        for (_, col, value) in self.triplet_iter() {
            sums[col] += as_f64(*value);
        }
        sums
    }

    fn detected_per_cell(&self) -> Vec<usize> {
        let mut detected = vec![0usize; self.ncols()];
        for (_, col, value) in self.triplet_iter() {
            if *value > T::zero() {
                detected[col] += 1;
            }
        }
        detected
    }

    fn gene_values(&self, gene: usize, cells: &[usize]) -> Vec<f64> {
        let row = self.row(gene);
        let mut dense = vec![0.0; self.ncols()];
        for (&col, value) in row.col_indices().iter().zip(row.values()) {
            dense[col] = as_f64(*value);
        }
        cells.iter().map(|&c| dense[c]).collect()
    }

    fn select_cells(&self, cells: &[usize]) -> Result<Arc<dyn CountsView>> {
        check_cells(cells, self.ncols())?;

        // old column -> new column; columns must stay sorted within each row
        let mut order: Vec<(usize, usize)> = cells
            .iter()
            .enumerate()
            .map(|(new, &old)| (old, new))
            .collect();
        order.sort_unstable();
        if order.windows(2).any(|w| w[0].0 == w[1].0) {
            return Err(ContrastError::InvalidInput(
                "cell selection contains duplicate indices".to_string(),
            ));
        }
        let mut remap: Vec<Option<usize>> = vec![None; self.ncols()];
        for &(old, new) in &order {
            remap[old] = Some(new);
        }

        let mut row_offsets = Vec::with_capacity(self.nrows() + 1);
        let mut col_indices = Vec::new();
        let mut values = Vec::new();
        row_offsets.push(0);
        for gene in 0..self.nrows() {
            let row = self.row(gene);
            let mut entries: Vec<(usize, f64)> = row
                .col_indices()
                .iter()
                .zip(row.values())
                .filter_map(|(&col, v)| remap[col].map(|new| (new, as_f64(*v))))
                .collect();
            entries.sort_unstable_by_key(|&(col, _)| col);
            for (col, v) in entries {
                col_indices.push(col);
                values.push(v);
            }
            row_offsets.push(col_indices.len());
        }

        let selected = CsrMatrix::try_from_csr_data(
            self.nrows(),
            cells.len(),
            row_offsets,
            col_indices,
            values,
        )
        .map_err(|e| ContrastError::InvalidInput(format!("failed to subset sparse layer: {}", e)))?;
        Ok(Arc::new(selected))
    }
}
