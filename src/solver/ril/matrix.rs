//! Growable weight matrix for the linear action-value approximation.
//!
//! Rows are actions and columns are state features. Rows and column blocks
//! can be inserted or removed anywhere; every surviving entry keeps its
//! value, and new entries start at zero.

/// Dense row-major matrix stored as one vector per row
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WeightMatrix {
    rows: Vec<Vec<f64>>,
    cols: usize,
}

impl WeightMatrix {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        WeightMatrix {
            rows: vec![vec![0.0; cols]; rows],
            cols,
        }
    }

    pub fn rows(&self) -> usize {
        self.rows.len()
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn row(&self, index: usize) -> Option<&[f64]> {
        self.rows.get(index).map(Vec::as_slice)
    }

    pub fn row_mut(&mut self, index: usize) -> Option<&mut [f64]> {
        self.rows.get_mut(index).map(Vec::as_mut_slice)
    }

    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        self.rows.get(row).and_then(|r| r.get(col)).copied()
    }

    pub fn set(&mut self, row: usize, col: usize, value: f64) -> bool {
        match self.rows.get_mut(row).and_then(|r| r.get_mut(col)) {
            Some(cell) => {
                *cell = value;
                true
            }
            None => false,
        }
    }

    /// Insert a zero row before `at` (or at the end if `at` is past it)
    pub fn insert_row(&mut self, at: usize) {
        let at = at.min(self.rows.len());
        self.rows.insert(at, vec![0.0; self.cols]);
    }

    pub fn remove_row(&mut self, at: usize) -> Option<Vec<f64>> {
        if at < self.rows.len() {
            Some(self.rows.remove(at))
        } else {
            None
        }
    }

    /// Insert `count` zero columns before column `at` in every row
    pub fn insert_cols(&mut self, at: usize, count: usize) {
        let at = at.min(self.cols);
        for row in &mut self.rows {
            insert_zeros(row, at, count);
        }
        self.cols += count;
    }

    /// Remove the columns `[at, at + count)` from every row.
    ///
    /// Returns `false` and leaves the matrix untouched if the range does not fit.
    pub fn remove_cols(&mut self, at: usize, count: usize) -> bool {
        if at + count > self.cols {
            return false;
        }
        for row in &mut self.rows {
            row.drain(at..at + count);
        }
        self.cols -= count;
        true
    }

    /// Resize to `rows` x `cols`, keeping every entry whose indices still
    /// exist and zero-filling the rest
    pub fn resize(&mut self, rows: usize, cols: usize) {
        self.rows.resize_with(rows, || vec![0.0; cols]);
        for row in &mut self.rows {
            row.resize(cols, 0.0);
        }
        self.cols = cols;
    }

    /// Scalar product of one row with a vector
    pub fn dot_row(&self, row: usize, vector: &[f64]) -> f64 {
        match self.rows.get(row) {
            Some(weights) => weights.iter().zip(vector).map(|(w, x)| w * x).sum(),
            None => 0.0,
        }
    }
}

/// Insert `count` zeros before index `at`
pub fn insert_zeros(vector: &mut Vec<f64>, at: usize, count: usize) {
    let at = at.min(vector.len());
    vector.splice(at..at, std::iter::repeat(0.0).take(count));
}

/// Remove `[at, at + count)` if the range fits
pub fn remove_range(vector: &mut Vec<f64>, at: usize, count: usize) -> bool {
    if at + count > vector.len() {
        return false;
    }
    vector.drain(at..at + count);
    true
}
