//! Row-count gate applied before a view generation is published.

/// Conditions a generation's row count must meet to replace the published one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RowCountGuard {
    /// Fewest rows a generation must have.
    pub min_rows: u64,
    /// Reject a generation smaller than this fraction of the published one.
    pub max_shrink_ratio: Option<f64>,
}

impl Default for RowCountGuard {
    fn default() -> Self {
        Self {
            min_rows: 1,
            max_shrink_ratio: None,
        }
    }
}

impl RowCountGuard {
    /// Check a generation of `rows` rows against the published one, if any.
    ///
    /// An empty generation never replaces a non-empty one, whatever `min_rows` says.
    pub fn check(&self, rows: u64, previous: Option<u64>) -> Result<(), String> {
        if rows < self.min_rows {
            return Err(format!(
                "new generation has {} rows, at least {} required",
                rows, self.min_rows
            ));
        }
        let previous = previous.unwrap_or(0);
        if rows == 0 && previous > 0 {
            return Err(format!(
                "new generation is empty, published one has {} rows",
                previous
            ));
        }
        if let Some(ratio) = self.max_shrink_ratio {
            if previous > 0 && (rows as f64) < (previous as f64) * ratio {
                return Err(format!(
                    "new generation has {} rows, below {:.0}% of the published {}",
                    rows,
                    ratio * 100.0,
                    previous
                ));
            }
        }
        Ok(())
    }
}
