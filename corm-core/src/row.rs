use crate::Value;
use std::sync::Arc;

/// Metadata about a modifying operation (INSERT/UPDATE/DELETE) returned by a
/// [`crate::Provider`].
#[derive(Default, Debug, Clone, Copy)]
pub struct RowsAffected {
    /// `None` when the provider did not report a count.
    pub rows_affected: Option<u64>,
    /// The identifier generated for an auto-assigned primary key, if any.
    pub last_inserted_id: Option<i64>,
}

impl Extend<RowsAffected> for RowsAffected {
    fn extend<T: IntoIterator<Item = RowsAffected>>(&mut self, iter: T) {
        for elem in iter {
            if self.rows_affected.is_some() || elem.rows_affected.is_some() {
                self.rows_affected = Some(
                    self.rows_affected.unwrap_or_default() + elem.rows_affected.unwrap_or_default(),
                );
            }
            if elem.last_inserted_id.is_some() {
                self.last_inserted_id = elem.last_inserted_id;
            }
        }
    }
}

/// Shared, reference-counted column name list.
pub type RowNames = Arc<[&'static str]>;
/// Owned row value slice, aligned with a [`RowNames`].
pub type Row = Box<[Value]>;

/// A row with its column labels, as returned by a `SELECT`.
#[derive(Debug, Clone)]
pub struct RowLabeled {
    pub labels: RowNames,
    pub values: Row,
}

impl RowLabeled {
    pub fn new(labels: RowNames, values: Row) -> Self {
        Self { labels, values }
    }

    /// Look up a column value by its label name.
    pub fn get_column(&self, name: &str) -> Option<&Value> {
        self.labels
            .iter()
            .position(|v| *v == name)
            .map(|i| &self.values[i])
    }
}
