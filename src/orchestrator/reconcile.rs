//! Drift reconciliation driver
//!
//! Applies the column operations computed by [`compute_drift`] in the order
//! add → update → remove. A refused type change aborts the stream and is
//! never retried. A refused add is fatal as well. Refused removals only leave
//! an unused column behind and are logged.

use serde::Serialize;
use tracing::{info, warn};

use crate::ddl::compute_drift;
use crate::models::TableDescriptor;
use crate::store::{ColumnChangeError, StoreClient, StoreError};

/// Error type for drift reconciliation
#[derive(Debug, thiserror::Error)]
pub enum DriftError {
    /// Existing column cannot be converted to the expected type
    #[error("Incompatible schema change: {0}")]
    Incompatible(ColumnChangeError),

    /// Expected column could not be added
    #[error("Schema drift could not be applied: {0}")]
    AddRefused(ColumnChangeError),

    #[error("Failed to read columns: {0}")]
    Store(#[from] StoreError),
}

/// Column operations applied to a table or tree
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    /// Removals the store refused
    pub removal_failures: usize,
}

impl ReconcileReport {
    /// Whether any column changed
    pub fn has_changes(&self) -> bool {
        self.added + self.updated + self.removed > 0
    }

    fn merge(&mut self, other: &ReconcileReport) {
        self.added += other.added;
        self.updated += other.updated;
        self.removed += other.removed;
        self.removal_failures += other.removal_failures;
    }
}

/// Bring the columns of one table in line with its descriptor
pub async fn reconcile_table<S: StoreClient + ?Sized>(
    store: &S,
    table: &TableDescriptor,
) -> Result<ReconcileReport, DriftError> {
    let name = &table.table_name;
    let existing = store.list_columns(name).await?;
    let drift = compute_drift(table, &existing);
    let mut report = ReconcileReport::default();
    if drift.is_empty() {
        return Ok(report);
    }

    info!(
        table = %name,
        add = drift.add.len(),
        update = drift.update.len(),
        remove = drift.remove.len(),
        "Reconciling schema drift"
    );

    for column in &drift.add {
        store
            .add_column(name, column)
            .await
            .map_err(DriftError::AddRefused)?;
        report.added += 1;
    }

    for (existing, desired) in &drift.update {
        store
            .update_column(name, existing, desired)
            .await
            .map_err(DriftError::Incompatible)?;
        report.updated += 1;
    }

    for column in &drift.remove {
        match store.remove_column(name, column).await {
            Ok(()) => report.removed += 1,
            Err(e) => {
                warn!(table = %name, "Ignoring refused column removal: {}", e);
                report.removal_failures += 1;
            }
        }
    }

    Ok(report)
}

/// Reconcile every table of a tree, parents first
pub async fn reconcile_tree<S: StoreClient + ?Sized>(
    store: &S,
    root: &TableDescriptor,
) -> Result<ReconcileReport, DriftError> {
    let mut report = ReconcileReport::default();
    for table in root.walk() {
        report.merge(&reconcile_table(store, table).await?);
    }
    Ok(report)
}
