//! Administrator command surface over a [`RecordStore`].
//!
//! Every status change issued here runs as [`Actor::Administrator`], attributed to
//! the operator the console was opened for.

use std::sync::Arc;

use tracing::info;

use crate::error::BursaryResult;
use crate::export::records_to_csv;
use crate::ledger::{LedgerBalance, LedgerStatus};
use crate::record::{
    ApplicationDraft, ApplicationId, ApplicationPatch, ApplicationRecord, RecordOrigin,
    TransitionMetadata,
};
use crate::status::{Actor, ApplicationStatus};
use crate::store::{ApplicationSummary, RecordFilter, RecordStore};

pub struct AdminConsole {
    store: Arc<RecordStore>,
    operator: String,
}

impl AdminConsole {
    pub fn new(store: Arc<RecordStore>, operator: impl Into<String>) -> Self {
        AdminConsole {
            store,
            operator: operator.into(),
        }
    }

    pub fn operator(&self) -> &str {
        self.operator.as_str()
    }

    fn as_administrator(&self, mut metadata: TransitionMetadata) -> TransitionMetadata {
        metadata.actor = Actor::Administrator;
        if metadata.performed_by.trim().is_empty() {
            metadata.performed_by = self.operator.clone();
        }
        metadata
    }

    pub fn create_record(&self, draft: ApplicationDraft) -> BursaryResult<ApplicationRecord> {
        self.store.create(draft)
    }

    pub fn update_record(
        &self,
        id: &ApplicationId,
        mut patch: ApplicationPatch,
    ) -> BursaryResult<ApplicationRecord> {
        if let Some(update) = patch.status.as_mut() {
            update.metadata = self.as_administrator(update.metadata.clone());
        }
        self.store.update(id, patch)
    }

    pub fn transition_status(
        &self,
        id: &ApplicationId,
        status: ApplicationStatus,
        metadata: TransitionMetadata,
    ) -> BursaryResult<ApplicationRecord> {
        self.store
            .transition_status(id, status, self.as_administrator(metadata))
    }

    pub fn delete_record(&self, id: &ApplicationId) -> BursaryResult<ApplicationRecord> {
        let record = self.store.delete(id)?;
        info!(id = %id, operator = self.operator.as_str(), "application deleted by administrator");
        Ok(record)
    }

    pub fn list_records(&self, filter: RecordFilter) -> BursaryResult<Vec<ApplicationRecord>> {
        Ok(self.store.list(filter)?.to_vec())
    }

    pub fn ledger_status(&self) -> BursaryResult<LedgerStatus> {
        self.store.ledger_status()
    }

    /// Projected ledger after spending `amount`, or `InsufficientBudget`. Nothing
    /// is persisted; awards allocate through [`Self::transition_status`].
    pub fn allocate_budget(&self, amount: u64) -> BursaryResult<LedgerBalance> {
        self.store.preview_allocation(amount)
    }

    pub fn summary(&self) -> BursaryResult<ApplicationSummary> {
        self.store.summary()
    }

    pub fn reconcile(&self) -> BursaryResult<LedgerStatus> {
        self.store.reconcile()
    }

    pub fn purge_origin(&self, origin: RecordOrigin) -> BursaryResult<usize> {
        self.store.purge_origin(origin)
    }

    pub fn export_csv(&self, filter: RecordFilter) -> BursaryResult<String> {
        let query = self.store.list(filter)?;
        Ok(records_to_csv(&query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BursaryError;
    use crate::kv::MemoryStore;
    use crate::record::PersonalDetails;
    use crate::store::StoreOptions;

    fn console(total: u64) -> AdminConsole {
        let store = RecordStore::open(
            Arc::new(MemoryStore::new()),
            StoreOptions {
                jurisdiction: "KIB".to_string(),
                budget_total: total,
                low_balance_percent: 80,
            },
        )
        .expect("open");
        AdminConsole::new(Arc::new(store), "chair")
    }

    fn draft(name: &str) -> ApplicationDraft {
        ApplicationDraft {
            requested_amount: 1_000,
            personal: PersonalDetails {
                full_name: name.to_string(),
                id_number: format!("{name}-1"),
                ..PersonalDetails::default()
            },
            ..ApplicationDraft::default()
        }
    }

    #[test]
    fn allocate_budget_is_a_dry_run() {
        let admin = console(1_000);
        assert_eq!(
            admin.allocate_budget(400).expect("fits"),
            LedgerBalance {
                allocated: 400,
                balance: 600
            }
        );
        assert!(matches!(
            admin.allocate_budget(1_001),
            Err(BursaryError::InsufficientBudget {
                requested: 1_001,
                available: 1_000
            })
        ));
        assert_eq!(admin.ledger_status().expect("status").allocated, 0);
    }

    #[test]
    fn console_acts_as_administrator() {
        let admin = console(10_000);
        let record = admin.create_record(draft("Amina")).expect("create");
        let err = admin
            .transition_status(&record.id, ApplicationStatus::Awarded, TransitionMetadata::applicant().with_award(10))
            .unwrap_err();
        assert!(matches!(err, BursaryError::InvalidTransition { .. }));

        let rejected = admin
            .transition_status(
                &record.id,
                ApplicationStatus::Rejected,
                TransitionMetadata::applicant().with_reason("duplicate"),
            )
            .expect("reject");
        let rejection = rejected.rejection.expect("rejection");
        assert_eq!(rejection.rejected_by, "chair");
        assert_eq!(rejection.reason, "duplicate");
    }

    #[test]
    fn export_includes_filtered_rows() {
        let admin = console(10_000);
        admin.create_record(draft("Amina")).expect("create");
        admin.create_record(draft("=cmd")).expect("create");
        let csv = admin.export_csv(RecordFilter::default()).expect("export");
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[2].contains(",'=cmd,"));

        let none = admin
            .export_csv(RecordFilter::status(ApplicationStatus::Awarded))
            .expect("export");
        assert_eq!(none.lines().count(), 1);
    }
}
