//! Application record store.
//!
//! Every mutation is a read-modify-write over the whole persisted snapshot:
//! load the latest records and ledger, apply the change in memory, then commit
//! records, counters and ledger together in one batch. Nothing is written when
//! any step fails, so a refused award leaves both the record and the ledger as
//! they were.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{BursaryError, BursaryResult};
use crate::events::{ChangeAction, ChangeEvent, ChangeFeed, ChangeSubscriber};
use crate::kv::{KeyValueStore, StorageError};
use crate::ledger::{awarded_total, BudgetLedger, LedgerBalance, LedgerStatus};
use crate::mirror::{MirrorHandle, MirrorJob};
use crate::record::{
    checked_amount, clamp_note, validate_jurisdiction, ApplicationDraft, ApplicationId,
    ApplicationPatch, ApplicationRecord, AwardMetadata, RecordOrigin, RejectionMetadata,
    StatusChange, TransitionMetadata, MAX_ID_SEQUENCE,
};
use crate::snapshot::{ledger_entries, Snapshot, RECORDS_KEY};
use crate::status::{is_allowed_transition, ApplicationStatus};

const DEFAULT_REJECTION_REASON: &str = "Not specified";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOptions {
    pub jurisdiction: String,
    pub budget_total: u64,
    pub low_balance_percent: u8,
}

/// Matches every record when all fields are `None`. Region and ward compare
/// case-insensitively.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordFilter {
    pub status: Option<ApplicationStatus>,
    pub sub_region: Option<String>,
    pub ward: Option<String>,
    pub origin: Option<RecordOrigin>,
}

impl RecordFilter {
    pub fn status(status: ApplicationStatus) -> Self {
        RecordFilter {
            status: Some(status),
            ..RecordFilter::default()
        }
    }

    pub fn matches(&self, record: &ApplicationRecord) -> bool {
        let text_matches = |wanted: &Option<String>, actual: &str| {
            wanted
                .as_deref()
                .map(str::trim)
                .filter(|wanted| !wanted.is_empty())
                .map_or(true, |wanted| wanted.eq_ignore_ascii_case(actual.trim()))
        };
        self.status.map_or(true, |status| record.status == status)
            && self.origin.map_or(true, |origin| record.origin == origin)
            && text_matches(&self.sub_region, record.location.sub_region.as_str())
            && text_matches(&self.ward, record.location.ward.as_str())
    }
}

/// Result of [`RecordStore::list`]. Owns the snapshot it was taken from and can be
/// iterated any number of times; filtering happens lazily on each pass.
#[derive(Debug, Clone)]
pub struct RecordQuery {
    records: Vec<ApplicationRecord>,
    filter: RecordFilter,
}

impl RecordQuery {
    pub fn iter(&self) -> impl Iterator<Item = &ApplicationRecord> + '_ {
        self.records
            .iter()
            .filter(move |record| self.filter.matches(record))
    }

    pub fn count(&self) -> usize {
        self.iter().count()
    }

    pub fn to_vec(&self) -> Vec<ApplicationRecord> {
        self.iter().cloned().collect()
    }
}

impl<'a> IntoIterator for &'a RecordQuery {
    type Item = &'a ApplicationRecord;
    type IntoIter = Box<dyn Iterator<Item = &'a ApplicationRecord> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub draft: usize,
    pub pending_ward_review: usize,
    pub pending_committee_review: usize,
    pub awarded: usize,
    pub rejected: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationSummary {
    pub total_applications: usize,
    pub by_status: StatusCounts,
    pub requested_total: u64,
    pub awarded_total: u64,
    pub ledger: LedgerStatus,
}

pub struct RecordStore {
    kv: Arc<dyn KeyValueStore>,
    options: StoreOptions,
    feed: ChangeFeed,
    mirror: Option<MirrorHandle>,
    write_lock: Mutex<()>,
}

impl RecordStore {
    /// Opens the store and initializes the ledger if no ledger state exists yet.
    pub fn open(kv: Arc<dyn KeyValueStore>, options: StoreOptions) -> BursaryResult<Self> {
        validate_jurisdiction(options.jurisdiction.as_str())?;
        if options.low_balance_percent > 100 {
            return Err(BursaryError::validation(
                "low_balance_percent",
                "must be between 0 and 100",
            ));
        }
        let store = RecordStore {
            kv,
            options,
            feed: ChangeFeed::new(),
            mirror: None,
            write_lock: Mutex::new(()),
        };
        store.initialize_budget(store.options.budget_total)?;
        Ok(store)
    }

    pub fn with_mirror(mut self, mirror: MirrorHandle) -> Self {
        self.mirror = Some(mirror);
        self
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    pub fn kv(&self) -> &Arc<dyn KeyValueStore> {
        &self.kv
    }

    pub fn subscribe(&self, subscriber: ChangeSubscriber) {
        self.feed.subscribe(subscriber);
    }

    fn lock(&self) -> BursaryResult<MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| BursaryError::Storage(StorageError::Poisoned))
    }

    /// Latest persisted snapshot with its ledger re-derived from the records it
    /// was read with. A concurrent writer may have changed records behind the
    /// cached aggregate; the healed value is persisted by the next commit.
    fn load(&self) -> BursaryResult<Snapshot> {
        let mut snapshot = Snapshot::load(self.kv.as_ref())?;
        let persisted = snapshot.ledger;
        let mut ledger = persisted.unwrap_or_else(|| BudgetLedger::new(self.options.budget_total));
        ledger.reconcile(&snapshot.records);
        if let Some(persisted) = persisted {
            if persisted.allocated() != ledger.allocated() {
                warn!(
                    cached = persisted.allocated(),
                    derived = ledger.allocated(),
                    "ledger drifted from persisted applications; using derived allocation"
                );
            }
        }
        snapshot.ledger = Some(ledger);
        Ok(snapshot)
    }

    fn commit(&self, snapshot: &Snapshot) -> BursaryResult<()> {
        snapshot.commit(self.kv.as_ref())?;
        Ok(())
    }

    fn publish(&self, action: ChangeAction, id: Option<&ApplicationId>) {
        self.feed.publish(&ChangeEvent {
            collection_key: RECORDS_KEY.to_string(),
            action,
            id: id.cloned(),
        });
    }

    fn mirror_put(&self, record: &ApplicationRecord) {
        let Some(mirror) = &self.mirror else {
            return;
        };
        match serde_json::to_value(record) {
            Ok(document) => mirror.submit(MirrorJob::Put {
                collection: RECORDS_KEY.to_string(),
                id: record.id.to_string(),
                document,
            }),
            Err(err) => warn!(id = %record.id, %err, "failed to encode record for mirror"),
        }
    }

    fn mirror_delete(&self, id: &ApplicationId) {
        if let Some(mirror) = &self.mirror {
            mirror.submit(MirrorJob::Delete {
                collection: RECORDS_KEY.to_string(),
                id: id.to_string(),
            });
        }
    }

    /// Idempotent: an existing ledger keeps its total.
    pub fn initialize_budget(&self, total: u64) -> BursaryResult<LedgerStatus> {
        let _guard = self.lock()?;
        let snapshot = Snapshot::load(self.kv.as_ref())?;
        if let Some(existing) = snapshot.ledger {
            debug!(total = existing.total(), "budget ledger already initialized");
            return Ok(existing.status(self.options.low_balance_percent));
        }
        let ledger = BudgetLedger::initialize(None, total, &snapshot.records);
        self.kv.set_many(&ledger_entries(&ledger))?;
        info!(total, allocated = ledger.allocated(), "budget ledger initialized");
        Ok(ledger.status(self.options.low_balance_percent))
    }

    pub fn create(&self, draft: ApplicationDraft) -> BursaryResult<ApplicationRecord> {
        let _guard = self.lock()?;
        let mut snapshot = self.load()?;

        let requested_amount = checked_amount("requested_amount", draft.requested_amount)?;
        let status = draft.status.unwrap_or_default();
        if status.is_terminal() {
            return Err(BursaryError::validation(
                "status",
                "new applications start as Draft or pending review",
            ));
        }

        let id = match draft.id.as_deref().map(str::trim).filter(|id| !id.is_empty()) {
            Some(raw) => {
                let id = ApplicationId::parse(raw)?;
                if snapshot.position(&id).is_some() {
                    return Err(BursaryError::validation("id", "already exists"));
                }
                if let Some(sequence) = id.sequence() {
                    snapshot.application_counter = snapshot.application_counter.max(sequence);
                }
                id
            }
            None => self.next_id(&mut snapshot)?,
        };

        let now = Utc::now();
        let record = ApplicationRecord {
            id,
            status,
            origin: draft.origin,
            requested_amount,
            is_final_submission: draft.is_final_submission,
            personal: draft.personal.sanitized(),
            location: draft.location.sanitized(),
            education: draft.education.sanitized(),
            financial: draft.financial,
            family: draft.family.sanitized(),
            award: None,
            rejection: None,
            status_history: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        record.validate()?;

        snapshot.records.push(record.clone());
        self.commit(&snapshot)?;
        info!(id = %record.id, origin = ?record.origin, requested_amount, "application created");
        self.publish(ChangeAction::Created, Some(&record.id));
        self.mirror_put(&record);
        Ok(record)
    }

    /// Sequences are never reused, even after deletion.
    fn next_id(&self, snapshot: &mut Snapshot) -> BursaryResult<ApplicationId> {
        let year = Utc::now().year();
        loop {
            let sequence = snapshot
                .application_counter
                .checked_add(1)
                .filter(|sequence| *sequence <= MAX_ID_SEQUENCE)
                .ok_or_else(|| {
                    BursaryError::validation("id", "application sequence exhausted")
                })?;
            snapshot.application_counter = sequence;
            let id =
                ApplicationId::compose(self.options.jurisdiction.as_str(), year, sequence);
            if snapshot.position(&id).is_none() {
                return Ok(id);
            }
        }
    }

    pub fn get(&self, id: &ApplicationId) -> BursaryResult<ApplicationRecord> {
        let snapshot = Snapshot::load(self.kv.as_ref())?;
        snapshot
            .records
            .into_iter()
            .find(|record| &record.id == id)
            .ok_or_else(|| BursaryError::NotFound(id.clone()))
    }

    pub fn update(
        &self,
        id: &ApplicationId,
        patch: ApplicationPatch,
    ) -> BursaryResult<ApplicationRecord> {
        let _guard = self.lock()?;
        let mut snapshot = self.load()?;
        let idx = snapshot
            .position(id)
            .ok_or_else(|| BursaryError::NotFound(id.clone()))?;

        let current = &snapshot.records[idx];
        if current.is_final_submission || current.status.is_terminal() {
            if let Some(field) = patch.locked_field() {
                return Err(BursaryError::ImmutableRecord {
                    id: id.clone(),
                    field,
                });
            }
        }

        let now = Utc::now();
        let mut next = current.clone();
        if let Some(amount) = patch.requested_amount {
            next.requested_amount = checked_amount("requested_amount", amount)?;
        }
        if patch.is_final_submission == Some(true) {
            next.is_final_submission = true;
        }
        if let Some(personal) = patch.personal {
            next.personal = personal.sanitized();
        }
        if let Some(location) = patch.location {
            next.location = location.sanitized();
        }
        if let Some(education) = patch.education {
            next.education = education.sanitized();
        }
        if let Some(financial) = patch.financial {
            next.financial = financial;
        }
        if let Some(family) = patch.family {
            next.family = family.sanitized();
        }
        next.updated_at = now;
        next.validate()?;
        snapshot.records[idx] = next;

        if let Some(update) = patch.status {
            apply_transition(&mut snapshot, idx, update.status, &update.metadata, now)?;
        }

        self.commit(&snapshot)?;
        let record = snapshot.records[idx].clone();
        debug!(id = %record.id, "application updated");
        self.publish(ChangeAction::Updated, Some(&record.id));
        self.mirror_put(&record);
        Ok(record)
    }

    pub fn transition_status(
        &self,
        id: &ApplicationId,
        new_status: ApplicationStatus,
        metadata: TransitionMetadata,
    ) -> BursaryResult<ApplicationRecord> {
        let _guard = self.lock()?;
        let mut snapshot = self.load()?;
        let idx = snapshot
            .position(id)
            .ok_or_else(|| BursaryError::NotFound(id.clone()))?;

        apply_transition(&mut snapshot, idx, new_status, &metadata, Utc::now())?;
        self.commit(&snapshot)?;

        let record = snapshot.records[idx].clone();
        self.publish(ChangeAction::Updated, Some(&record.id));
        self.mirror_put(&record);
        Ok(record)
    }

    /// Removes the record and refunds its award in the same commit.
    pub fn delete(&self, id: &ApplicationId) -> BursaryResult<ApplicationRecord> {
        let _guard = self.lock()?;
        let mut snapshot = self.load()?;
        let idx = snapshot
            .position(id)
            .ok_or_else(|| BursaryError::NotFound(id.clone()))?;

        let record = snapshot.records.remove(idx);
        let balance = refund_removed(&mut snapshot, std::slice::from_ref(&record));
        self.commit(&snapshot)?;

        info!(
            id = %record.id,
            refunded = record.awarded_amount().unwrap_or(0),
            allocated = balance.allocated,
            "application deleted"
        );
        self.publish(ChangeAction::Deleted, Some(&record.id));
        self.mirror_delete(&record.id);
        Ok(record)
    }

    pub fn list(&self, filter: RecordFilter) -> BursaryResult<RecordQuery> {
        let snapshot = Snapshot::load(self.kv.as_ref())?;
        Ok(RecordQuery {
            records: snapshot.records,
            filter,
        })
    }

    /// Drops every record with the given origin (seed or test data), refunding
    /// awarded ones. Returns the number removed.
    pub fn purge_origin(&self, origin: RecordOrigin) -> BursaryResult<usize> {
        let _guard = self.lock()?;
        let mut snapshot = self.load()?;
        let (removed, kept): (Vec<_>, Vec<_>) = snapshot
            .records
            .drain(..)
            .partition(|record| record.origin == origin);
        snapshot.records = kept;
        if removed.is_empty() {
            return Ok(0);
        }

        let balance = refund_removed(&mut snapshot, &removed);
        self.commit(&snapshot)?;
        info!(
            origin = ?origin,
            removed = removed.len(),
            allocated = balance.allocated,
            "applications purged"
        );
        self.publish(ChangeAction::Cleared, None);
        for record in &removed {
            self.mirror_delete(&record.id);
        }
        Ok(removed.len())
    }

    pub fn ledger_status(&self) -> BursaryResult<LedgerStatus> {
        let snapshot = self.load()?;
        Ok(current_ledger(&snapshot, &self.options).status(self.options.low_balance_percent))
    }

    /// Affordability check against the current balance; persists nothing.
    pub fn preview_allocation(&self, amount: u64) -> BursaryResult<LedgerBalance> {
        let snapshot = self.load()?;
        let mut ledger = current_ledger(&snapshot, &self.options);
        ledger.allocate(amount)
    }

    /// Persists a ledger re-derived from the stored records. Writes only the
    /// ledger keys, and only when they differ, so records written concurrently are
    /// never clobbered.
    pub fn reconcile(&self) -> BursaryResult<LedgerStatus> {
        let _guard = self.lock()?;
        let snapshot = Snapshot::load(self.kv.as_ref())?;
        let mut ledger = snapshot
            .ledger
            .unwrap_or_else(|| BudgetLedger::new(self.options.budget_total));
        ledger.reconcile(&snapshot.records);
        if snapshot.ledger != Some(ledger) {
            self.kv.set_many(&ledger_entries(&ledger))?;
            info!(
                previous = ?snapshot.ledger.map(|l| l.allocated()),
                allocated = ledger.allocated(),
                "ledger reconciled"
            );
        }
        Ok(ledger.status(self.options.low_balance_percent))
    }

    pub fn summary(&self) -> BursaryResult<ApplicationSummary> {
        let snapshot = self.load()?;
        let mut by_status = StatusCounts::default();
        for record in &snapshot.records {
            let slot = match record.status {
                ApplicationStatus::Draft => &mut by_status.draft,
                ApplicationStatus::PendingWardReview => &mut by_status.pending_ward_review,
                ApplicationStatus::PendingCommitteeReview => {
                    &mut by_status.pending_committee_review
                }
                ApplicationStatus::Awarded => &mut by_status.awarded,
                ApplicationStatus::Rejected => &mut by_status.rejected,
            };
            *slot += 1;
        }
        Ok(ApplicationSummary {
            total_applications: snapshot.records.len(),
            by_status,
            requested_total: snapshot
                .records
                .iter()
                .map(|record| record.requested_amount)
                .fold(0_u64, u64::saturating_add),
            awarded_total: awarded_total(&snapshot.records),
            ledger: current_ledger(&snapshot, &self.options)
                .status(self.options.low_balance_percent),
        })
    }
}

fn current_ledger(snapshot: &Snapshot, options: &StoreOptions) -> BudgetLedger {
    snapshot
        .ledger
        .unwrap_or_else(|| BudgetLedger::new(options.budget_total))
}

fn refund_removed(snapshot: &mut Snapshot, removed: &[ApplicationRecord]) -> LedgerBalance {
    let mut ledger = snapshot
        .ledger
        .unwrap_or_else(|| BudgetLedger::new(0));
    for record in removed {
        ledger.on_record_removed(record);
    }
    snapshot.ledger = Some(ledger);
    ledger.snapshot()
}

/// Applies one guarded status change to `snapshot.records[idx]` together with its
/// ledger effect. On error the snapshot is left exactly as it was.
fn apply_transition(
    snapshot: &mut Snapshot,
    idx: usize,
    new_status: ApplicationStatus,
    metadata: &TransitionMetadata,
    now: DateTime<Utc>,
) -> BursaryResult<()> {
    let before = &snapshot.records[idx];
    if !is_allowed_transition(metadata.actor, before.status, new_status) {
        return Err(BursaryError::InvalidTransition {
            id: before.id.clone(),
            from: before.status,
            to: new_status,
        });
    }

    let performed_by = metadata.performed_by.trim().to_string();
    let note = clamp_note(metadata.note.as_deref());
    let mut after = before.clone();
    let mut next_serial = snapshot.last_serial;
    after.status = new_status;
    match new_status {
        ApplicationStatus::Awarded => {
            let amount = metadata.awarded_amount.ok_or_else(|| {
                BursaryError::validation("awarded_amount", "required when awarding")
            })?;
            if amount == 0 {
                return Err(BursaryError::validation(
                    "awarded_amount",
                    "must be greater than zero",
                ));
            }
            next_serial += 1;
            after.award = Some(AwardMetadata {
                amount,
                serial_number: next_serial,
                awarded_at: now,
                awarded_by: performed_by,
                note: note.clone(),
            });
            after.rejection = None;
        }
        ApplicationStatus::Rejected => {
            after.award = None;
            after.rejection = Some(RejectionMetadata {
                reason: clamp_note(metadata.reason.as_deref())
                    .unwrap_or_else(|| DEFAULT_REJECTION_REASON.to_string()),
                rejected_at: now,
                rejected_by: performed_by,
            });
        }
        ApplicationStatus::PendingWardReview if before.status == ApplicationStatus::Draft => {
            after.is_final_submission = true;
        }
        _ => {
            after.award = None;
            after.rejection = None;
        }
    }
    after.status_history.push(StatusChange {
        from: before.status,
        to: new_status,
        actor: metadata.actor,
        at: now,
        note,
    });
    after.updated_at = now;
    after.validate()?;

    let mut ledger = snapshot
        .ledger
        .ok_or_else(|| BursaryError::validation("budget", "ledger is not initialized"))?;
    let balance = ledger.on_status_change(before, &after)?;

    info!(
        id = %after.id,
        from = %before.status,
        to = %new_status,
        awarded = after.awarded_amount().unwrap_or(0),
        allocated = balance.allocated,
        balance = balance.balance,
        "application status changed"
    );
    snapshot.ledger = Some(ledger);
    snapshot.last_serial = next_serial;
    snapshot.records[idx] = after;
    Ok(())
}
