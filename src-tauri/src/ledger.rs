//! Budget ledger: the shared total / allocated / balance aggregate.
//!
//! `allocated` is a cache of the sum of award amounts over awarded records.
//! [`BudgetLedger::reconcile`] is the authoritative definition; every other
//! operation is an incremental shortcut that must agree with it.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{BursaryError, BursaryResult};
use crate::record::ApplicationRecord;

pub const DEFAULT_LOW_BALANCE_PERCENT: u8 = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetLedger {
    total: u64,
    allocated: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerBalance {
    pub allocated: u64,
    pub balance: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LedgerStatus {
    pub total: u64,
    pub allocated: u64,
    pub balance: u64,
    pub percentage_used: f64,
    pub is_low: bool,
    pub is_exhausted: bool,
}

pub fn awarded_total<'a>(records: impl IntoIterator<Item = &'a ApplicationRecord>) -> u64 {
    records
        .into_iter()
        .filter_map(ApplicationRecord::awarded_amount)
        .fold(0_u64, u64::saturating_add)
}

impl BudgetLedger {
    pub fn new(total: u64) -> Self {
        BudgetLedger {
            total,
            allocated: 0,
        }
    }

    pub(crate) fn from_parts(total: u64, allocated: u64) -> Self {
        BudgetLedger { total, allocated }
    }

    /// Keeps existing state untouched; otherwise starts at `total` and catches up
    /// with any awards already on record.
    pub fn initialize<'a>(
        existing: Option<BudgetLedger>,
        total: u64,
        records: impl IntoIterator<Item = &'a ApplicationRecord>,
    ) -> BudgetLedger {
        if let Some(ledger) = existing {
            return ledger;
        }
        let mut ledger = BudgetLedger::new(total);
        ledger.reconcile(records);
        ledger
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn allocated(&self) -> u64 {
        self.allocated
    }

    /// Saturates at zero when awards exceed the total (possible after an external
    /// writer lowers the total or imports awards).
    pub fn balance(&self) -> u64 {
        self.total.saturating_sub(self.allocated)
    }

    pub fn snapshot(&self) -> LedgerBalance {
        LedgerBalance {
            allocated: self.allocated,
            balance: self.balance(),
        }
    }

    pub fn allocate(&mut self, amount: u64) -> BursaryResult<LedgerBalance> {
        let next = self
            .allocated
            .checked_add(amount)
            .filter(|next| *next <= self.total)
            .ok_or(BursaryError::InsufficientBudget {
                requested: amount,
                available: self.balance(),
            })?;
        self.allocated = next;
        debug!(amount, allocated = self.allocated, "budget allocated");
        Ok(self.snapshot())
    }

    pub fn refund(&mut self, amount: u64) -> LedgerBalance {
        if amount > self.allocated {
            warn!(
                amount,
                allocated = self.allocated,
                "refund exceeds allocation; clamping to zero"
            );
        }
        self.allocated = self.allocated.saturating_sub(amount);
        debug!(amount, allocated = self.allocated, "budget refunded");
        self.snapshot()
    }

    pub fn reconcile<'a>(
        &mut self,
        records: impl IntoIterator<Item = &'a ApplicationRecord>,
    ) -> LedgerBalance {
        let derived = awarded_total(records);
        if derived != self.allocated {
            debug!(
                cached = self.allocated,
                derived, "ledger allocation re-derived from records"
            );
        }
        self.allocated = derived;
        self.snapshot()
    }

    pub fn status(&self, low_balance_percent: u8) -> LedgerStatus {
        let percentage_used = if self.total == 0 {
            100.0
        } else {
            (self.allocated as f64 / self.total as f64) * 100.0
        };
        LedgerStatus {
            total: self.total,
            allocated: self.allocated,
            balance: self.balance(),
            percentage_used,
            is_low: percentage_used >= f64::from(low_balance_percent),
            is_exhausted: self.balance() == 0,
        }
    }

    /// Ledger side of a status transition. On error `self` is unchanged.
    pub fn on_status_change(
        &mut self,
        before: &ApplicationRecord,
        after: &ApplicationRecord,
    ) -> BursaryResult<LedgerBalance> {
        let mut next = *self;
        if let Some(previous) = before.awarded_amount() {
            next.refund(previous);
        }
        if let Some(amount) = after.awarded_amount() {
            next.allocate(amount)?;
        }
        *self = next;
        Ok(self.snapshot())
    }

    pub fn on_record_removed(&mut self, record: &ApplicationRecord) -> LedgerBalance {
        match record.awarded_amount() {
            Some(amount) => self.refund(amount),
            None => self.snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::record::{ApplicationId, AwardMetadata, PersonalDetails};
    use crate::status::ApplicationStatus;

    fn record(seq: u64, status: ApplicationStatus, award: Option<u64>) -> ApplicationRecord {
        let now = Utc::now();
        ApplicationRecord {
            id: ApplicationId::compose("KIB", 2026, seq),
            status,
            origin: Default::default(),
            requested_amount: award.unwrap_or(1_000),
            is_final_submission: true,
            personal: PersonalDetails {
                full_name: "Test Applicant".to_string(),
                id_number: format!("ID{seq}"),
                ..PersonalDetails::default()
            },
            location: Default::default(),
            education: Default::default(),
            financial: Default::default(),
            family: Default::default(),
            award: award.map(|amount| AwardMetadata {
                amount,
                serial_number: seq,
                awarded_at: now,
                awarded_by: "admin".to_string(),
                note: None,
            }),
            rejection: None,
            status_history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn allocate_beyond_total_leaves_state_unchanged() {
        let mut ledger = BudgetLedger::new(100);
        ledger.allocate(60).expect("fits");
        let err = ledger.allocate(41).unwrap_err();
        assert!(matches!(
            err,
            BursaryError::InsufficientBudget {
                requested: 41,
                available: 40
            }
        ));
        assert_eq!(ledger.allocated(), 60);
        assert_eq!(ledger.allocate(40).expect("exact fit").balance, 0);
    }

    #[test]
    fn refund_clamps_at_zero() {
        let mut ledger = BudgetLedger::new(100);
        ledger.allocate(10).expect("fits");
        let after = ledger.refund(25);
        assert_eq!(after.allocated, 0);
        assert_eq!(after.balance, 100);
    }

    #[test]
    fn reconcile_sums_only_awarded_records() {
        let records = vec![
            record(1, ApplicationStatus::Awarded, Some(300)),
            record(2, ApplicationStatus::Rejected, None),
            record(3, ApplicationStatus::Awarded, Some(200)),
            record(4, ApplicationStatus::PendingCommitteeReview, None),
        ];
        let mut ledger = BudgetLedger::from_parts(10_000, 9_999);
        assert_eq!(ledger.reconcile(&records).allocated, 500);
        assert_eq!(ledger.reconcile(&records).allocated, 500);
    }

    #[test]
    fn initialize_keeps_existing_total() {
        let existing = BudgetLedger::from_parts(500, 100);
        let ledger = BudgetLedger::initialize(Some(existing), 9_000, std::iter::empty());
        assert_eq!(ledger, existing);

        let records = vec![record(1, ApplicationStatus::Awarded, Some(250))];
        let fresh = BudgetLedger::initialize(None, 9_000, &records);
        assert_eq!(fresh.total(), 9_000);
        assert_eq!(fresh.allocated(), 250);
    }

    #[test]
    fn status_flags_low_and_exhausted() {
        let mut ledger = BudgetLedger::new(1_000);
        ledger.allocate(799).expect("fits");
        assert!(!ledger.status(80).is_low);
        ledger.allocate(1).expect("fits");
        let status = ledger.status(80);
        assert!(status.is_low);
        assert!(!status.is_exhausted);
        ledger.allocate(200).expect("fits");
        assert!(ledger.status(80).is_exhausted);
        assert!((ledger.status(80).percentage_used - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn failed_reaward_restores_previous_allocation() {
        let mut ledger = BudgetLedger::new(1_000);
        ledger.allocate(400).expect("fits");
        let before = record(1, ApplicationStatus::Awarded, Some(400));
        let after = record(1, ApplicationStatus::Awarded, Some(1_200));
        assert!(ledger.on_status_change(&before, &after).is_err());
        assert_eq!(ledger.allocated(), 400);

        let after = record(1, ApplicationStatus::Awarded, Some(900));
        assert_eq!(ledger.on_status_change(&before, &after).expect("re-award").allocated, 900);
    }

    #[test]
    fn reversal_and_removal_refund() {
        let mut ledger = BudgetLedger::new(1_000);
        let pending = record(1, ApplicationStatus::PendingCommitteeReview, None);
        let awarded = record(1, ApplicationStatus::Awarded, Some(300));
        ledger.on_status_change(&pending, &awarded).expect("award");
        assert_eq!(ledger.allocated(), 300);
        ledger.on_status_change(&awarded, &pending).expect("reverse");
        assert_eq!(ledger.allocated(), 0);

        ledger.on_status_change(&pending, &awarded).expect("award again");
        assert_eq!(ledger.on_record_removed(&awarded).allocated, 0);
    }
}
