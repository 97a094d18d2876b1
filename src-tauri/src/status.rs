use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum ApplicationStatus {
    #[default]
    Draft,
    PendingWardReview,
    PendingCommitteeReview,
    Awarded,
    Rejected,
}

impl ApplicationStatus {
    pub const ALL: [ApplicationStatus; 5] = [
        ApplicationStatus::Draft,
        ApplicationStatus::PendingWardReview,
        ApplicationStatus::PendingCommitteeReview,
        ApplicationStatus::Awarded,
        ApplicationStatus::Rejected,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ApplicationStatus::Draft => "Draft",
            ApplicationStatus::PendingWardReview => "PendingWardReview",
            ApplicationStatus::PendingCommitteeReview => "PendingCommitteeReview",
            ApplicationStatus::Awarded => "Awarded",
            ApplicationStatus::Rejected => "Rejected",
        }
    }

    /// Awarded and Rejected close a record to ordinary edits.
    pub fn is_terminal(self) -> bool {
        matches!(self, ApplicationStatus::Awarded | ApplicationStatus::Rejected)
    }
}

impl fmt::Display for ApplicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Actor {
    Applicant,
    Administrator,
}

/// Transitions an applicant may request on their own record.
fn is_applicant_transition(from: ApplicationStatus, to: ApplicationStatus) -> bool {
    matches!(
        (from, to),
        (ApplicationStatus::Draft, ApplicationStatus::PendingWardReview)
    )
}

/// `Awarded -> Awarded` is an explicit re-award with a new amount.
pub fn is_allowed_transition(actor: Actor, from: ApplicationStatus, to: ApplicationStatus) -> bool {
    use ApplicationStatus::*;

    if is_applicant_transition(from, to) {
        return true;
    }
    if actor != Actor::Administrator {
        return false;
    }
    matches!(
        (from, to),
        (PendingWardReview, PendingCommitteeReview)
            | (PendingCommitteeReview, Awarded)
            | (PendingCommitteeReview, Rejected)
            | (Awarded, PendingCommitteeReview)
            | (Rejected, PendingCommitteeReview)
            | (Draft, Rejected)
            | (PendingWardReview, Rejected)
            | (Awarded, Awarded)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::ApplicationStatus::*;

    #[test]
    fn forward_path_is_allowed_for_administrators() {
        let admin = Actor::Administrator;
        assert!(is_allowed_transition(admin, Draft, PendingWardReview));
        assert!(is_allowed_transition(admin, PendingWardReview, PendingCommitteeReview));
        assert!(is_allowed_transition(admin, PendingCommitteeReview, Awarded));
        assert!(is_allowed_transition(admin, PendingCommitteeReview, Rejected));
    }

    #[test]
    fn skipping_review_to_award_is_refused() {
        assert!(!is_allowed_transition(Actor::Administrator, Draft, Awarded));
        assert!(!is_allowed_transition(Actor::Administrator, PendingWardReview, Awarded));
    }

    #[test]
    fn reversal_returns_to_committee_review_only() {
        let admin = Actor::Administrator;
        assert!(is_allowed_transition(admin, Awarded, PendingCommitteeReview));
        assert!(is_allowed_transition(admin, Rejected, PendingCommitteeReview));
        assert!(!is_allowed_transition(admin, Awarded, Draft));
        assert!(!is_allowed_transition(admin, Rejected, Awarded));
        assert!(!is_allowed_transition(admin, Awarded, Rejected));
    }

    #[test]
    fn direct_rejection_from_any_open_state() {
        for from in [Draft, PendingWardReview, PendingCommitteeReview] {
            assert!(is_allowed_transition(Actor::Administrator, from, Rejected));
        }
        assert!(!is_allowed_transition(Actor::Administrator, Rejected, Rejected));
    }

    #[test]
    fn applicants_can_only_submit() {
        assert!(is_allowed_transition(Actor::Applicant, Draft, PendingWardReview));
        for from in ApplicationStatus::ALL {
            for to in ApplicationStatus::ALL {
                if (from, to) == (Draft, PendingWardReview) {
                    continue;
                }
                assert!(!is_allowed_transition(Actor::Applicant, from, to), "{from} -> {to}");
            }
        }
    }
}
