use std::sync::Arc;

use bursary::record::{PersonalDetails, StatusUpdate};
use bursary::{
    AdminConsole, ApplicationDraft, ApplicationId, ApplicationPatch, ApplicationStatus,
    BursaryError, MemoryStore, RecordFilter, RecordStore, StoreOptions, TransitionMetadata,
};

fn open(total: u64) -> Arc<RecordStore> {
    let store = RecordStore::open(
        Arc::new(MemoryStore::new()),
        StoreOptions {
            jurisdiction: "KIB".to_string(),
            budget_total: total,
            low_balance_percent: 80,
        },
    )
    .expect("open store");
    Arc::new(store)
}

fn submit(store: &RecordStore, name: &str, requested: i64) -> ApplicationId {
    let record = store
        .create(ApplicationDraft {
            requested_amount: requested,
            personal: PersonalDetails {
                full_name: name.to_string(),
                id_number: format!("ID-{name}"),
                ..PersonalDetails::default()
            },
            ..ApplicationDraft::default()
        })
        .expect("create");
    store
        .transition_status(
            &record.id,
            ApplicationStatus::PendingWardReview,
            TransitionMetadata::applicant(),
        )
        .expect("submit");
    store
        .transition_status(
            &record.id,
            ApplicationStatus::PendingCommitteeReview,
            TransitionMetadata::administrator("ward officer"),
        )
        .expect("ward review");
    record.id
}

#[test]
fn fifty_million_budget_walkthrough() {
    let store = open(50_000_000);
    let admin = AdminConsole::new(Arc::clone(&store), "committee chair");
    let a = submit(&store, "A", 30_000);
    let b = submit(&store, "B", 20_000_000);
    let c = submit(&store, "C", 30_000_000);

    admin
        .transition_status(&a, ApplicationStatus::Awarded, TransitionMetadata::administrator("").with_award(30_000))
        .expect("award A");
    assert_eq!(admin.ledger_status().expect("status").balance, 49_970_000);

    admin
        .transition_status(&b, ApplicationStatus::Awarded, TransitionMetadata::administrator("").with_award(20_000_000))
        .expect("award B");
    assert_eq!(admin.ledger_status().expect("status").balance, 29_970_000);

    let err = admin
        .transition_status(&c, ApplicationStatus::Awarded, TransitionMetadata::administrator("").with_award(30_000_000))
        .unwrap_err();
    assert!(matches!(
        err,
        BursaryError::InsufficientBudget {
            requested: 30_000_000,
            available: 29_970_000
        }
    ));
    assert_eq!(
        store.get(&c).expect("get C").status,
        ApplicationStatus::PendingCommitteeReview
    );
    assert_eq!(admin.ledger_status().expect("status").balance, 29_970_000);

    admin.delete_record(&a).expect("delete A");
    let status = admin.ledger_status().expect("status");
    assert_eq!(status.allocated, 20_000_000);
    assert_eq!(status.balance, 30_000_000);
    assert_eq!(status.percentage_used, 40.0);
    assert!(!status.is_low);
}

#[test]
fn draft_cannot_jump_to_awarded() {
    let store = open(1_000);
    let admin = AdminConsole::new(Arc::clone(&store), "chair");
    let record = admin
        .create_record(ApplicationDraft {
            requested_amount: 100,
            personal: PersonalDetails {
                full_name: "Amina".to_string(),
                id_number: "1".to_string(),
                ..PersonalDetails::default()
            },
            ..ApplicationDraft::default()
        })
        .expect("create");

    let err = admin
        .transition_status(
            &record.id,
            ApplicationStatus::Awarded,
            TransitionMetadata::administrator("chair").with_award(100),
        )
        .unwrap_err();
    assert!(matches!(
        err,
        BursaryError::InvalidTransition {
            from: ApplicationStatus::Draft,
            to: ApplicationStatus::Awarded,
            ..
        }
    ));
    assert_eq!(admin.ledger_status().expect("status").allocated, 0);
}

#[test]
fn applicants_cannot_review_their_own_application() {
    let store = open(1_000);
    let id = submit(&store, "Amina", 100);
    let err = store
        .transition_status(
            &id,
            ApplicationStatus::Awarded,
            TransitionMetadata::applicant().with_award(100),
        )
        .unwrap_err();
    assert!(matches!(err, BursaryError::InvalidTransition { .. }));
}

#[test]
fn final_submission_rejects_every_protected_field() {
    let store = open(1_000);
    let id = submit(&store, "Amina", 100);
    let patches = [
        ApplicationPatch {
            requested_amount: Some(5),
            ..ApplicationPatch::default()
        },
        ApplicationPatch {
            is_final_submission: Some(false),
            ..ApplicationPatch::default()
        },
        ApplicationPatch {
            personal: Some(PersonalDetails::default()),
            ..ApplicationPatch::default()
        },
    ];
    let before = store.get(&id).expect("get");
    for patch in patches {
        assert!(matches!(
            store.update(&id, patch),
            Err(BursaryError::ImmutableRecord { .. })
        ));
    }
    assert_eq!(store.get(&id).expect("get"), before);
}

#[test]
fn award_then_reverse_restores_the_ledger() {
    let store = open(10_000);
    let admin = AdminConsole::new(Arc::clone(&store), "chair");
    let id = submit(&store, "Amina", 100);
    let before = admin.ledger_status().expect("status");

    admin
        .transition_status(&id, ApplicationStatus::Awarded, TransitionMetadata::administrator("chair").with_award(2_500))
        .expect("award");
    admin
        .transition_status(&id, ApplicationStatus::PendingCommitteeReview, TransitionMetadata::administrator("chair"))
        .expect("reverse");
    assert_eq!(admin.ledger_status().expect("status"), before);

    admin
        .transition_status(&id, ApplicationStatus::Awarded, TransitionMetadata::administrator("chair").with_award(2_500))
        .expect("award again");
    admin
        .transition_status(&id, ApplicationStatus::Awarded, TransitionMetadata::administrator("chair").with_award(4_000))
        .expect("re-award");
    assert_eq!(admin.ledger_status().expect("status").allocated, 4_000);

    let err = admin
        .transition_status(&id, ApplicationStatus::Awarded, TransitionMetadata::administrator("chair").with_award(20_000))
        .unwrap_err();
    assert!(matches!(err, BursaryError::InsufficientBudget { .. }));
    assert_eq!(admin.ledger_status().expect("status").allocated, 4_000);
    assert_eq!(store.get(&id).expect("get").awarded_amount(), Some(4_000));
}

#[test]
fn admin_patch_status_is_attributed_to_the_operator() {
    let store = open(10_000);
    let admin = AdminConsole::new(Arc::clone(&store), "chair");
    let id = submit(&store, "Amina", 100);
    let record = admin
        .update_record(
            &id,
            ApplicationPatch {
                status: Some(StatusUpdate {
                    status: ApplicationStatus::Awarded,
                    metadata: TransitionMetadata::applicant().with_award(300),
                }),
                ..ApplicationPatch::default()
            },
        )
        .expect("award through patch");
    let award = record.award.expect("award");
    assert_eq!(award.awarded_by, "chair");
    assert_eq!(award.amount, 300);
    assert_eq!(
        admin
            .list_records(RecordFilter::status(ApplicationStatus::Awarded))
            .expect("list")
            .len(),
        1
    );
}
