//! Bursary office core: application records, the award budget ledger and their
//! persistence. The desktop shell in `main.rs` is a thin command layer over this
//! crate.

pub mod admin;
pub mod auth;
pub mod config;
pub mod crypto;
pub mod error;
pub mod events;
pub mod export;
pub mod kv;
pub mod ledger;
pub mod mirror;
pub mod reconcile;
pub mod record;
pub mod snapshot;
pub mod status;
pub mod store;

pub use admin::AdminConsole;
pub use config::{BursaryConfig, ConfigError};
pub use error::{BursaryError, BursaryResult};
pub use events::{ChangeAction, ChangeEvent, ChangeFeed};
pub use kv::{FileStore, KeyValueStore, MemoryStore, StorageError};
pub use ledger::{BudgetLedger, LedgerBalance, LedgerStatus};
pub use reconcile::ReconcileWorker;
pub use record::{
    ApplicationDraft, ApplicationId, ApplicationPatch, ApplicationRecord, RecordOrigin,
    TransitionMetadata,
};
pub use status::{Actor, ApplicationStatus};
pub use store::{RecordFilter, RecordStore, StoreOptions};
