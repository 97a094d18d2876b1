use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::record::ApplicationId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Created,
    Updated,
    Deleted,
    Cleared,
}

/// Published after every committed mutation. Delivery is at-least-once, so
/// subscribers must tolerate repeats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub collection_key: String,
    pub action: ChangeAction,
    pub id: Option<ApplicationId>,
}

pub type ChangeSubscriber = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

#[derive(Clone, Default)]
pub struct ChangeFeed {
    subscribers: Arc<Mutex<Vec<ChangeSubscriber>>>,
}

impl ChangeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, subscriber: ChangeSubscriber) {
        let mut guard = match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.push(subscriber);
    }

    pub fn publish(&self, event: &ChangeEvent) {
        let subscribers: Vec<ChangeSubscriber> = match self.subscribers.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        for subscriber in subscribers {
            subscriber(event);
        }
    }
}
