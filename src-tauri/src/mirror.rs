//! Best-effort mirroring of records into a document store.
//!
//! The local snapshot stays the source of truth. Mirror jobs run on a worker
//! thread; a failed job is logged and dropped, never rolled back locally.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use thiserror::Error;
use tracing::{debug, warn};

use crate::kv::{write_text_file, StorageError};

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("mirror write failed: {0}")]
    Storage(#[from] StorageError),
    #[error("mirror i/o failure on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("mirror encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

pub trait DocumentMirror: Send + Sync {
    fn put_document(
        &self,
        collection: &str,
        id: &str,
        document: &serde_json::Value,
    ) -> Result<(), MirrorError>;

    fn delete_document(&self, collection: &str, id: &str) -> Result<(), MirrorError>;
}

/// Stores each document as `<root>/<collection>/<id>.json`, with `/` in ids
/// replaced by `-`.
pub struct DirectoryMirror {
    root: PathBuf,
}

impl DirectoryMirror {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DirectoryMirror { root: root.into() }
    }

    pub fn document_path(&self, collection: &str, id: &str) -> PathBuf {
        self.root
            .join(sanitize_file_stem(collection))
            .join(format!("{}.json", sanitize_file_stem(id)))
    }
}

impl DocumentMirror for DirectoryMirror {
    fn put_document(
        &self,
        collection: &str,
        id: &str,
        document: &serde_json::Value,
    ) -> Result<(), MirrorError> {
        let content = serde_json::to_string_pretty(document)?;
        write_text_file(self.document_path(collection, id).as_path(), content.as_str())?;
        Ok(())
    }

    fn delete_document(&self, collection: &str, id: &str) -> Result<(), MirrorError> {
        let path = self.document_path(collection, id);
        if !path.exists() {
            return Ok(());
        }
        fs::remove_file(&path).map_err(|source| MirrorError::Io { path, source })
    }
}

pub(crate) fn sanitize_file_stem(value: &str) -> String {
    let mut out = String::new();
    for ch in value.chars() {
        if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
            out.push(ch);
        } else {
            out.push('-');
        }
    }
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        "document".to_string()
    } else {
        trimmed.to_string()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MirrorJob {
    Put {
        collection: String,
        id: String,
        document: serde_json::Value,
    },
    Delete {
        collection: String,
        id: String,
    },
}

fn run_job(mirror: &dyn DocumentMirror, job: &MirrorJob) {
    let (result, id) = match job {
        MirrorJob::Put {
            collection,
            id,
            document,
        } => (mirror.put_document(collection, id, document), id),
        MirrorJob::Delete { collection, id } => (mirror.delete_document(collection, id), id),
    };
    match result {
        Ok(()) => debug!(id = id.as_str(), "mirror job applied"),
        Err(err) => warn!(id = id.as_str(), %err, "mirror job failed; local snapshot unaffected"),
    }
}

/// Fire-and-forget handle. Dropping every clone stops the worker after it drains.
#[derive(Clone)]
pub struct MirrorHandle {
    sender: Sender<MirrorJob>,
}

impl MirrorHandle {
    pub fn submit(&self, job: MirrorJob) {
        if self.sender.send(job).is_err() {
            warn!("mirror worker stopped; job dropped");
        }
    }
}

pub struct MirrorWorker {
    handle: MirrorHandle,
    thread: Option<JoinHandle<()>>,
}

impl MirrorWorker {
    pub fn spawn(mirror: Arc<dyn DocumentMirror>) -> Self {
        let (sender, receiver) = mpsc::channel::<MirrorJob>();
        let thread = thread::Builder::new()
            .name("bursary-mirror".to_string())
            .spawn(move || {
                for job in receiver {
                    run_job(mirror.as_ref(), &job);
                }
            })
            .map_err(|err| warn!(%err, "failed to start mirror worker; mirroring disabled"))
            .ok();
        MirrorWorker {
            handle: MirrorHandle { sender },
            thread,
        }
    }

    pub fn handle(&self) -> MirrorHandle {
        self.handle.clone()
    }

    /// Waits for queued jobs. Outstanding [`MirrorHandle`] clones must be dropped
    /// first or this blocks until they are.
    pub fn shutdown(self) {
        let MirrorWorker { handle, thread } = self;
        drop(handle);
        if let Some(thread) = thread {
            if thread.join().is_err() {
                warn!("mirror worker panicked");
            }
        }
    }
}

pub fn directory_mirror(root: &Path) -> Arc<dyn DocumentMirror> {
    Arc::new(DirectoryMirror::new(root))
}
