//! Async facade over the blocking API.
//!
//! Every call runs on tokio's blocking thread pool through
//! [`spawn_blocking`](tokio::task::spawn_blocking).

use std::path::Path;

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::{self, JoinError};

use crate::error::{ErrorKind, RarError, Result};
use crate::session::{self, EntryInfo, ExtractSummary, Progress};

impl From<JoinError> for RarError {
    fn from(err: JoinError) -> Self {
        let kind = if err.is_cancelled() {
            ErrorKind::Cancelled
        } else {
            ErrorKind::Unknown
        };
        RarError::new(kind, format!("blocking task failed: {err}"))
    }
}

/// List an archive file.
pub async fn list_archive(path: impl AsRef<Path>, password: Option<String>) -> Result<Vec<EntryInfo>> {
    let path = path.as_ref().to_owned();
    task::spawn_blocking(move || session::list_archive(&path, password.as_deref())?.collect())
        .await?
}

/// Extract an archive file, optionally streaming progress events.
pub async fn extract_archive(
    path: impl AsRef<Path>,
    destination: impl AsRef<Path>,
    password: Option<String>,
    progress: Option<UnboundedSender<Progress>>,
) -> Result<ExtractSummary> {
    let path = path.as_ref().to_owned();
    let destination = destination.as_ref().to_owned();
    task::spawn_blocking(move || {
        let mut forward = |event: Progress| {
            if let Some(tx) = &progress {
                let _ = tx.send(event);
            }
        };
        session::extract_archive(&path, &destination, password.as_deref(), Some(&mut forward))
    })
    .await?
}
