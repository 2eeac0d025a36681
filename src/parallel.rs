//! Multi-threaded extraction.
//!
//! Entries are split into independent groups: every entry starts a group,
//! except solid continuations, which join the group before them. Groups
//! run on the rayon pool; inside a group entries are extracted in order
//! so the decoder state can be carried from one to the next.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::Sender;
use rayon::prelude::*;
use tracing::{info, warn};

use crate::archive::Archive;
use crate::error::Result;
use crate::file_media::FileMedia;
use crate::session::{
    extract_entry, EntryFailure, EntrySink, ExtractOptions, ExtractSummary, FsSink, Progress,
    WriteOutcome,
};

type EntryResult = (usize, Result<(PathBuf, WriteOutcome)>);

/// Extract to the file system using all rayon worker threads.
///
/// The summary lists entries in archive order, like [`extract`]. Progress
/// events arrive in completion order; a dropped receiver is ignored.
///
/// [`extract`]: crate::session::extract
pub fn extract_parallel(
    media: Arc<dyn FileMedia>,
    destination_root: &Path,
    options: &ExtractOptions,
    progress: Option<Sender<Progress>>,
) -> Result<ExtractSummary> {
    let report = |event: Progress| {
        if let Some(tx) = &progress {
            let _ = tx.send(event);
        }
    };

    let archive = Archive::open(media, options.password.as_deref())?;
    let sink = FsSink::new(options);
    sink.clone().create_dir(destination_root)?;
    report(Progress::Started {
        total_entries: archive.entries().len(),
    });

    let groups = independent_groups(&archive);
    info!(
        entries = archive.entries().len(),
        groups = groups.len(),
        threads = rayon::current_num_threads(),
        "parallel extraction"
    );

    let aborted = AtomicBool::new(false);
    let mut results: Vec<EntryResult> = groups
        .into_par_iter()
        .flat_map_iter(|group| {
            let mut sink = sink.clone();
            let mut carry = None;
            let mut done = Vec::with_capacity(group.len());
            for index in group {
                if options.is_cancelled() || aborted.load(Ordering::Relaxed) {
                    break;
                }
                let path = archive.entries()[index].path();
                report(Progress::EntryStarted {
                    index,
                    path: path.clone(),
                });
                let result = extract_entry(
                    &archive,
                    index,
                    destination_root,
                    options,
                    &mut sink,
                    &mut carry,
                );
                match &result {
                    Ok((_, WriteOutcome::Written { bytes })) => report(Progress::EntryFinished {
                        index,
                        path,
                        bytes: *bytes,
                    }),
                    Ok((_, WriteOutcome::Skipped)) => {
                        report(Progress::EntrySkipped { index, path });
                    }
                    Err(error) => {
                        warn!(index, path = %path, kind = ?error.kind(), %error, "entry failed");
                        if options.abort_on_first_failure {
                            aborted.store(true, Ordering::Relaxed);
                        }
                        report(Progress::EntryFailed {
                            index,
                            path,
                            kind: error.kind(),
                        });
                    }
                }
                done.push((index, result));
            }
            done
        })
        .collect();
    results.sort_by_key(|(index, _)| *index);

    let mut summary = ExtractSummary::default();
    for (index, result) in results {
        match result {
            Ok((target, WriteOutcome::Written { .. })) => summary.succeeded.push(target),
            Ok((target, WriteOutcome::Skipped)) => summary.skipped.push(target),
            Err(error) => {
                if options.abort_on_first_failure {
                    return Err(error);
                }
                summary.failed.push(EntryFailure {
                    path: archive.entries()[index].path(),
                    kind: error.kind(),
                    error,
                });
            }
        }
    }
    if options.is_cancelled() {
        info!("extraction cancelled");
    }

    info!(
        succeeded = summary.succeeded.len(),
        failed = summary.failed.len(),
        skipped = summary.skipped.len(),
        "extraction finished"
    );
    report(Progress::Finished {
        succeeded: summary.succeeded.len(),
        failed: summary.failed.len(),
    });
    Ok(summary)
}

/// Entry indices grouped so that no group depends on another.
fn independent_groups(archive: &Archive) -> Vec<Vec<usize>> {
    let mut groups: Vec<Vec<usize>> = Vec::new();
    for index in 0..archive.entries().len() {
        match groups.last_mut() {
            Some(group) if archive.is_solid_continuation(index) => group.push(index),
            _ => groups.push(vec![index]),
        }
    }
    groups
}
