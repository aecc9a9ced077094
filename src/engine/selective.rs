//! Selective-update path: extract only the entries a layer actually
//! needs.
//!
//! Partial ranged reads are cheaper than re-downloading a whole archive
//! when only a handful of its entries changed, so this extracts entries
//! directly via the `RemoteZip` reader instead. Bounded-retry wrappers
//! around `RemoteZip::open`/
//! `extract` live here; the FileDB read/write reconciliation they feed
//! stays on the orchestrator task in `engine.rs`.

use std::path::Path;

use crate::pool::NetLimiter;
use crate::remotezip::{Entry, RemoteZip, RemoteZipErr};

pub(crate) const REMOTE_ZIP_OPEN_RETRIES: u32 = 5;
pub(crate) const EXTRACT_RETRIES: u32 = 15;

pub(crate) async fn open_with_retry(client: reqwest::Client, limiter: NetLimiter, url: &str, attempts: u32)
		-> Result<RemoteZip, RemoteZipErr>
{
	let mut last_err = None;
	for attempt in 1..=attempts {
		match RemoteZip::open(client.clone(), limiter.clone(), url).await {
			Ok(rz) => return Ok(rz),
			Err(e) if e.is_retryable() => {
				tracing::warn!(url, attempt, attempts, error = %e, "remote-zip open attempt failed");
				last_err = Some(e);
			},
			Err(e) => return Err(e),
		}
	}
	Err(last_err.expect("attempts > 0"))
}

pub(crate) async fn extract_with_retry(remote: &RemoteZip, entry: &Entry, dest_root: &Path, attempts: u32)
		-> Result<(), RemoteZipErr>
{
	let mut last_err = None;
	for attempt in 1..=attempts {
		match remote.extract(entry, dest_root).await {
			Ok(()) => return Ok(()),
			Err(e) if e.is_retryable() => {
				tracing::warn!(name = %entry.name, attempt, attempts, error = %e, "entry extract attempt failed");
				last_err = Some(e);
			},
			Err(e) => return Err(e),
		}
	}
	Err(last_err.expect("attempts > 0"))
}

/// Whether `path` is itself a symlink (not whether it points at one).
/// An extraction must never follow or overwrite a symlink left in the
/// install tree.
pub(crate) fn is_symlink(path: &Path) -> bool
{
	std::fs::symlink_metadata(path).map(|m| m.file_type().is_symlink()).unwrap_or(false)
}
