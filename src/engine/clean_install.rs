//! Clean-install path: download a layer's whole archive and extract it.
//!
//! Downloads a layer URL's whole archive to a temp file (retried up to
//! `DOWNLOAD_RETRIES` times, the temp file unlinked between attempts by
//! simply not keeping the previous `NamedTempFile` around), then hands the
//! bytes to `remotezip`'s in-memory parser/extractor off the request
//! pipeline via `spawn_blocking`.

use std::io::Write as _;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::filedb::{file_mtime, TrackedFile};
use crate::pool::NetLimiter;
use crate::remotezip::{extract_entry_from_bytes, parse_archive_bytes, RemoteZipErr};

pub(crate) const DOWNLOAD_RETRIES: u32 = 5;

#[derive(Debug, Error)]
pub(crate) enum CleanInstallErr
{
	#[error("network error: {0}")]
	Network(#[from] reqwest::Error),

	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("archive error: {0}")]
	Archive(#[from] RemoteZipErr),

	#[error("extraction task panicked: {0}")]
	Join(String),
}

pub(crate) async fn download_and_extract(client: &reqwest::Client, limiter: &NetLimiter,
		url: &str, layer: &str, install_dir: &Path) -> Result<Vec<TrackedFile>, CleanInstallErr>
{
	let bytes = download_with_retry(client, limiter, url, DOWNLOAD_RETRIES).await?;

	let install_dir = install_dir.to_path_buf();
	let layer = layer.to_string();
	tokio::task::spawn_blocking(move || extract_all(&bytes, &layer, &install_dir))
		.await
		.map_err(|e| CleanInstallErr::Join(e.to_string()))?
}

fn extract_all(bytes: &[u8], layer: &str, install_dir: &Path)
		-> Result<Vec<TrackedFile>, CleanInstallErr>
{
	let entries = parse_archive_bytes(bytes)?;
	let mut rows = Vec::with_capacity(entries.len());
	for entry in &entries {
		if entry.is_dir() { continue; }
		extract_entry_from_bytes(bytes, entry, install_dir)?;
		let dest = install_dir.join(&entry.name);
		let mtime = file_mtime(&dest)?;
		rows.push(TrackedFile { path: entry.name.clone(), crc: entry.crc32, updated: mtime, layer: layer.to_string() });
	}
	Ok(rows)
}

/// Download the whole archive to a fresh temp file, retrying up to
/// `attempts` times; each failed attempt's temp file is dropped (and so
/// unlinked) before the next attempt starts.
async fn download_with_retry(client: &reqwest::Client, limiter: &NetLimiter, url: &str, attempts: u32)
		-> Result<Vec<u8>, CleanInstallErr>
{
	let mut last_err = None;
	for attempt in 1..=attempts {
		match download_once(client, limiter, url).await {
			Ok(bytes) => return Ok(bytes),
			Err(e) => {
				tracing::warn!(url, attempt, attempts, error = %e, "download attempt failed");
				last_err = Some(e);
			},
		}
	}
	Err(last_err.expect("attempts > 0"))
}

async fn download_once(client: &reqwest::Client, limiter: &NetLimiter, url: &str)
		-> Result<Vec<u8>, CleanInstallErr>
{
	let _permit = limiter.acquire().await;
	let resp = client.get(url).send().await?.error_for_status()?;
	let body = resp.bytes().await?;
	drop(_permit);

	// Round-trip through a temp file named by the URL's last path
	// segment, even though we immediately read it back — this is also
	// where a real implementation would switch to a streamed write for
	// very large archives.
	let mut tmp = tempfile::Builder::new()
		.prefix(&temp_prefix(url))
		.tempfile()?;
	tmp.write_all(&body)?;
	let path: PathBuf = tmp.path().to_path_buf();
	let bytes = std::fs::read(&path)?;
	Ok(bytes)
}

fn temp_prefix(url: &str) -> String
{
	url.rsplit('/').next().filter(|s| !s.is_empty()).unwrap_or("archive").to_string()
}
