//! The update engine: the core orchestrator.
//!
//! Implements the `update(force, ignore_self_update)` algorithm:
//! self-update check, `FileDB.index_files`, clean-install-or-selective
//! decision, per-layer sequential processing with concurrent per-URL
//! tasks, reclaim-deletion, and completion notification. There is no
//! archive-reconciliation pipeline to imitate call-for-call here, but
//! the "run one pool of tasks, bail on a hard failure, move to the next
//! step" shape is the same one a synchronous fetch/hashcheck worker pool
//! would use, generalized to `tokio::task::JoinSet`.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::filedb::{file_mtime, FileDb, FileDbErr, TrackedFile};
use crate::frontend::Frontend;
use crate::manifest::LoadOutcome;
use crate::pool::NetLimiter;
use crate::remotezip::RemoteZipErr;
use crate::selfupdate::{self, SelfUpdateErr};

mod clean_install;
mod selective;

#[derive(Debug, Error)]
pub enum DownloadErr
{
	#[error("network error: {0}")]
	Network(#[from] reqwest::Error),

	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum EngineErr
{
	#[error("file store error: {0}")]
	FileDb(#[from] FileDbErr),

	#[error(transparent)]
	SelfUpdate(#[from] SelfUpdateErr),

	#[error("branch '{0}' is not defined in the manifest")]
	BranchUnknown(String),

	#[error("layer '{0}' is not defined in the manifest")]
	LayerUnknown(String),

	#[error("layer '{0}' has no archive URLs")]
	LayerEmpty(String),

	#[error("downloading {url} failed after {attempts} attempts: {source}")]
	TransientNetwork { url: String, attempts: u32, #[source] source: DownloadErr },

	#[error("archive error for {url}: {source}")]
	Archive { url: String, #[source] source: RemoteZipErr },

	#[error("a background task panicked: {0}")]
	TaskPanicked(String),

	#[error("filesystem error: {0}")]
	Filesystem(#[from] std::io::Error),
}

/// Ties `FileDb`, a shared `reqwest::Client`/`NetLimiter`, and a
/// `Frontend` together into one runnable update. Owns the single
/// `FileDb` connection; every FileDB read/write in `update()` happens
/// on this orchestrating task, never inside a spawned worker.
pub struct Engine
{
	client: reqwest::Client,
	limiter: NetLimiter,
	db: FileDb,
	install_dir: PathBuf,
	frontend: Arc<dyn Frontend>,
}

enum Claim { New, Overwrite }

impl Engine
{
	pub fn new(client: reqwest::Client, db: FileDb, install_dir: PathBuf, frontend: Arc<dyn Frontend>) -> Self
	{
		Self { client, limiter: NetLimiter::default(), db, install_dir, frontend }
	}

	/// Run one full update pass against an already-loaded manifest: resolve
	/// the branch, skip layers that haven't changed since their last run,
	/// clean-install or selectively patch the rest, then reclaim any
	/// tracked file no layer claimed this pass.
	#[tracing::instrument(skip(self, outcome))]
	pub async fn update(&mut self, outcome: &LoadOutcome, branch: &str, force: bool, ignore_self_update: bool)
			-> Result<(), EngineErr>
	{
		let manifest = outcome.manifest();

		selfupdate::check(manifest, ignore_self_update)?;
		tracing::debug!("self-update check passed (or skipped)");

		let idx = self.db.index_files(&self.install_dir)?;
		let tracked = idx.all;
		tracing::debug!(tracked = tracked.len(), modified = idx.modified.len(),
			removed = idx.removed.len(), "indexed local tree");

		let clean_install = tracked.is_empty()
			|| self.db.get_meta("clean-install:complete")?.as_deref() != Some("1");
		tracing::info!(clean_install, "starting update");

		let mut deletable: HashSet<String> = HashSet::new();
		if clean_install {
			self.db.clear_tracked_files()?;
		} else {
			deletable = tracked.into_iter().map(|r| r.path).collect();
			if outcome.unchanged() && !force {
				tracing::info!("manifest unchanged since last run, nothing to do");
				self.frontend.notify("no update required");
				return Ok(());
			}
		}

		let branch_cfg = manifest.branches.get(branch)
			.ok_or_else(|| EngineErr::BranchUnknown(branch.to_string()))?;

		for layer_id in &branch_cfg.layers {
			let layer = manifest.layers.get(layer_id)
				.ok_or_else(|| EngineErr::LayerUnknown(layer_id.clone()))?;
			let meta_key = format!("manifest:layer:{layer_id}:updated");
			let last_updated: i64 = self.db.get_meta(&meta_key)?
				.and_then(|s| s.parse().ok())
				.unwrap_or(0);

			if last_updated >= layer.updated && !force && !clean_install {
				tracing::debug!(layer_id = %layer_id, last_updated, "layer unchanged, exempt from reclaim");
				for row in self.db.get_files_by_layer(layer_id)? {
					deletable.remove(&row.path);
				}
				continue;
			}

			if layer.url.is_empty() {
				return Err(EngineErr::LayerEmpty(layer_id.clone()));
			}

			tracing::info!(layer_id = %layer_id, urls = layer.url.len(), "updating layer");
			self.frontend.notify(&format!("updating layer '{layer_id}'"));

			if clean_install {
				self.run_clean_install_layer(layer_id, &layer.url).await?;
			} else {
				self.run_selective_layer(layer_id, &layer.url, &mut deletable).await?;
			}

			self.db.set_meta(&meta_key, &layer.updated.to_string())?;
		}

		tracing::debug!(count = deletable.len(), "reclaiming unclaimed files");
		let mut reclaimed = Vec::with_capacity(deletable.len());
		for path in deletable {
			let full = self.install_dir.join(&path);
			let _ = std::fs::remove_file(&full);
			reclaimed.push(path);
		}
		self.db.delete_tracked_files(&reclaimed)?;

		if clean_install {
			self.db.set_meta("clean-install:complete", "1")?;
		}

		tracing::info!("update complete");
		self.frontend.notify("update complete");
		Ok(())
	}

	async fn run_clean_install_layer(&mut self, layer_id: &str, urls: &[String]) -> Result<(), EngineErr>
	{
		let mut progress = self.frontend.progress(layer_id, Some(urls.len() as u64), Some("archives"), false);

		let mut set = tokio::task::JoinSet::new();
		for url in urls {
			let client = self.client.clone();
			let limiter = self.limiter.clone();
			let install_dir = self.install_dir.clone();
			let url = url.clone();
			let layer_id = layer_id.to_string();
			set.spawn(async move {
				clean_install::download_and_extract(&client, &limiter, &url, &layer_id, &install_dir).await
					.map_err(|e| (url, e))
			});
		}

		let mut all_rows = Vec::new();
		while let Some(joined) = set.join_next().await {
			let result = joined.map_err(|e| EngineErr::TaskPanicked(e.to_string()))?;
			match result {
				Ok(rows) => { all_rows.extend(rows); progress.update(1); },
				Err((url, e)) => return Err(classify_clean_install_err(url, e)),
			}
		}
		self.db.track_files(&all_rows)?;
		Ok(())
	}

	async fn run_selective_layer(&mut self, layer_id: &str, urls: &[String],
			deletable: &mut HashSet<String>) -> Result<(), EngineErr>
	{
		let mut open_progress = self.frontend.progress(layer_id, Some(urls.len() as u64), Some("archives"), false);

		let mut opens = tokio::task::JoinSet::new();
		for url in urls {
			let client = self.client.clone();
			let limiter = self.limiter.clone();
			let url = url.clone();
			opens.spawn(async move {
				selective::open_with_retry(client, limiter, &url, selective::REMOTE_ZIP_OPEN_RETRIES).await
					.map_err(|e| (url.clone(), e))
					.map(|rz| (url, rz))
			});
		}

		let mut opened = Vec::new();
		while let Some(joined) = opens.join_next().await {
			let result = joined.map_err(|e| EngineErr::TaskPanicked(e.to_string()))?;
			match result {
				Ok(pair) => { opened.push(pair); open_progress.update(1); },
				Err((url, e)) => return Err(EngineErr::Archive { url, source: e }),
			}
		}
		drop(open_progress);

		// Classification touches FileDB, so it stays here on the
		// orchestrator task rather than inside any spawned worker.
		let mut plan = Vec::new();
		for (zip_idx, (_url, rz)) in opened.iter().enumerate() {
			for entry in rz.entries() {
				if entry.is_dir() { continue; }
				deletable.remove(&entry.name);
				match self.db.get_file(&entry.name)? {
					None => plan.push((zip_idx, entry.clone(), Claim::New)),
					Some(row) if row.crc != entry.crc32 => plan.push((zip_idx, entry.clone(), Claim::Overwrite)),
					Some(_) => {},
				}
			}
		}

		if plan.is_empty() {
			return Ok(());
		}

		let plan_len = plan.len() as u64;
		let mut extract_progress = self.frontend.progress(layer_id, Some(plan_len), Some("files"), false);

		let opened = Arc::new(opened);
		let mut extracts = tokio::task::JoinSet::new();
		for (zip_idx, entry, claim) in plan {
			let opened = opened.clone();
			let install_dir = self.install_dir.clone();
			let layer_id = layer_id.to_string();
			extracts.spawn(async move {
				let (url, rz) = &opened[zip_idx];
				let dest = install_dir.join(&entry.name);
				if selective::is_symlink(&dest) {
					return (url.clone(), entry, claim, layer_id, None);
				}
				let result = selective::extract_with_retry(rz, &entry, &install_dir, selective::EXTRACT_RETRIES).await;
				(url.clone(), entry, claim, layer_id, Some(result))
			});
		}

		let mut new_rows = Vec::new();
		let mut overwrite_rows = Vec::new();
		while let Some(joined) = extracts.join_next().await {
			let (url, entry, claim, layer_id, outcome) = joined.map_err(|e| EngineErr::TaskPanicked(e.to_string()))?;
			extract_progress.update(1);
			let Some(result) = outcome else { continue }; // symlink-skipped, already claimed above
			result.map_err(|source| EngineErr::Archive { url, source })?;

			let dest = self.install_dir.join(&entry.name);
			let updated = file_mtime(&dest)?;
			let row = TrackedFile { path: entry.name, crc: entry.crc32, updated, layer: layer_id };
			match claim {
				Claim::New => new_rows.push(row),
				Claim::Overwrite => overwrite_rows.push(row),
			}
		}

		self.db.track_files(&new_rows)?;
		self.db.update_tracked_files(&overwrite_rows)?;
		Ok(())
	}
}

fn classify_clean_install_err(url: String, err: clean_install::CleanInstallErr) -> EngineErr
{
	use clean_install::CleanInstallErr as E;
	match err {
		E::Network(e) => EngineErr::TransientNetwork { url, attempts: clean_install::DOWNLOAD_RETRIES, source: DownloadErr::Network(e) },
		E::Io(e) => EngineErr::TransientNetwork { url, attempts: clean_install::DOWNLOAD_RETRIES, source: DownloadErr::Io(e) },
		E::Archive(e) => EngineErr::Archive { url, source: e },
		E::Join(msg) => EngineErr::TaskPanicked(msg),
	}
}
