//! Self-update check: compare the running executable's hash against
//! the one published in the manifest, and fail the whole update if
//! they differ.
//!
//! Built directly on `util::hash`'s `check_sha256_file`; no generalization
//! needed here, just a different caller.

use thiserror::Error;

use crate::manifest::Manifest;
use crate::util::hash::{check_sha256_file, Sha256ReaderErr};

#[derive(Debug, Error)]
pub enum SelfUpdateErr
{
	#[error("running executable's hash does not match the published one; get the new version at {url}")]
	HashMismatch { url: String },

	#[error("could not hash the running executable: {0}")]
	Hashing(#[from] Sha256ReaderErr),

	#[error("could not locate the running executable: {0}")]
	CurrentExe(#[from] std::io::Error),
}

/// Whether this build is a "frozen" single-file bundle the
/// self-update check applies to, mapped to a build-time Cargo feature
/// rather than a runtime flag.
pub fn is_frozen_bundle() -> bool
{
	cfg!(feature = "frozen-bundle")
}

/// Compare the running executable's hash against the one published for
/// the current platform and fail if they differ. A no-op when this isn't
/// a frozen bundle, the manifest has no entry for the current platform,
/// or `ignore_self_update` is set.
pub fn check(manifest: &Manifest, ignore_self_update: bool) -> Result<(), SelfUpdateErr>
{
	if ignore_self_update || !is_frozen_bundle() {
		return Ok(());
	}

	let Some(info) = manifest.self_update_for_current_platform() else {
		return Ok(());
	};

	let exe = std::env::current_exe()?;
	let expect = info.sha256.to_string();
	match check_sha256_file(&exe, &expect) {
		Ok(()) => Ok(()),
		Err(Sha256ReaderErr::Hash(_, _)) => Err(SelfUpdateErr::HashMismatch { url: info.url.clone() }),
		Err(other) => Err(SelfUpdateErr::Hashing(other)),
	}
}
