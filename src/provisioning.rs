//! Embedded-executable provisioning-header scan.
//!
//! Only meaningful when running from a frozen single-file bundle: the
//! build process is assumed to have appended a sentinel and a JSON
//! payload to the executable's bytes after it was compiled. We
//! memory-map the running executable and linear-search for the
//! sentinel rather than assume a fixed offset.

use serde::Deserialize;

const SENTINEL: &[u8] = b"@@@CUPMANIFESTCFG@@@";

#[derive(Debug, Clone, Deserialize)]
pub struct ProvisioningHeader
{
	pub url: String,
	#[serde(default)]
	pub installdir: Option<String>,
}

/// Scan the running executable for the provisioning sentinel and
/// decode the JSON payload that follows it. Returns `None` whenever
/// the sentinel is absent, the executable can't be located/mapped, or
/// the bytes after the sentinel don't decode as UTF-8 JSON matching
/// `ProvisioningHeader`. Absence is never treated as an error.
pub fn scan() -> Option<ProvisioningHeader>
{
	let exe = std::env::current_exe().ok()?;
	let file = std::fs::File::open(exe).ok()?;
	// SAFETY: we only read from the mapping, and the file backing it
	// is our own already-loaded executable, not expected to be
	// truncated out from under us mid-scan.
	let mmap = unsafe { memmap2::Mmap::map(&file).ok()? };

	scan_bytes(&mmap)
}

fn scan_bytes(bytes: &[u8]) -> Option<ProvisioningHeader>
{
	let pos = find(bytes, SENTINEL)?;
	let payload = &bytes[pos + SENTINEL.len()..];
	let text = std::str::from_utf8(payload).ok()?;
	serde_json::from_str(text.trim_end_matches('\0')).ok()
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize>
{
	if needle.is_empty() || haystack.len() < needle.len() { return None; }
	haystack.windows(needle.len()).position(|w| w == needle)
}
