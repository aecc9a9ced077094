//! HTTP-range-backed random access to a remote zip archive.
//!
//! No crate in this corpus models ZIP's End-Of-Central-Directory /
//! Central-Directory / local-header layout directly, so this is
//! hand-rolled the way the pack hand-rolls other binary container
//! formats with `byteorder` (see e.g. `sui-archival`'s blob-file
//! parser) rather than reached for an unfamiliar archive crate whose
//! exact API this corpus never demonstrates.

use std::io::{Cursor, Read};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt};
use reqwest::header::{CONTENT_RANGE, RANGE};
use thiserror::Error;

use crate::pool::NetLimiter;

#[derive(Debug, Error)]
pub enum RemoteZipErr
{
	#[error("network error: {0}")]
	Network(#[from] reqwest::Error),

	#[error("server returned unexpected status {0}")]
	BadStatus(reqwest::StatusCode),

	#[error("response was truncated: {0}")]
	Truncated(String),

	#[error("could not find end-of-central-directory record")]
	NoEocd,

	#[error("central directory is malformed: {0}")]
	Malformed(String),

	#[error("unsupported compression method {0}")]
	UnsupportedMethod(u16),

	#[error("CRC-32 mismatch for {path}: expected {expected:08x}, got {got:08x}")]
	CrcMismatch { path: String, expected: u32, got: u32 },

	#[error("I/O error writing {path}: {source}")]
	Io { path: String, #[source] source: std::io::Error },
}

impl RemoteZipErr
{
	/// Whether this failure is worth a caller retrying. Unsupported-method
	/// failures are the one hard stop.
	pub fn is_retryable(&self) -> bool
	{
		!matches!(self, Self::UnsupportedMethod(_))
	}
}

const EOCD_SIGNATURE: u32 = 0x0605_4b50;
const CD_SIGNATURE: u32 = 0x0201_4b50;
const LOCAL_SIGNATURE: u32 = 0x0403_4b50;
const EOCD_FIXED_SIZE: u64 = 22;
const MAX_COMMENT_LEN: u64 = 65535;
/// Conservative guess for a local header's fixed-plus-variable size,
/// so the common case needs only one ranged GET per entry.
const LOCAL_HEADER_GUESS: u64 = 30 + 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method
{
	Stored,
	Deflated,
	Zstd,
}

impl Method
{
	fn from_raw(raw: u16) -> Result<Self, RemoteZipErr>
	{
		match raw {
			0 => Ok(Self::Stored),
			8 => Ok(Self::Deflated),
			93 => Ok(Self::Zstd),
			other => Err(RemoteZipErr::UnsupportedMethod(other)),
		}
	}
}

/// One entry from the archive's central directory.
#[derive(Debug, Clone)]
pub struct Entry
{
	pub name: String,
	pub crc32: u32,
	pub compressed_size: u64,
	pub uncompressed_size: u64,
	pub method: Method,
	local_header_offset: u64,
}

impl Entry
{
	pub fn is_dir(&self) -> bool { self.name.ends_with('/') }
}

/// A zip archive accessed by ranged reads over HTTP, without
/// downloading the whole thing.
pub struct RemoteZip
{
	client: reqwest::Client,
	limiter: NetLimiter,
	url: String,
	entries: Vec<Entry>,
}

impl RemoteZip
{
	/// Fetch the EOCD and central directory and parse every entry's
	/// metadata, issuing only absolute-range GETs (never a suffix range).
	pub async fn open(client: reqwest::Client, limiter: NetLimiter, url: &str)
			-> Result<Self, RemoteZipErr>
	{
		let total_size = probe_total_size(&client, &limiter, url).await?;

		let tail_window = EOCD_FIXED_SIZE + MAX_COMMENT_LEN;
		let tail_start = total_size.saturating_sub(tail_window);
		let tail = ranged_get(&client, &limiter, url, tail_start, total_size - 1).await?;

		let (eocd_pos, cd_offset, cd_size) = find_eocd(&tail, tail_start)?;
		let _ = eocd_pos;

		let cd_bytes = ranged_get(&client, &limiter, url, cd_offset, cd_offset + cd_size - 1).await?;
		let entries = parse_central_directory(&cd_bytes)?;

		Ok(Self { client, limiter, url: url.to_string(), entries })
	}

	pub fn entries(&self) -> &[Entry] { &self.entries }

	/// Extract one entry to `dest_root.join(&entry.name)`, verifying
	/// its CRC-32 against the central directory's recorded value.
	pub async fn extract(&self, entry: &Entry, dest_root: &Path)
			-> Result<(), RemoteZipErr>
	{
		let dest = dest_root.join(&entry.name);
		if let Some(parent) = dest.parent() {
			std::fs::create_dir_all(parent)
				.map_err(|source| RemoteZipErr::Io { path: entry.name.clone(), source })?;
		}

		let data = self.fetch_compressed(entry).await?;
		let decoded = decode(entry.method, &data, entry.uncompressed_size)?;

		let got_crc = crc32fast::hash(&decoded);
		if got_crc != entry.crc32 {
			return Err(RemoteZipErr::CrcMismatch {
				path: entry.name.clone(),
				expected: entry.crc32,
				got: got_crc,
			});
		}

		std::fs::write(&dest, &decoded)
			.map_err(|source| RemoteZipErr::Io { path: entry.name.clone(), source })?;
		Ok(())
	}

	/// Ranged-GET the entry's local header plus its compressed
	/// payload, re-fetching if the initial guess undershot the
	/// header's actual size (long filename/extra field).
	async fn fetch_compressed(&self, entry: &Entry) -> Result<Vec<u8>, RemoteZipErr>
	{
		let start = entry.local_header_offset;
		let guess_end = start + LOCAL_HEADER_GUESS + entry.compressed_size;
		let buf = ranged_get(&self.client, &self.limiter, &self.url, start, guess_end - 1).await?;

		let (header_len, _) = parse_local_header_len(&buf)?;
		let data_start = header_len as usize;
		let data_end = data_start + entry.compressed_size as usize;

		if buf.len() >= data_end {
			return Ok(buf[data_start..data_end].to_vec());
		}

		// The guess undershot (unusually large filename/extra);
		// re-fetch with the now-known exact bound.
		let exact_end = start + header_len + entry.compressed_size;
		let buf = ranged_get(&self.client, &self.limiter, &self.url, start, exact_end - 1).await?;
		if buf.len() < data_end {
			return Err(RemoteZipErr::Truncated(format!(
				"local header + data for {} came back short", entry.name)));
		}
		Ok(buf[data_start..data_end].to_vec())
	}
}

/// Parse every entry out of an archive that's already fully in memory
/// (the clean-install path downloads the whole thing up front, so
/// there's no point re-fetching the tail/central-directory over HTTP
/// the way `RemoteZip::open` does for the selective path).
pub(crate) fn parse_archive_bytes(bytes: &[u8]) -> Result<Vec<Entry>, RemoteZipErr>
{
	let (_, cd_offset, cd_size) = find_eocd(bytes, 0)?;
	let cd_offset = cd_offset as usize;
	let cd_end = cd_offset + cd_size as usize;
	if cd_end > bytes.len() {
		return Err(RemoteZipErr::Truncated("central directory ran off the end of the archive".into()));
	}
	parse_central_directory(&bytes[cd_offset..cd_end])
}

/// Extract one entry straight out of an in-memory archive buffer,
/// slicing its local header and compressed payload directly instead of
/// issuing a ranged GET. Shares `parse_local_header_len`/`decode` with
/// the HTTP path so both agree on wire format.
pub(crate) fn extract_entry_from_bytes(bytes: &[u8], entry: &Entry, dest_root: &Path)
		-> Result<(), RemoteZipErr>
{
	let dest = dest_root.join(&entry.name);
	if let Some(parent) = dest.parent() {
		std::fs::create_dir_all(parent)
			.map_err(|source| RemoteZipErr::Io { path: entry.name.clone(), source })?;
	}

	let start = entry.local_header_offset as usize;
	if start + 30 > bytes.len() {
		return Err(RemoteZipErr::Truncated(format!("local header for {} ran off the end", entry.name)));
	}
	let (header_len, _) = parse_local_header_len(&bytes[start..])?;
	let data_start = start + header_len as usize;
	let data_end = data_start + entry.compressed_size as usize;
	if data_end > bytes.len() {
		return Err(RemoteZipErr::Truncated(format!("compressed data for {} ran off the end", entry.name)));
	}

	let decoded = decode(entry.method, &bytes[data_start..data_end], entry.uncompressed_size)?;
	let got_crc = crc32fast::hash(&decoded);
	if got_crc != entry.crc32 {
		return Err(RemoteZipErr::CrcMismatch { path: entry.name.clone(), expected: entry.crc32, got: got_crc });
	}

	std::fs::write(&dest, &decoded)
		.map_err(|source| RemoteZipErr::Io { path: entry.name.clone(), source })?;
	Ok(())
}

fn decode(method: Method, data: &[u8], uncompressed_size: u64) -> Result<Vec<u8>, RemoteZipErr>
{
	match method {
		Method::Stored => Ok(data.to_vec()),
		Method::Deflated => {
			let mut decoder = flate2::bufread::DeflateDecoder::new(data);
			let mut out = Vec::with_capacity(uncompressed_size as usize);
			decoder.read_to_end(&mut out)
				.map_err(|e| RemoteZipErr::Truncated(format!("deflate: {e}")))?;
			Ok(out)
		},
		Method::Zstd => {
			zstd::stream::decode_all(data)
				.map_err(|e| RemoteZipErr::Truncated(format!("zstd: {e}")))
		},
	}
}

/// Learn the archive's total byte length without downloading it. Tries
/// HEAD first; falls back to an absolute-range probe GET if HEAD
/// doesn't report a length (some servers omit Content-Length on HEAD,
/// or disallow it entirely). Never relies on a suffix range.
async fn probe_total_size(client: &reqwest::Client, limiter: &NetLimiter, url: &str)
		-> Result<u64, RemoteZipErr>
{
	let _permit = limiter.acquire().await;
	if let Ok(resp) = client.head(url).send().await {
		if resp.status().is_success() {
			if let Some(len) = resp.content_length() {
				if len > 0 { return Ok(len); }
			}
		}
	}
	drop(_permit);

	let _permit = limiter.acquire().await;
	let resp = client.get(url).header(RANGE, "bytes=0-0").send().await?;
	if resp.status() != reqwest::StatusCode::PARTIAL_CONTENT {
		return Err(RemoteZipErr::BadStatus(resp.status()));
	}
	let content_range = resp.headers().get(CONTENT_RANGE)
		.and_then(|v| v.to_str().ok())
		.ok_or_else(|| RemoteZipErr::Truncated("no Content-Range on probe".into()))?;
	parse_total_from_content_range(content_range)
}

fn parse_total_from_content_range(header: &str) -> Result<u64, RemoteZipErr>
{
	// "bytes 0-0/12345"
	let total = header.rsplit('/').next()
		.ok_or_else(|| RemoteZipErr::Truncated(format!("bad Content-Range: {header}")))?;
	total.trim().parse().map_err(|_| RemoteZipErr::Truncated(format!("bad Content-Range: {header}")))
}

/// Issue one absolute-range GET, `[start, end]` inclusive, following
/// redirects (the default `reqwest::Client` policy already does).
async fn ranged_get(client: &reqwest::Client, limiter: &NetLimiter, url: &str,
		start: u64, end: u64) -> Result<Vec<u8>, RemoteZipErr>
{
	let _permit = limiter.acquire().await;
	let range = format!("bytes={start}-{end}");
	let resp = client.get(url).header(RANGE, range).send().await?;

	if resp.status() != reqwest::StatusCode::PARTIAL_CONTENT
			&& resp.status() != reqwest::StatusCode::OK {
		return Err(RemoteZipErr::BadStatus(resp.status()));
	}

	let bytes = resp.bytes().await?;
	Ok(bytes.to_vec())
}

/// Search a tail buffer (known to end at the file's last byte) for the
/// EOCD signature, scanning backward since it may be followed by a
/// variable-length comment. Returns (absolute EOCD offset, CD offset,
/// CD size).
fn find_eocd(tail: &[u8], tail_start: u64) -> Result<(u64, u64, u64), RemoteZipErr>
{
	if tail.len() < EOCD_FIXED_SIZE as usize {
		return Err(RemoteZipErr::Truncated("tail shorter than one EOCD record".into()));
	}

	let sig = EOCD_SIGNATURE.to_le_bytes();
	let search_end = tail.len() - EOCD_FIXED_SIZE as usize;
	for i in (0..=search_end).rev() {
		if tail[i..i + 4] == sig {
			let mut cur = Cursor::new(&tail[i + 4..]);
			let _disk_num = cur.read_u16::<LittleEndian>().map_err(io_to_malformed)?;
			let _cd_disk = cur.read_u16::<LittleEndian>().map_err(io_to_malformed)?;
			let _entries_this_disk = cur.read_u16::<LittleEndian>().map_err(io_to_malformed)?;
			let _entries_total = cur.read_u16::<LittleEndian>().map_err(io_to_malformed)?;
			let cd_size = cur.read_u32::<LittleEndian>().map_err(io_to_malformed)? as u64;
			let cd_offset = cur.read_u32::<LittleEndian>().map_err(io_to_malformed)? as u64;
			return Ok((tail_start + i as u64, cd_offset, cd_size));
		}
	}
	Err(RemoteZipErr::NoEocd)
}

fn io_to_malformed(e: std::io::Error) -> RemoteZipErr
{
	RemoteZipErr::Malformed(e.to_string())
}

fn parse_central_directory(buf: &[u8]) -> Result<Vec<Entry>, RemoteZipErr>
{
	let mut entries = Vec::new();
	let mut cur = Cursor::new(buf);

	while (cur.position() as usize) < buf.len() {
		let sig = cur.read_u32::<LittleEndian>().map_err(io_to_malformed)?;
		if sig != CD_SIGNATURE {
			return Err(RemoteZipErr::Malformed(format!(
				"expected central directory signature at offset {}", cur.position() - 4)));
		}

		let _version_made_by = cur.read_u16::<LittleEndian>().map_err(io_to_malformed)?;
		let _version_needed = cur.read_u16::<LittleEndian>().map_err(io_to_malformed)?;
		let _flags = cur.read_u16::<LittleEndian>().map_err(io_to_malformed)?;
		let method = cur.read_u16::<LittleEndian>().map_err(io_to_malformed)?;
		let _mod_time = cur.read_u16::<LittleEndian>().map_err(io_to_malformed)?;
		let _mod_date = cur.read_u16::<LittleEndian>().map_err(io_to_malformed)?;
		let crc32 = cur.read_u32::<LittleEndian>().map_err(io_to_malformed)?;
		let compressed_size = cur.read_u32::<LittleEndian>().map_err(io_to_malformed)? as u64;
		let uncompressed_size = cur.read_u32::<LittleEndian>().map_err(io_to_malformed)? as u64;
		let name_len = cur.read_u16::<LittleEndian>().map_err(io_to_malformed)? as usize;
		let extra_len = cur.read_u16::<LittleEndian>().map_err(io_to_malformed)? as usize;
		let comment_len = cur.read_u16::<LittleEndian>().map_err(io_to_malformed)? as usize;
		let _disk_start = cur.read_u16::<LittleEndian>().map_err(io_to_malformed)?;
		let _internal_attrs = cur.read_u16::<LittleEndian>().map_err(io_to_malformed)?;
		let _external_attrs = cur.read_u32::<LittleEndian>().map_err(io_to_malformed)?;
		let local_header_offset = cur.read_u32::<LittleEndian>().map_err(io_to_malformed)? as u64;

		let name_start = cur.position() as usize;
		let name_end = name_start + name_len;
		if name_end > buf.len() {
			return Err(RemoteZipErr::Truncated("central directory entry name ran off the end".into()));
		}
		let name = String::from_utf8_lossy(&buf[name_start..name_end]).into_owned();

		let skip = name_len + extra_len + comment_len;
		cur.set_position(cur.position() + skip as u64);

		entries.push(Entry {
			name,
			crc32,
			compressed_size,
			uncompressed_size,
			method: Method::from_raw(method)?,
			local_header_offset,
		});
	}

	Ok(entries)
}

/// Parse just enough of a local file header to learn its total size
/// (fixed 30 bytes + filename + extra field), so the caller can slice
/// the compressed payload out of whatever it already fetched.
fn parse_local_header_len(buf: &[u8]) -> Result<(u64, u16), RemoteZipErr>
{
	if buf.len() < 30 {
		return Err(RemoteZipErr::Truncated("local header shorter than 30 bytes".into()));
	}
	let mut cur = Cursor::new(buf);
	let sig = cur.read_u32::<LittleEndian>().map_err(io_to_malformed)?;
	if sig != LOCAL_SIGNATURE {
		return Err(RemoteZipErr::Malformed("bad local file header signature".into()));
	}
	let _version_needed = cur.read_u16::<LittleEndian>().map_err(io_to_malformed)?;
	let flags = cur.read_u16::<LittleEndian>().map_err(io_to_malformed)?;
	let _method = cur.read_u16::<LittleEndian>().map_err(io_to_malformed)?;
	let _mod_time = cur.read_u16::<LittleEndian>().map_err(io_to_malformed)?;
	let _mod_date = cur.read_u16::<LittleEndian>().map_err(io_to_malformed)?;
	let _crc32 = cur.read_u32::<LittleEndian>().map_err(io_to_malformed)?;
	let _compressed_size = cur.read_u32::<LittleEndian>().map_err(io_to_malformed)?;
	let _uncompressed_size = cur.read_u32::<LittleEndian>().map_err(io_to_malformed)?;
	let name_len = cur.read_u16::<LittleEndian>().map_err(io_to_malformed)? as u64;
	let extra_len = cur.read_u16::<LittleEndian>().map_err(io_to_malformed)? as u64;

	Ok((30 + name_len + extra_len, flags))
}
