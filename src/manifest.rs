//! Manifest data model, JSON Schema validation, and the ETag-aware
//! loader.
//!
//! A `serde`-derived struct is paired with hand-written JSON Schema
//! validation for the checks a plain derive can't express: name-pattern
//! and hex-digest constraints on fields the schema enforces at parse time.

use std::collections::BTreeMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::util::hash::Sha256Hash;

#[derive(Debug, Error)]
pub enum ManifestErr
{
	#[error("network error fetching manifest: {0}")]
	Network(#[from] reqwest::Error),

	#[error("manifest body is not valid JSON: {0}")]
	Json(#[from] serde_json::Error),

	#[error("manifest failed schema validation: {0}")]
	SchemaInvalid(String),

	#[error("server returned unexpected status {0} loading manifest")]
	BadStatus(reqwest::StatusCode),

	#[error("no manifest URL was supplied")]
	NoUrl,
}

/// Platforms the manifest's `self` section may carry an entry for;
/// any other key in the JSON object is ignored at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform
{
	Linux,
	Windows,
}

impl Platform
{
	/// The platform this binary was built for.
	pub fn current() -> Self
	{
		if cfg!(target_os = "windows") { Self::Windows } else { Self::Linux }
	}
}

/// `self.linux`/`self.windows`; modeled as plain optional fields
/// rather than a map so `serde_json` doesn't need an enum-as-map-key
/// encoding for a two-member set.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SelfUpdateSection
{
	#[serde(default)]
	pub linux: Option<SelfUpdateInfo>,
	#[serde(default)]
	pub windows: Option<SelfUpdateInfo>,
}

impl SelfUpdateSection
{
	pub fn for_platform(&self, platform: Platform) -> Option<&SelfUpdateInfo>
	{
		match platform {
			Platform::Linux => self.linux.as_ref(),
			Platform::Windows => self.windows.as_ref(),
		}
	}
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Brand
{
	pub name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SelfUpdateInfo
{
	pub url: String,
	pub sha256: Sha256Hash,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BranchConfig
{
	#[serde(default)]
	pub description: Option<String>,
	pub layers: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LayerConfig
{
	pub updated: i64,
	pub url: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Manifest
{
	pub brand: Brand,
	#[serde(rename = "self", default)]
	pub self_update: SelfUpdateSection,
	pub branches: BTreeMap<String, BranchConfig>,
	pub layers: BTreeMap<String, LayerConfig>,
}

impl Manifest
{
	pub fn self_update_for_current_platform(&self) -> Option<&SelfUpdateInfo>
	{
		self.self_update.for_platform(Platform::current())
	}
}

/// draft-07 JSON Schema the manifest document must validate against.
fn schema() -> serde_json::Value
{
	serde_json::json!({
		"$schema": "http://json-schema.org/draft-07/schema#",
		"type": "object",
		"required": ["brand", "self", "branches", "layers"],
		"definitions": {
			"selfUpdaterInfo": {
				"type": "object",
				"required": ["url", "sha256"],
				"properties": {
					"url": { "type": "string" },
					"sha256": { "type": "string", "pattern": "^[a-f0-9]{64}$" },
				},
			},
			"branchConfig": {
				"type": "object",
				"required": ["layers"],
				"properties": {
					"description": { "type": "string" },
					"layers": { "type": "array", "items": { "type": "string" } },
				},
			},
			"layerConfig": {
				"type": "object",
				"required": ["updated", "url"],
				"properties": {
					"updated": { "type": "integer" },
					"url": { "type": "array", "minItems": 1, "items": { "type": "string" } },
				},
			},
		},
		"properties": {
			"brand": {
				"type": "object",
				"required": ["name"],
				"properties": { "name": { "type": "string" } },
			},
			"self": {
				"type": "object",
				"properties": {
					"linux": { "$ref": "#/definitions/selfUpdaterInfo" },
					"windows": { "$ref": "#/definitions/selfUpdaterInfo" },
				},
			},
			"branches": {
				"type": "object",
				"patternProperties": {
					"^[A-Za-z_][A-Za-z0-9_]*$": { "$ref": "#/definitions/branchConfig" },
				},
				"additionalProperties": false,
			},
			"layers": {
				"type": "object",
				"patternProperties": {
					"^[A-Za-z_-][A-Za-z0-9_-]*$": { "$ref": "#/definitions/layerConfig" },
				},
				"additionalProperties": false,
			},
		},
	})
}

/// Validate raw manifest JSON against the schema, then deserialize it
/// into a `Manifest`. Both steps can fail with `ManifestErr::Json`/
/// `SchemaInvalid`.
pub fn parse_and_validate(body: &str) -> Result<Manifest, ManifestErr>
{
	let value: serde_json::Value = serde_json::from_str(body)?;

	let compiled = jsonschema::JSONSchema::options()
		.with_draft(jsonschema::Draft::Draft7)
		.compile(&schema())
		.expect("manifest schema is a compile-time constant");

	if let Err(errors) = compiled.validate(&value) {
		let joined = errors.map(|e| e.to_string()).collect::<Vec<_>>().join("; ");
		return Err(ManifestErr::SchemaInvalid(joined));
	}

	Ok(serde_json::from_value(value)?)
}

/// Outcome of loading the manifest: either a fresh one was fetched and
/// validated, or the server confirmed (304) that the cached copy is
/// still current.
pub enum LoadOutcome
{
	Fetched(Manifest),
	Unchanged(Manifest),
}

impl LoadOutcome
{
	pub fn manifest(&self) -> &Manifest
	{
		match self {
			Self::Fetched(m) | Self::Unchanged(m) => m,
		}
	}

	pub fn unchanged(&self) -> bool
	{
		matches!(self, Self::Unchanged(_))
	}
}

/// Load the manifest at `url`, consulting and updating the
/// `manifest:cached`/`manifest:cached:etag` meta keys in `db`. Issues a
/// conditional GET with `If-None-Match` when a cached ETag exists, and
/// short-circuits to the cached copy on a 304.
pub async fn load(client: &reqwest::Client, db: &crate::filedb::FileDb,
		url: &str, force: bool) -> Result<LoadOutcome, ManifestErr>
{
	let cached_etag = db.get_meta("manifest:cached:etag").map_err(
		|e| ManifestErr::SchemaInvalid(format!("reading cached etag: {e}")))?;
	let cached_json = db.get_meta("manifest:cached").map_err(
		|e| ManifestErr::SchemaInvalid(format!("reading cached manifest: {e}")))?;

	let mut req = client.get(url);
	if !force {
		if let Some(etag) = &cached_etag {
			req = req.header(reqwest::header::IF_NONE_MATCH, etag);
		}
	}

	let resp = req.send().await?;

	if resp.status() == reqwest::StatusCode::NOT_MODIFIED {
		let cached = cached_json.ok_or(ManifestErr::NoUrl)?;
		let manifest = parse_and_validate(&cached)?;
		return Ok(LoadOutcome::Unchanged(manifest));
	}

	if !resp.status().is_success() {
		return Err(ManifestErr::BadStatus(resp.status()));
	}

	let etag = resp.headers().get(reqwest::header::ETAG)
		.and_then(|v| v.to_str().ok())
		.map(|s| s.to_string());
	let body = resp.text().await?;
	let manifest = parse_and_validate(&body)?;

	db.set_meta("manifest:cached", &body).map_err(
		|e| ManifestErr::SchemaInvalid(format!("writing cached manifest: {e}")))?;
	if let Some(etag) = etag {
		db.set_meta("manifest:cached:etag", &etag).map_err(
			|e| ManifestErr::SchemaInvalid(format!("writing cached etag: {e}")))?;
	}

	Ok(LoadOutcome::Fetched(manifest))
}
