//! End-to-end scenarios against a mocked HTTP origin, covering the six
//! walkthroughs of SPEC_FULL.md's testable-properties section: clean
//! install, no-op re-run, selective overwrite, reclaim, layer skip, and
//! retry-then-succeed on a transient failure.
//!
//! Grounded on the wiremock style used elsewhere in this corpus for
//! HTTP-cache integration tests (skrimix-yaas's `downloader::http_cache`
//! test module): a `MockServer` per test, matchers from
//! `wiremock::matchers`, and a dynamic `Respond` closure where the
//! response has to depend on the request (here: slicing a byte buffer
//! by the incoming `Range` header, which static fixtures can't do).

use std::collections::BTreeMap;
use std::io::{Cursor, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

use cupdater::engine::Engine;
use cupdater::filedb::FileDb;
use cupdater::frontend::{Frontend, ProgressHandle};
use cupdater::manifest::{Brand, BranchConfig, LayerConfig, LoadOutcome, Manifest, SelfUpdateSection};

struct QuietFrontend;

#[async_trait]
impl Frontend for QuietFrontend
{
	fn notify(&self, _msg: &str) {}
	fn fatal(&self, msg: &str) -> ! { panic!("fatal: {msg}"); }
	async fn ask(&self, _prompt: &str) -> Option<String> { None }
	fn progress(&self, _title: &str, _total: Option<u64>, _unit: Option<&str>, _leave: bool)
			-> Box<dyn ProgressHandle>
	{
		struct NullProgress;
		impl ProgressHandle for NullProgress
		{
			fn update(&mut self, _n: u64) {}
			fn set(&mut self, _value: u64) {}
			fn status(&mut self, _text: &str) {}
		}
		Box::new(NullProgress)
	}
	fn set_branding(&self, _brand: &str) {}
}

fn frontend() -> Arc<dyn Frontend> { Arc::new(QuietFrontend) }

fn make_manifest(branches: BTreeMap<String, BranchConfig>, layers: BTreeMap<String, LayerConfig>) -> Manifest
{
	Manifest {
		brand: Brand { name: "Acme Content".to_string() },
		self_update: SelfUpdateSection::default(),
		branches,
		layers,
	}
}

fn one_branch(layer_ids: &[&str]) -> BTreeMap<String, BranchConfig>
{
	let mut branches = BTreeMap::new();
	branches.insert("public".to_string(), BranchConfig {
		description: None,
		layers: layer_ids.iter().map(|s| s.to_string()).collect(),
	});
	branches
}

fn layer(updated: i64, url: &str) -> LayerConfig
{
	LayerConfig { updated, url: vec![url.to_string()] }
}

/// Build a minimal stored-method zip archive in memory.
fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8>
{
	let cursor = Cursor::new(Vec::new());
	let mut writer = zip::ZipWriter::new(cursor);
	let options = || zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Stored);
	for (name, data) in entries {
		writer.start_file(*name, options()).unwrap();
		writer.write_all(data).unwrap();
	}
	writer.finish().unwrap().into_inner()
}

/// Like `build_zip`, but `deflated` entries are written with the DEFLATE
/// method so at least one fixture exercises that decode path in
/// `RemoteZip`/the clean-install extractor, not just Stored.
fn build_zip_mixed(stored: &[(&str, &[u8])], deflated: &[(&str, &[u8])]) -> Vec<u8>
{
	let cursor = Cursor::new(Vec::new());
	let mut writer = zip::ZipWriter::new(cursor);
	let stored_opts = || zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Stored);
	let deflate_opts = || zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Deflated);
	for (name, data) in stored {
		writer.start_file(*name, stored_opts()).unwrap();
		writer.write_all(data).unwrap();
	}
	for (name, data) in deflated {
		writer.start_file(*name, deflate_opts()).unwrap();
		writer.write_all(data).unwrap();
	}
	writer.finish().unwrap().into_inner()
}

/// Mount a mock that serves `bytes` verbatim for an unconditional GET,
/// the shape `download_and_extract`'s clean-install path uses.
async fn mount_full_download(server: &MockServer, url_path: &str, bytes: Vec<u8>)
{
	Mock::given(method("GET"))
		.and(path(url_path))
		.respond_with(ResponseTemplate::new(200).set_body_bytes(bytes))
		.mount(server)
		.await;
}

/// Mount a mock that fails the first `fail_times` GETs with a 500 and
/// then serves `bytes`, for the transient-retry scenario.
async fn mount_flaky_download(server: &MockServer, url_path: &str, bytes: Vec<u8>, fail_times: usize)
{
	let calls = Arc::new(AtomicUsize::new(0));
	Mock::given(method("GET"))
		.and(path(url_path))
		.respond_with(move |_req: &Request| {
			let n = calls.fetch_add(1, Ordering::SeqCst);
			if n < fail_times {
				ResponseTemplate::new(500)
			} else {
				ResponseTemplate::new(200).set_body_bytes(bytes.clone())
			}
		})
		.mount(server)
		.await;
}

/// Mount HEAD (size probe) and ranged-GET (tail/central-directory/entry)
/// handlers over `bytes`, the shape `RemoteZip` needs for the selective
/// update path. The GET handler slices by whatever `Range` the request
/// actually carries, since a static fixture can't answer every range
/// `RemoteZip::open`/`extract` will issue.
async fn mount_rangeable(server: &MockServer, url_path: &str, bytes: Vec<u8>)
{
	let len = bytes.len();
	Mock::given(method("HEAD"))
		.and(path(url_path))
		.respond_with(ResponseTemplate::new(200).insert_header("Content-Length", len.to_string()))
		.mount(server)
		.await;

	let data = bytes;
	Mock::given(method("GET"))
		.and(path(url_path))
		.respond_with(move |req: &Request| {
			let range = req.headers.get("Range").and_then(|v| v.to_str().ok());
			match range.and_then(|r| r.strip_prefix("bytes=")) {
				Some(spec) => {
					let mut parts = spec.splitn(2, '-');
					let start: usize = parts.next().unwrap_or("0").parse().unwrap_or(0);
					let end_spec = parts.next().unwrap_or("");
					let end = if end_spec.is_empty() {
						data.len() - 1
					} else {
						end_spec.parse::<usize>().unwrap_or(data.len() - 1).min(data.len() - 1)
					};
					let slice = data[start..=end].to_vec();
					ResponseTemplate::new(206)
						.insert_header("Content-Range", format!("bytes {start}-{end}/{}", data.len()))
						.set_body_bytes(slice)
				},
				None => ResponseTemplate::new(200).set_body_bytes(data.clone()),
			}
		})
		.mount(server)
		.await;
}

fn db_path(install_dir: &std::path::Path) -> PathBuf { install_dir.join("updatedata.db") }

#[tokio::test]
async fn scenario_1_clean_install()
{
	let server = MockServer::start().await;
	let archive = build_zip_mixed(
		&[("a.txt", b"AAAA")],
		&[("b/c.bin", b"BBBBBB BBBBBB BBBBBB BBBBBB repeat-to-compress")],
	);
	mount_full_download(&server, "/base.zip", archive).await;

	let install_dir = tempfile::tempdir().unwrap();
	let db = FileDb::open(&db_path(install_dir.path())).unwrap();
	let mut engine = Engine::new(reqwest::Client::new(), db, install_dir.path().to_path_buf(), frontend());

	let mut layers = BTreeMap::new();
	layers.insert("base".to_string(), layer(100, &format!("{}/base.zip", server.uri())));
	let manifest = make_manifest(one_branch(&["base"]), layers);

	engine.update(&LoadOutcome::Fetched(manifest), "public", false, true).await.unwrap();

	assert_eq!(std::fs::read(install_dir.path().join("a.txt")).unwrap(), b"AAAA");
	assert_eq!(
		std::fs::read(install_dir.path().join("b/c.bin")).unwrap(),
		b"BBBBBB BBBBBB BBBBBB BBBBBB repeat-to-compress".to_vec(),
	);

	let check = FileDb::open(&db_path(install_dir.path())).unwrap();
	assert_eq!(check.get_file("a.txt").unwrap().unwrap().crc, crc32fast::hash(b"AAAA"));
	assert_eq!(check.get_file("b/c.bin").unwrap().unwrap().layer, "base");
	assert_eq!(check.get_meta("manifest:layer:base:updated").unwrap().as_deref(), Some("100"));
	assert_eq!(check.get_meta("clean-install:complete").unwrap().as_deref(), Some("1"));
}

#[tokio::test]
async fn scenario_2_noop_when_manifest_etag_matches()
{
	let server = MockServer::start().await;
	let archive = build_zip(&[("a.txt", b"AAAA")]);
	mount_full_download(&server, "/base.zip", archive).await;

	let manifest_body = serde_json::json!({
		"brand": { "name": "Acme Content" },
		"self": {},
		"branches": { "public": { "layers": ["base"] } },
		"layers": { "base": { "updated": 100, "url": [format!("{}/base.zip", server.uri())] } },
	}).to_string();

	Mock::given(method("GET"))
		.and(path("/manifest.json"))
		.respond_with(
			ResponseTemplate::new(200)
				.set_body_bytes(manifest_body.clone().into_bytes())
				.insert_header("ETag", "\"v1\""),
		)
		.up_to_n_times(1)
		.mount(&server)
		.await;
	Mock::given(method("GET"))
		.and(path("/manifest.json"))
		.and(header("If-None-Match", "\"v1\""))
		.respond_with(ResponseTemplate::new(304))
		.mount(&server)
		.await;

	let install_dir = tempfile::tempdir().unwrap();
	let manifest_url = format!("{}/manifest.json", server.uri());
	let client = reqwest::Client::new();

	let db = FileDb::open(&db_path(install_dir.path())).unwrap();
	let outcome = cupdater::manifest::load(&client, &db, &manifest_url, false).await.unwrap();
	let mut engine = Engine::new(client.clone(), db, install_dir.path().to_path_buf(), frontend());
	engine.update(&outcome, "public", false, true).await.unwrap();
	assert!(install_dir.path().join("a.txt").exists());

	// Second run: the server now answers 304, so the engine must not
	// touch the archive (no mock is registered beyond the one GET above)
	// and must leave the tracked file's mtime untouched.
	let mtime_before = std::fs::metadata(install_dir.path().join("a.txt")).unwrap().modified().unwrap();

	let db2 = FileDb::open(&db_path(install_dir.path())).unwrap();
	let outcome2 = cupdater::manifest::load(&client, &db2, &manifest_url, false).await.unwrap();
	assert!(outcome2.unchanged());

	let mut engine2 = Engine::new(client, db2, install_dir.path().to_path_buf(), frontend());
	engine2.update(&outcome2, "public", false, true).await.unwrap();

	let mtime_after = std::fs::metadata(install_dir.path().join("a.txt")).unwrap().modified().unwrap();
	assert_eq!(mtime_before, mtime_after);
}

#[tokio::test]
async fn scenario_3_selective_overwrite_then_scenario_4_reclaim()
{
	let server = MockServer::start().await;
	let install_dir = tempfile::tempdir().unwrap();

	let v1 = build_zip(&[("a.txt", b"AAAA"), ("b/c.bin", b"BBBBBB")]);
	mount_full_download(&server, "/base-v1.zip", v1).await;

	let db = FileDb::open(&db_path(install_dir.path())).unwrap();
	let mut engine = Engine::new(reqwest::Client::new(), db, install_dir.path().to_path_buf(), frontend());

	let branches = one_branch(&["base"]);
	let mut layers = BTreeMap::new();
	layers.insert("base".to_string(), layer(100, &format!("{}/base-v1.zip", server.uri())));
	engine.update(&LoadOutcome::Fetched(make_manifest(branches.clone(), layers)), "public", false, true)
		.await.unwrap();

	let before = FileDb::open(&db_path(install_dir.path())).unwrap();
	assert_eq!(before.get_file("a.txt").unwrap().unwrap().crc, crc32fast::hash(b"AAAA"));
	drop(before);

	// Scenario 3: a.txt's content (and CRC) changes; b/c.bin is untouched;
	// layers.base.updated bumps to 200.
	let v2 = build_zip(&[("a.txt", b"ZZZZ-CHANGED"), ("b/c.bin", b"BBBBBB")]);
	mount_rangeable(&server, "/base-v2.zip", v2).await;

	let mut layers2 = BTreeMap::new();
	layers2.insert("base".to_string(), layer(200, &format!("{}/base-v2.zip", server.uri())));
	engine.update(&LoadOutcome::Fetched(make_manifest(branches.clone(), layers2)), "public", false, true)
		.await.unwrap();

	assert_eq!(std::fs::read(install_dir.path().join("a.txt")).unwrap(), b"ZZZZ-CHANGED");
	assert_eq!(std::fs::read(install_dir.path().join("b/c.bin")).unwrap(), b"BBBBBB");

	let mid = FileDb::open(&db_path(install_dir.path())).unwrap();
	assert_eq!(mid.get_file("a.txt").unwrap().unwrap().crc, crc32fast::hash(b"ZZZZ-CHANGED"));
	assert_eq!(mid.get_file("b/c.bin").unwrap().unwrap().crc, crc32fast::hash(b"BBBBBB"));
	assert_eq!(mid.get_meta("manifest:layer:base:updated").unwrap().as_deref(), Some("200"));
	drop(mid);

	// Scenario 4: b/c.bin drops out of the archive entirely; updated
	// bumps to 300. It must be reclaimed from disk and FileDB.
	let v3 = build_zip(&[("a.txt", b"ZZZZ-CHANGED")]);
	mount_rangeable(&server, "/base-v3.zip", v3).await;

	let mut layers3 = BTreeMap::new();
	layers3.insert("base".to_string(), layer(300, &format!("{}/base-v3.zip", server.uri())));
	engine.update(&LoadOutcome::Fetched(make_manifest(branches, layers3)), "public", false, true)
		.await.unwrap();

	assert!(install_dir.path().join("a.txt").exists());
	assert!(!install_dir.path().join("b/c.bin").exists());

	let after = FileDb::open(&db_path(install_dir.path())).unwrap();
	assert!(after.get_file("b/c.bin").unwrap().is_none());
	assert!(after.get_file("a.txt").unwrap().is_some());
}

#[tokio::test]
async fn scenario_5_unchanged_layer_is_skipped_and_exempt_from_reclaim()
{
	let server = MockServer::start().await;
	let install_dir = tempfile::tempdir().unwrap();

	let base_archive = build_zip(&[("base.txt", b"BASE")]);
	mount_full_download(&server, "/base.zip", base_archive).await;
	let extra_v1 = build_zip(&[("extra.txt", b"EXTRA-1")]);
	mount_full_download(&server, "/extra-v1.zip", extra_v1).await;

	let branches = one_branch(&["base", "extra"]);
	let mut layers = BTreeMap::new();
	layers.insert("base".to_string(), layer(300, &format!("{}/base.zip", server.uri())));
	layers.insert("extra".to_string(), layer(10, &format!("{}/extra-v1.zip", server.uri())));

	let db = FileDb::open(&db_path(install_dir.path())).unwrap();
	let mut engine = Engine::new(reqwest::Client::new(), db, install_dir.path().to_path_buf(), frontend());
	engine.update(&LoadOutcome::Fetched(make_manifest(branches.clone(), layers.clone())), "public", false, true)
		.await.unwrap();

	assert!(install_dir.path().join("base.txt").exists());
	assert!(install_dir.path().join("extra.txt").exists());

	// "extra" advances to updated=20 with new content. "base" stays at
	// updated=300 (unchanged) and has no mock for a second archive — if
	// the engine refetched it, this test would fail outright.
	let extra_v2 = build_zip(&[("extra.txt", b"EXTRA-2")]);
	mount_rangeable(&server, "/extra-v2.zip", extra_v2).await;

	let mut layers2 = layers;
	layers2.insert("extra".to_string(), layer(20, &format!("{}/extra-v2.zip", server.uri())));
	engine.update(&LoadOutcome::Fetched(make_manifest(branches, layers2)), "public", false, true)
		.await.unwrap();

	assert!(install_dir.path().join("base.txt").exists(),
		"base layer's file must survive reclaim though its archive was never re-fetched");
	assert_eq!(std::fs::read(install_dir.path().join("extra.txt")).unwrap(), b"EXTRA-2");
}

#[tokio::test]
async fn scenario_6_transient_failures_are_retried_then_succeed()
{
	let server = MockServer::start().await;
	let archive = build_zip(&[("a.txt", b"AAAA")]);
	mount_flaky_download(&server, "/flaky.zip", archive, 2).await;

	let install_dir = tempfile::tempdir().unwrap();
	let db = FileDb::open(&db_path(install_dir.path())).unwrap();
	let mut engine = Engine::new(reqwest::Client::new(), db, install_dir.path().to_path_buf(), frontend());

	let mut layers = BTreeMap::new();
	layers.insert("base".to_string(), layer(100, &format!("{}/flaky.zip", server.uri())));
	engine.update(&LoadOutcome::Fetched(make_manifest(one_branch(&["base"]), layers)), "public", false, true)
		.await.unwrap();

	assert_eq!(std::fs::read(install_dir.path().join("a.txt")).unwrap(), b"AAAA");
	let check = FileDb::open(&db_path(install_dir.path())).unwrap();
	assert_eq!(check.get_files_by_layer("base").unwrap().len(), 1);
}
