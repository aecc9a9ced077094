//! Driver / lifecycle: wires the other components into one engine run.
//!
//! Resolution order for the install directory, manifest URL, and
//! branch: explicit CLI flags first, then the provisioning header baked
//! into the running executable, then (for the manifest URL only) an
//! interactive prompt. Overall shape is "load config, then dispatch",
//! with "load config" being this three-tier resolution and "dispatch"
//! a single `Engine::update` call.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::cli::Args;
use crate::engine::Engine;
use crate::filedb::FileDb;
use crate::frontend::terminal::TerminalFrontend;
use crate::frontend::Frontend;
use crate::{manifest, pool, provisioning};

const DB_FILENAME: &str = "updatedata.db";

struct Resolved
{
	install_dir: PathBuf,
	manifest_url: String,
}

/// Resolve the install directory and manifest URL by precedence (CLI
/// flag, then provisioning header, then an interactive prompt for the
/// manifest URL only). Returns `None` if no manifest URL could be found
/// by any means, including the prompt.
async fn resolve(args: &Args, frontend: &dyn Frontend) -> Option<Resolved>
{
	let header = provisioning::scan();

	let install_dir = args.installdir.clone()
		.or_else(|| header.as_ref().and_then(|h| h.installdir.clone()).map(PathBuf::from))
		.unwrap_or_else(|| PathBuf::from("."));

	let manifest_url = match args.manifest.clone() {
		Some(url) => Some(url),
		None => match header.as_ref().map(|h| h.url.clone()) {
			Some(url) => Some(url),
			None => frontend.ask("No manifest URL configured; enter one:").await,
		},
	}?;

	Some(Resolved { install_dir, manifest_url })
}

/// Run one full update pass from parsed CLI args. Returns the process
/// exit code (0 success, 1 fatal).
///
/// Launching a child process after a successful update is an explicit
/// Non-goal; this function instead returns `launch_hook`, the path a
/// caller would exec once `update()` completes if one were wired up —
/// presently always `None`, since no launcher is implemented.
pub async fn run(args: Args) -> anyhow::Result<(i32, Option<PathBuf>)>
{
	let frontend: Arc<dyn Frontend> = Arc::new(TerminalFrontend::new());

	if args.console {
		tracing::debug!("--console passed; the terminal frontend is always active in this build");
	}

	pool::set_tcp_connections(args.connections);

	let Some(resolved) = resolve(&args, frontend.as_ref()).await else {
		frontend.fatal("no manifest URL available from the command line, provisioning header, or prompt");
	};

	std::fs::create_dir_all(&resolved.install_dir)?;
	let db_path = resolved.install_dir.join(DB_FILENAME);
	let db = FileDb::open(&db_path)?;

	let client = reqwest::Client::builder()
		.timeout(Duration::from_secs(args.http_timeout))
		.build()?;

	let outcome = manifest::load(&client, &db, &resolved.manifest_url, args.force).await?;
	frontend.set_branding(&outcome.manifest().brand.name);

	let mut engine = Engine::new(client, db, resolved.install_dir, frontend.clone());
	match engine.update(&outcome, &args.branch, args.force, args.noselfupdate).await {
		Ok(()) => Ok((0, None)),
		Err(e) => {
			frontend.notify(&format!("update failed: {e}"));
			Ok((1, None))
		},
	}
}

#[cfg(test)]
mod tests
{
	use super::*;

	struct MuteFrontend;

	#[async_trait::async_trait]
	impl Frontend for MuteFrontend
	{
		fn notify(&self, _msg: &str) {}
		fn fatal(&self, msg: &str) -> ! { panic!("fatal: {msg}"); }
		async fn ask(&self, _prompt: &str) -> Option<String> { None }
		fn progress(&self, _title: &str, _total: Option<u64>, _unit: Option<&str>, _leave: bool)
				-> Box<dyn crate::frontend::ProgressHandle>
		{
			struct NullProgress;
			impl crate::frontend::ProgressHandle for NullProgress
			{
				fn update(&mut self, _n: u64) {}
				fn set(&mut self, _value: u64) {}
				fn status(&mut self, _text: &str) {}
			}
			Box::new(NullProgress)
		}
		fn set_branding(&self, _brand: &str) {}
	}

	fn args_with(manifest: Option<&str>, installdir: Option<PathBuf>) -> Args
	{
		Args {
			manifest: manifest.map(String::from),
			branch: "public".into(),
			installdir,
			console: false,
			verbose: 0,
			force: false,
			noselfupdate: true,
			http_timeout: 3600,
			nopause: false,
			connections: 50,
		}
	}

	#[tokio::test]
	async fn resolve_prefers_explicit_manifest_and_installdir()
	{
		let args = args_with(Some("https://example.com/m.json"), Some(PathBuf::from("/opt/app")));
		let resolved = resolve(&args, &MuteFrontend).await.unwrap();
		assert_eq!(resolved.manifest_url, "https://example.com/m.json");
		assert_eq!(resolved.install_dir, PathBuf::from("/opt/app"));
	}

	#[tokio::test]
	async fn resolve_falls_back_to_prompt_when_nothing_else_present()
	{
		let args = args_with(None, None);
		assert!(resolve(&args, &MuteFrontend).await.is_none());
	}
}
