//! Command line handling.
//!
//! General invocation: `$0 [options]`. There's only one operation here
//! (`update`), so this is a flat `Parser` rather than a `Subcommand` enum.

use std::path::PathBuf;

use clap::Parser;

/// Main arg entry point.
#[derive(Debug, Parser)]
#[command(about = "Keep an installed content tree in sync with a published manifest.")]
#[command(version)]
pub struct Args
{
	/// Manifest URL to update from.
	///
	/// If omitted, the provisioning header embedded in the running
	/// executable is consulted first; failing that, you'll be prompted
	/// for one interactively.
	#[arg(short, long)]
	pub manifest: Option<String>,

	/// Branch to track within the manifest.
	#[arg(short, long, default_value = "public")]
	pub branch: String,

	/// Directory to install into.
	///
	/// If omitted, the provisioning header's `installdir` is used if
	/// present, else the current directory.
	#[arg(short, long)]
	pub installdir: Option<PathBuf>,

	/// Use the console/terminal frontend explicitly.
	///
	/// Only a terminal frontend is implemented in this build, so this
	/// flag is accepted for compatibility but is presently a no-op: the
	/// terminal frontend is always the one in use.
	#[arg(long)]
	pub console: bool,

	/// Increase log verbosity. May be repeated.
	#[arg(short, long, action = clap::ArgAction::Count)]
	pub verbose: u8,

	/// Force a full re-evaluation of every layer, ignoring cached
	/// ETags and per-layer watermarks.
	#[arg(short, long)]
	pub force: bool,

	/// Skip the self-update hash check even on a frozen bundle.
	#[arg(long)]
	pub noselfupdate: bool,

	/// HTTP request timeout, in seconds.
	#[arg(long, default_value_t = 3600)]
	pub http_timeout: u64,

	/// Don't pause for a keypress before exiting.
	#[arg(long)]
	pub nopause: bool,

	/// How many concurrent HTTP requests to allow in flight.
	#[arg(long, default_value_t = 50)]
	pub connections: u32,
}
