//! Frontend contract: progress reporting, prompts, and fatal
//! termination, modeled as a capability set rather than a single
//! do-everything object.
//!
//! Only a terminal implementation exists in this crate (`terminal`); a
//! graphical frontend is intentionally represented by this trait alone,
//! as an abstract contract with no concrete implementation here.

/// Terminal progress-bar implementation, built on `indicatif`.
pub mod terminal;

/// A scope-bounded progress reporter. Implementations must release
/// whatever resources they hold (e.g. an `indicatif` bar) when
/// dropped, so callers get release-on-all-exit-paths without needing
/// an explicit `close()`.
pub trait ProgressHandle
{
	/// Advance the counter by `n`.
	fn update(&mut self, n: u64);

	/// Set the counter to an absolute value.
	fn set(&mut self, value: u64);

	/// Replace the status line/message.
	fn status(&mut self, text: &str);
}

#[async_trait::async_trait]
pub trait Frontend: Send + Sync
{
	/// Informational message; does not affect control flow.
	fn notify(&self, msg: &str);

	/// Fatal message; terminates the process. Never returns.
	fn fatal(&self, msg: &str) -> !;

	/// Asynchronous prompt, used only when no manifest URL was
	/// supplied by any other means.
	async fn ask(&self, prompt: &str) -> Option<String>;

	/// Acquire a scope-bounded progress reporter.
	fn progress(&self, title: &str, total: Option<u64>, unit: Option<&str>, leave: bool)
		-> Box<dyn ProgressHandle>;

	/// Called once after manifest validation, so the frontend can
	/// display the brand name.
	fn set_branding(&self, brand: &str);
}
