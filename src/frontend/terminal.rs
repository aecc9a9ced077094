//! Terminal `Frontend` implementation.

use std::io::Write;
use std::sync::Mutex;

use indicatif::{ProgressBar, ProgressStyle};

use super::{Frontend, ProgressHandle};

pub struct TerminalFrontend
{
	brand: Mutex<String>,
}

impl TerminalFrontend
{
	pub fn new() -> Self
	{
		Self { brand: Mutex::new(String::new()) }
	}
}

impl Default for TerminalFrontend
{
	fn default() -> Self { Self::new() }
}

#[async_trait::async_trait]
impl Frontend for TerminalFrontend
{
	fn notify(&self, msg: &str)
	{
		println!("{msg}");
	}

	fn fatal(&self, msg: &str) -> !
	{
		eprintln!("fatal: {msg}");
		std::process::exit(1);
	}

	async fn ask(&self, prompt: &str) -> Option<String>
	{
		print!("{prompt} ");
		std::io::stdout().flush().ok()?;

		tokio::task::spawn_blocking(|| {
			let mut line = String::new();
			std::io::stdin().read_line(&mut line).ok()?;
			let trimmed = line.trim();
			if trimmed.is_empty() { None } else { Some(trimmed.to_string()) }
		}).await.ok()?
	}

	fn progress(&self, title: &str, total: Option<u64>, unit: Option<&str>, leave: bool)
			-> Box<dyn ProgressHandle>
	{
		let bar = match total {
			Some(n) => ProgressBar::new(n),
			None => ProgressBar::new_spinner(),
		};

		let unit_suffix = unit.unwrap_or("");
		let template = if total.is_some() {
			format!("{{msg}} [{{bar:40}}] {{pos}}/{{len}} {unit_suffix}")
		} else {
			"{msg} {spinner} {pos}".to_string()
		};
		if let Ok(style) = ProgressStyle::with_template(&template) {
			bar.set_style(style);
		}
		bar.set_message(title.to_string());

		Box::new(TerminalProgress { bar, leave })
	}

	fn set_branding(&self, brand: &str)
	{
		*self.brand.lock().expect("brand mutex poisoned") = brand.to_string();
		println!("{brand}");
	}
}

struct TerminalProgress
{
	bar: ProgressBar,
	leave: bool,
}

impl ProgressHandle for TerminalProgress
{
	fn update(&mut self, n: u64) { self.bar.inc(n); }
	fn set(&mut self, value: u64) { self.bar.set_position(value); }
	fn status(&mut self, text: &str) { self.bar.set_message(text.to_string()); }
}

impl Drop for TerminalProgress
{
	fn drop(&mut self)
	{
		if self.leave {
			self.bar.finish();
		} else {
			self.bar.finish_and_clear();
		}
	}
}
