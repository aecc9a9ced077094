//! Small async scheduling helpers.
//!
//! A semaphore-bounded HTTP client handles network concurrency, and
//! `spawn_blocking` handles CPU work (CRC, decompression). There's no
//! single `Pool` trait because `tokio::task::JoinSet` already gives us
//! fan-out/fan-in without needing a control-flow trait to abstract
//! over it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// How many concurrent outstanding HTTP requests we'll allow (manifest
/// fetches, RemoteZip ranged reads, full-archive downloads all share
/// this).
static TCP_CONNECTIONS: AtomicU32 = AtomicU32::new(50);

/// Read the configured connection limit.
pub(crate) fn tcp_connections() -> u32 { TCP_CONNECTIONS.load(Ordering::Relaxed) }

/// Set the connection limit up-front; expected to be called once at
/// startup.
pub(crate) fn set_tcp_connections(n: u32)
{
	if n < 1 { panic!("{n} connections is insane."); }
	TCP_CONNECTIONS.store(n, Ordering::Relaxed);
}

/// A cloneable handle bounding concurrent network operations.
///
/// Every HTTP request the engine makes (manifest GET, RemoteZip ranged
/// GET, full-archive download) acquires a permit before issuing the
/// request and releases it when the response body is fully drained.
#[derive(Clone)]
pub(crate) struct NetLimiter
{
	sem: Arc<tokio::sync::Semaphore>,
}

impl NetLimiter
{
	pub(crate) fn new(permits: u32) -> Self
	{
		Self { sem: Arc::new(tokio::sync::Semaphore::new(permits as usize)) }
	}

	/// Acquire a permit, await-ing if every connection slot is busy.
	pub(crate) async fn acquire(&self) -> tokio::sync::SemaphorePermit<'_>
	{
		self.sem.acquire().await.expect("semaphore never closed")
	}
}

impl Default for NetLimiter
{
	fn default() -> Self { Self::new(tcp_connections()) }
}
