use std::{
	fmt,
	sync::atomic::{AtomicBool, Ordering},
};

use tokio::{
	io::{split, AsyncRead, AsyncWrite},
	sync::{Mutex, MutexGuard},
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{InputStream, OutputStream, ServiceDescriptor};

/// A connected, bidirectional channel to a remote peer.
///
/// The two streams can be driven from different tasks at the same time (one reader, one writer).
/// [`Socket::close`] may be called from any task and will unblock reads or writes which are in progress.
pub struct Socket {
	input: Mutex<InputStream>,
	output: Mutex<OutputStream>,
	remote: Option<ServiceDescriptor>,
	shutdown: CancellationToken,
	closed: AtomicBool,
}

impl fmt::Debug for Socket {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Socket")
			.field("remote", &self.remote)
			.field("closed", &self.is_closed())
			.finish()
	}
}

impl Socket {
	/// Wrap a duplex transport stream.
	pub fn new<T>(io: T, remote: Option<ServiceDescriptor>) -> Self
	where
		T: AsyncRead + AsyncWrite + Send + 'static,
	{
		let (reader, writer) = split(io);
		Self::from_halves(reader, writer, remote)
	}

	/// Build a socket from a transport which is already split into its read and write halves.
	pub fn from_halves(
		reader: impl AsyncRead + Send + Unpin + 'static,
		writer: impl AsyncWrite + Send + Unpin + 'static,
		remote: Option<ServiceDescriptor>,
	) -> Self {
		let shutdown = CancellationToken::new();
		Self {
			input: Mutex::new(InputStream::new(Box::new(reader), shutdown.clone())),
			output: Mutex::new(OutputStream::new(Box::new(writer), shutdown.clone())),
			remote,
			shutdown,
			closed: AtomicBool::new(false),
		}
	}

	/// Exclusive access to the readable stream.
	///
	pub async fn input_stream(&self) -> MutexGuard<'_, InputStream> {
		self.input.lock().await
	}

	/// Exclusive access to the writable stream.
	pub async fn output_stream(&self) -> MutexGuard<'_, OutputStream> {
		self.output.lock().await
	}

	/// The service on the other end if the transport knew it when the connection was established.
	/// This is `None` for inbound connections.
	pub fn remote_descriptor(&self) -> Option<&ServiceDescriptor> {
		self.remote.as_ref()
	}

	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::Acquire)
	}

	/// Close both streams and then the connection.
	pub async fn close(&self) {
		if self.closed.swap(true, Ordering::AcqRel) {
			return;
		}

		// Every stream operation from here on returns `StreamError::Closed`, even through a guard which is already held
		self.shutdown.cancel();

		// Whoever holds a stream right now releases it on their next operation, or when the socket drops
		if let Ok(mut output) = self.output.try_lock() {
			output.close().await;
		}
		if let Ok(mut input) = self.input.try_lock() {
			input.close();
		}

		debug!(
			"closed socket to '{}'",
			self.remote
				.as_ref()
				.map_or("<inbound>", ServiceDescriptor::name)
		);
	}
}

impl Drop for Socket {
	fn drop(&mut self) {
		self.shutdown.cancel();
	}
}
