use std::{io, mem, time::Duration};

use tokio::{
	io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter},
	time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::StreamError;

/// How long closing an [`OutputStream`] may spend pushing out buffered bytes.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on the buffer a single read allocates.
const MAX_READ_CHUNK: usize = 64 * 1024;

pub(crate) type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Once a stream is `Broken` it stays that way until it is closed.
#[derive(Debug)]
enum StreamState<T> {
	Open(T),
	Broken(StreamError),
	Closed,
}

impl<T> StreamState<T> {
	fn open(&mut self) -> Result<&mut T, StreamError> {
		match self {
			Self::Open(io) => Ok(io),
			Self::Broken(err) => Err(err.clone()),
			Self::Closed => Err(StreamError::Closed),
		}
	}

	fn settle<R>(&mut self, result: Option<io::Result<R>>) -> Result<R, StreamError> {
		match result {
			Some(Ok(value)) => Ok(value),
			Some(Err(err)) => {
				let err = StreamError::from(err);
				debug!("stream broken: {err}");
				*self = Self::Broken(err.clone());
				Err(err)
			}
			// The owning socket was closed underneath us
			None => {
				*self = Self::Closed;
				Err(StreamError::Closed)
			}
		}
	}
}

/// The readable half of a [`crate::Socket`].
pub struct InputStream {
	state: StreamState<BoxedReader>,
	shutdown: CancellationToken,
}

impl InputStream {
	pub(crate) fn new(reader: BoxedReader, shutdown: CancellationToken) -> Self {
		Self {
			state: StreamState::Open(reader),
			shutdown,
		}
	}

	/// Read at most `max_size` bytes.
	///
	/// This returns as soon as any data is available so the result may be shorter than `max_size`,
	/// a single read never returns more than 64 KiB.
	/// An empty buffer means the remote has finished writing.
	pub async fn read(&mut self, max_size: usize) -> Result<Vec<u8>, StreamError> {
		let reader = self.state.open()?;
		if max_size == 0 {
			return Ok(Vec::new());
		}

		let mut buf = vec![0; max_size.min(MAX_READ_CHUNK)];
		let result = tokio::select! {
			biased;
			() = self.shutdown.cancelled() => None,
			result = reader.read(&mut buf) => Some(result),
		};

		let read = self.state.settle(result)?;
		buf.truncate(read);
		trace!("read {read} bytes");
		Ok(buf)
	}

	pub fn is_closed(&self) -> bool {
		matches!(self.state, StreamState::Closed)
	}

	/// Release the underlying reader. Calling this more than once is a no-op.
	pub fn close(&mut self) {
		self.state = StreamState::Closed;
	}
}

/// The writable half of a [`crate::Socket`].
///
/// Writes are buffered, [`OutputStream::flush`] pushes them to the transport.
pub struct OutputStream {
	state: StreamState<BufWriter<BoxedWriter>>,
	shutdown: CancellationToken,
}

impl OutputStream {
	pub(crate) fn new(writer: BoxedWriter, shutdown: CancellationToken) -> Self {
		Self {
			state: StreamState::Open(BufWriter::new(writer)),
			shutdown,
		}
	}

	pub async fn write(&mut self, data: &[u8]) -> Result<(), StreamError> {
		let writer = self.state.open()?;
		let result = tokio::select! {
			biased;
			() = self.shutdown.cancelled() => None,
			result = writer.write_all(data) => Some(result),
		};

		self.state.settle(result)
	}

	pub async fn flush(&mut self) -> Result<(), StreamError> {
		let writer = self.state.open()?;
		let result = tokio::select! {
			biased;
			() = self.shutdown.cancelled() => None,
			result = writer.flush() => Some(result),
		};

		self.state.settle(result)
	}

	pub fn is_closed(&self) -> bool {
		matches!(self.state, StreamState::Closed)
	}

	/// Flush what is left in the buffer and shut the writer down. Calling this more than once is a no-op.
	pub async fn close(&mut self) {
		if let StreamState::Open(mut writer) = mem::replace(&mut self.state, StreamState::Closed) {
			match timeout(CLOSE_TIMEOUT, writer.shutdown()).await {
				Ok(Ok(())) => {}
				Ok(Err(err)) => debug!("error shutting down output stream: {err}"),
				Err(_) => debug!("timed out shutting down output stream"),
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use std::{
		pin::Pin,
		task::{Context, Poll},
	};

	use tokio::io::{duplex, ReadBuf};

	use super::*;

	/// Fails its first read and would happily succeed afterwards.
	struct FlakyReader {
		failed: bool,
	}

	impl AsyncRead for FlakyReader {
		fn poll_read(
			mut self: Pin<&mut Self>,
			_cx: &mut Context<'_>,
			buf: &mut ReadBuf<'_>,
		) -> Poll<io::Result<()>> {
			if self.failed {
				buf.put_slice(b"recovered");
				Poll::Ready(Ok(()))
			} else {
				self.failed = true;
				Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()))
			}
		}
	}

	struct BrokenWriter;

	impl AsyncWrite for BrokenWriter {
		fn poll_write(
			self: Pin<&mut Self>,
			_cx: &mut Context<'_>,
			_buf: &[u8],
		) -> Poll<io::Result<usize>> {
			Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
		}

		fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
			Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
		}

		fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
			Poll::Ready(Ok(()))
		}
	}

	#[tokio::test]
	async fn test_short_read() {
		let (mut remote, local) = duplex(64);
		let mut input = InputStream::new(Box::new(local), CancellationToken::new());

		remote.write_all(b"abc").await.unwrap();
		assert_eq!(input.read(1024).await.unwrap(), b"abc");

		drop(remote);
		assert!(input.read(1024).await.unwrap().is_empty());
	}

	#[tokio::test]
	async fn test_huge_read_size() {
		let (mut remote, local) = duplex(64);
		let mut input = InputStream::new(Box::new(local), CancellationToken::new());

		remote.write_all(b"abc").await.unwrap();
		assert_eq!(input.read(usize::MAX).await.unwrap(), b"abc");
	}

	#[tokio::test]
	async fn test_read_error_is_sticky() {
		let mut input =
			InputStream::new(Box::new(FlakyReader { failed: false }), CancellationToken::new());

		for _ in 0..3 {
			let err = input.read(16).await.unwrap_err();
			assert!(err.is_io(), "expected io error, got {err:?}");
		}
		// Even a zero sized read must not pretend the stream is fine
		assert!(input.read(0).await.unwrap_err().is_io());

		input.close();
		assert!(matches!(input.read(16).await, Err(StreamError::Closed)));
	}

	#[tokio::test]
	async fn test_write_error_is_sticky() {
		let mut output = OutputStream::new(Box::new(BrokenWriter), CancellationToken::new());

		// Buffered, the transport has not been touched yet
		output.write(b"hello").await.unwrap();
		assert!(output.flush().await.unwrap_err().is_io());
		assert!(output.write(b"again").await.unwrap_err().is_io());
		assert!(output.flush().await.unwrap_err().is_io());

		output.close().await;
		output.close().await;
		assert!(matches!(output.write(b"x").await, Err(StreamError::Closed)));
	}

	#[tokio::test]
	async fn test_flush_delivers_buffered_bytes() {
		let (local, mut remote) = duplex(64);
		let mut output = OutputStream::new(Box::new(local), CancellationToken::new());

		output.write(b"spacedrive").await.unwrap();
		output.flush().await.unwrap();

		let mut buf = [0; 10];
		remote.read_exact(&mut buf).await.unwrap();
		assert_eq!(&buf, b"spacedrive");
	}

	#[tokio::test]
	async fn test_shutdown_unblocks_pending_read() {
		let (_remote, local) = duplex(64);
		let shutdown = CancellationToken::new();
		let mut input = InputStream::new(Box::new(local), shutdown.clone());

		let pending = tokio::spawn(async move { input.read(16).await });
		tokio::task::yield_now().await;
		shutdown.cancel();

		let result = timeout(Duration::from_secs(1), pending)
			.await
			.expect("read should unblock once shut down")
			.unwrap();
		assert!(matches!(result, Err(StreamError::Closed)));
	}

	#[tokio::test]
	async fn test_close_is_idempotent() {
		let (local, _remote) = duplex(64);
		let mut input = InputStream::new(Box::new(local), CancellationToken::new());
		input.close();
		input.close();
		assert!(input.is_closed());
	}
}
