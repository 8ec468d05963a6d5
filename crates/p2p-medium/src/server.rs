use std::{
	collections::HashSet,
	fmt, io,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc, Mutex, PoisonError,
	},
};

use async_trait::async_trait;
use tokio::{
	io::{AsyncRead, AsyncWrite},
	net::TcpListener,
	task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{ListenError, ServiceAddress, Socket};

/// A raw, connected byte stream handed to us by a native transport.
pub trait NativeStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> NativeStream for T {}

/// The native half of a listening endpoint.
#[async_trait]
pub trait Acceptor: Send + 'static {
	/// Wait for the next inbound connection. An error here is treated as permanent.
	async fn accept(&mut self) -> io::Result<Box<dyn NativeStream>>;
}

#[async_trait]
impl Acceptor for TcpListener {
	async fn accept(&mut self) -> io::Result<Box<dyn NativeStream>> {
		let (stream, addr) = TcpListener::accept(self).await?;
		debug!("accepted tcp connection from '{addr}'");
		stream.set_nodelay(true)?;
		Ok(Box::new(stream))
	}
}

#[async_trait]
impl Acceptor for Box<dyn Acceptor> {
	async fn accept(&mut self) -> io::Result<Box<dyn NativeStream>> {
		(**self).accept().await
	}
}

/// The set of service identifiers a medium is currently listening for.
#[derive(Debug, Clone, Default)]
pub(crate) struct BoundServices(Arc<Mutex<HashSet<String>>>);

impl BoundServices {
	/// Claim `service_id`, it is released again when the returned guard is dropped.
	pub(crate) fn claim(&self, service_id: &str) -> Result<BoundService, ListenError> {
		let mut bound = self.0.lock().unwrap_or_else(PoisonError::into_inner);
		if !bound.insert(service_id.to_string()) {
			return Err(ListenError::AlreadyBound(service_id.to_string()));
		}

		Ok(BoundService {
			services: self.clone(),
			service_id: service_id.to_string(),
		})
	}
}

#[derive(Debug)]
pub(crate) struct BoundService {
	services: BoundServices,
	service_id: String,
}

impl Drop for BoundService {
	fn drop(&mut self) {
		self.services
			.0
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.remove(&self.service_id);
	}
}

/// A listening endpoint which produces connected [`Socket`]'s.
///
/// Once the server socket is closed, or the native listener fails, it is finished for good:
/// every later [`ServerSocket::accept`] returns `None` straight away.
pub struct ServerSocket {
	service_id: String,
	local_addr: Option<ServiceAddress>,
	incoming: flume::Receiver<Socket>,
	shutdown: CancellationToken,
	terminated: AtomicBool,
	accept_loop: Mutex<Option<JoinHandle<()>>>,
	registration: Mutex<Option<BoundService>>,
}

impl fmt::Debug for ServerSocket {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ServerSocket")
			.field("service_id", &self.service_id)
			.field("local_addr", &self.local_addr)
			.field("terminated", &self.terminated.load(Ordering::Relaxed))
			.finish()
	}
}

impl ServerSocket {
	pub(crate) fn spawn(
		service_id: &str,
		local_addr: Option<ServiceAddress>,
		acceptor: impl Acceptor,
		registration: BoundService,
	) -> Self {
		// Rendezvous so we never hold accepted connections nobody asked for
		let (tx, rx) = flume::bounded(0);
		let shutdown = CancellationToken::new();

		let accept_loop = tokio::spawn(accept_loop(
			service_id.to_string(),
			acceptor,
			tx,
			shutdown.clone(),
		));

		Self {
			service_id: service_id.to_string(),
			local_addr,
			incoming: rx,
			shutdown,
			terminated: AtomicBool::new(false),
			accept_loop: Mutex::new(Some(accept_loop)),
			registration: Mutex::new(Some(registration)),
		}
	}

	pub fn service_id(&self) -> &str {
		&self.service_id
	}

	/// The address peers can reach this server socket on, if the transport has one.
	pub fn local_addr(&self) -> Option<&ServiceAddress> {
		self.local_addr.as_ref()
	}

	/// Wait for an inbound connection.
	///
	/// Returns `None` once the server socket is closed or the native listener failed.
	pub async fn accept(&self) -> Option<Socket> {
		if self.terminated.load(Ordering::Acquire) {
			return None;
		}

		let socket = tokio::select! {
			biased;
			() = self.shutdown.cancelled() => None,
			socket = self.incoming.recv_async() => socket.ok(),
		};

		if socket.is_none() {
			self.terminated.store(true, Ordering::Release);
		}
		socket
	}

	pub fn is_closed(&self) -> bool {
		self.terminated.load(Ordering::Acquire)
	}

	/// Stop listening and release the native listener.
	///
	/// Once this returns the listening resource has been dropped. Calling this more than once is a no-op.
	pub async fn close(&self) {
		self.terminated.store(true, Ordering::Release);
		self.shutdown.cancel();

		let accept_loop = self
			.accept_loop
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.take();
		if let Some(accept_loop) = accept_loop {
			if let Err(err) = accept_loop.await {
				warn!(
					"accept loop for service '{}' did not shut down cleanly: {err}",
					self.service_id
				);
			}
			debug!("closed server socket for service '{}'", self.service_id);
		}

		self.registration
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.take();
	}
}

impl Drop for ServerSocket {
	fn drop(&mut self) {
		self.shutdown.cancel();
	}
}

async fn accept_loop(
	service_id: String,
	mut acceptor: impl Acceptor,
	tx: flume::Sender<Socket>,
	shutdown: CancellationToken,
) {
	loop {
		let stream = tokio::select! {
			biased;
			() = shutdown.cancelled() => break,
			stream = acceptor.accept() => stream,
		};

		let socket = match stream {
			Ok(stream) => Socket::new(stream, None),
			Err(err) if is_transient(&err) => {
				debug!("dropping failed inbound connection for service '{service_id}': {err}");
				continue;
			}
			Err(err) => {
				warn!("listener for service '{service_id}' failed, no more connections will be accepted: {err}");
				break;
			}
		};

		// Dropping an undelivered socket cancels its streams
		let delivered = tokio::select! {
			biased;
			() = shutdown.cancelled() => false,
			result = tx.send_async(socket) => result.is_ok(),
		};
		if !delivered {
			break;
		}
	}

	debug!("accept loop for service '{service_id}' has stopped");
}

/// Errors which only concern the connection being accepted, not the listener.
fn is_transient(err: &io::Error) -> bool {
	matches!(
		err.kind(),
		io::ErrorKind::ConnectionAborted
			| io::ErrorKind::ConnectionReset
			| io::ErrorKind::Interrupted
			| io::ErrorKind::WouldBlock
	)
}
