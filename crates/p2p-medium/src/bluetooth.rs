use std::{
	io,
	sync::{PoisonError, RwLock},
};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
	medium::{connect_with_cancel, MediumState},
	Acceptor, BluetoothConfig, ConnectError, DiscoveryCallbacks, DiscoverySink, ListenError,
	Medium, MediumKind, NativeStream, RegistrationError, ServerSocket, ServiceAddress,
	ServiceDescriptor, Socket,
};

/// The operating system's Bluetooth Classic radio.
///
/// Addresses handed to and returned from an adapter use the radio's MAC address as the host and the RFCOMM channel as the port.
#[async_trait]
pub trait BluetoothAdapter: Send + Sync + 'static {
	/// MAC address of the local radio.
	fn address(&self) -> String;

	/// Publish an SDP record for `descriptor`.
	async fn publish(&self, descriptor: &ServiceDescriptor) -> io::Result<()>;

	async fn unpublish(&self, descriptor: &ServiceDescriptor) -> io::Result<()>;

	/// Begin an inquiry scan, reporting nearby services into `sink` until [`BluetoothAdapter::stop_scan`].
	async fn start_scan(&self, sink: DiscoverySink) -> io::Result<()>;

	async fn stop_scan(&self) -> io::Result<()>;

	/// Open an RFCOMM connection.
	async fn connect(&self, address: &ServiceAddress) -> io::Result<Box<dyn NativeStream>>;

	/// Open an RFCOMM listener for `service_id`, returning the channel it is listening on.
	async fn listen(&self, service_id: &str) -> io::Result<(u16, Box<dyn Acceptor>)>;
}

/// Bluetooth Classic medium: SDP records for advertising, inquiry scans for discovery and RFCOMM for connections.
pub struct BluetoothClassicMedium<A: BluetoothAdapter> {
	adapter: A,
	config: BluetoothConfig,
	state: MediumState,
	listen_addr: RwLock<Option<ServiceAddress>>,
}

impl<A: BluetoothAdapter> BluetoothClassicMedium<A> {
	pub fn new(adapter: A, config: BluetoothConfig) -> Self {
		Self {
			adapter,
			config,
			state: MediumState::new(MediumKind::BluetoothClassic),
			listen_addr: RwLock::new(None),
		}
	}

	pub fn adapter(&self) -> &A {
		&self.adapter
	}
}

#[async_trait]
impl<A: BluetoothAdapter> Medium for BluetoothClassicMedium<A> {
	fn kind(&self) -> MediumKind {
		self.state.kind()
	}

	async fn start_advertising(&self, descriptor: &ServiceDescriptor) -> Result<(), RegistrationError> {
		self.state
			.start_advertising(descriptor, || async {
				self.adapter.publish(descriptor).await?;
				Ok(())
			})
			.await
	}

	async fn stop_advertising(&self, descriptor: &ServiceDescriptor) -> bool {
		self.state
			.stop_advertising(descriptor, || async {
				self.adapter.unpublish(descriptor).await?;
				Ok(())
			})
			.await
	}

	async fn start_discovery(&self, callbacks: DiscoveryCallbacks) -> Result<(), RegistrationError> {
		self.state
			.start_discovery(callbacks, |sink| async move {
				self.adapter.start_scan(sink).await?;
				Ok(())
			})
			.await
	}

	async fn stop_discovery(&self, callbacks: &DiscoveryCallbacks) -> bool {
		self.state
			.stop_discovery(callbacks, || async {
				self.adapter.stop_scan().await?;
				Ok(())
			})
			.await
	}

	async fn connect_to_service(
		&self,
		descriptor: &ServiceDescriptor,
		cancel: &CancellationToken,
	) -> Result<Socket, ConnectError> {
		let stream = connect_with_cancel(
			descriptor.name(),
			cancel,
			self.config.connect_timeout,
			self.adapter.connect(descriptor.address()),
		)
		.await?;
		debug!(
			"connected to '{}' over rfcomm at '{}'",
			descriptor.name(),
			descriptor.address()
		);

		Ok(Socket::new(stream, Some(descriptor.clone())))
	}

	async fn listen_for_service(&self, service_id: &str) -> Result<ServerSocket, ListenError> {
		let registration = self.state.claim_service(service_id)?;

		let (channel, acceptor) = self.adapter.listen(service_id).await?;
		let local_addr = ServiceAddress::new(self.adapter.address(), channel);
		debug!("listening for service '{service_id}' on rfcomm '{local_addr}'");

		*self
			.listen_addr
			.write()
			.unwrap_or_else(PoisonError::into_inner) = Some(local_addr.clone());

		Ok(ServerSocket::spawn(
			service_id,
			Some(local_addr),
			acceptor,
			registration,
		))
	}

	fn resolve_service(&self, host: &str, port: u16) -> Option<ServiceDescriptor> {
		self.state.resolve(host, port)
	}

	fn service_address(&self) -> Option<ServiceAddress> {
		self.listen_addr
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.clone()
	}
}
