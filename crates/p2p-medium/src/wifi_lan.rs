use std::{
	collections::HashSet,
	net::{IpAddr, SocketAddr},
	sync::{Arc, Mutex, PoisonError, RwLock},
};

use async_trait::async_trait;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo, UnregisterStatus};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
	descriptor::instance_name,
	medium::{connect_with_cancel, MediumState},
	ConnectError, DiscoveryCallbacks, DiscoverySink, ListenError, Medium, MediumKind,
	RegistrationError, ServerSocket, ServiceAddress, ServiceDescriptor, Socket, WifiLanConfig,
};

/// Instance names this medium is currently advertising.
type OwnNames = Arc<RwLock<HashSet<String>>>;

/// Local network medium: DNS-SD over multicast DNS for advertising and discovery, TCP for connections.
/// Refer to [RFC 6762](https://datatracker.ietf.org/doc/html/rfc6762) and [RFC 6763](https://datatracker.ietf.org/doc/html/rfc6763) for more information about the protocol behind this system.
pub struct WifiLanMedium {
	config: WifiLanConfig,
	/// Started on first use so a medium which only connects never touches multicast.
	daemon: Mutex<Option<ServiceDaemon>>,
	state: MediumState,
	/// Filtered out of our own discovery results.
	own_names: OwnNames,
	listen_addr: RwLock<Option<ServiceAddress>>,
}

impl WifiLanMedium {
	pub fn new(config: WifiLanConfig) -> Self {
		Self {
			config,
			daemon: Mutex::new(None),
			state: MediumState::new(MediumKind::WifiLan),
			own_names: Arc::default(),
			listen_addr: RwLock::new(None),
		}
	}

	pub fn config(&self) -> &WifiLanConfig {
		&self.config
	}

	fn daemon(&self) -> Result<ServiceDaemon, RegistrationError> {
		let mut daemon = self.daemon.lock().unwrap_or_else(PoisonError::into_inner);
		match daemon.as_ref() {
			Some(daemon) => Ok(daemon.clone()),
			None => {
				let new = ServiceDaemon::new()?;
				debug!("started mdns daemon for '{}'", self.config.service_type);
				*daemon = Some(new.clone());
				Ok(new)
			}
		}
	}

	fn fullname(&self, descriptor: &ServiceDescriptor) -> String {
		format!("{}.{}", descriptor.name(), self.config.service_type)
	}
}

#[async_trait]
impl Medium for WifiLanMedium {
	fn kind(&self) -> MediumKind {
		self.state.kind()
	}

	async fn start_advertising(&self, descriptor: &ServiceDescriptor) -> Result<(), RegistrationError> {
		self.state
			.start_advertising(descriptor, || async {
				let address = descriptor.address();
				// A wildcard bind address means every interface, let the daemon fill them in
				let wildcard = address
					.host
					.parse::<IpAddr>()
					.map_or(false, |ip| ip.is_unspecified());

				let info = ServiceInfo::new(
					&self.config.service_type,
					descriptor.name(),
					&format!("{}.local.", descriptor.name()),
					if wildcard { "" } else { address.host.as_str() },
					address.port,
					descriptor.to_txt_properties()?,
				)?;
				let info = if wildcard {
					info.enable_addr_auto()
				} else {
					info
				};

				// Insert first so a fast resolver can't race us into discovering ourselves
				self.own_names
					.write()
					.unwrap_or_else(PoisonError::into_inner)
					.insert(descriptor.name().to_string());

				if let Err(err) = self.daemon().and_then(|daemon| Ok(daemon.register(info)?)) {
					self.own_names
						.write()
						.unwrap_or_else(PoisonError::into_inner)
						.remove(descriptor.name());
					return Err(err);
				}

				Ok(())
			})
			.await
	}

	async fn stop_advertising(&self, descriptor: &ServiceDescriptor) -> bool {
		self.state
			.stop_advertising(descriptor, || async {
				let status = self.daemon()?.unregister(&self.fullname(descriptor))?;
				match status.recv_async().await {
					Ok(UnregisterStatus::OK) => {}
					Ok(status) => warn!(
						"unexpected status unregistering '{}' from mdns: {status:?}",
						descriptor.name()
					),
					Err(_) => warn!("mdns daemon shut down before acknowledging the unregister"),
				}

				self.own_names
					.write()
					.unwrap_or_else(PoisonError::into_inner)
					.remove(descriptor.name());
				Ok(())
			})
			.await
	}

	async fn start_discovery(&self, callbacks: DiscoveryCallbacks) -> Result<(), RegistrationError> {
		self.state
			.start_discovery(callbacks, |sink| async move {
				let events = self.daemon()?.browse(&self.config.service_type)?;
				tokio::spawn(forward_mdns_events(
					events,
					sink,
					self.config.service_type.clone(),
					self.own_names.clone(),
				));
				Ok(())
			})
			.await
	}

	async fn stop_discovery(&self, callbacks: &DiscoveryCallbacks) -> bool {
		self.state
			.stop_discovery(callbacks, || async {
				self.daemon()?.stop_browse(&self.config.service_type)?;
				Ok(())
			})
			.await
	}

	async fn connect_to_service(
		&self,
		descriptor: &ServiceDescriptor,
		cancel: &CancellationToken,
	) -> Result<Socket, ConnectError> {
		let addr = descriptor
			.address()
			.socket_addr()
			.ok_or_else(|| ConnectError::Unreachable(descriptor.name().to_string()))?;

		let stream = connect_with_cancel(
			descriptor.name(),
			cancel,
			self.config.connect_timeout,
			TcpStream::connect(addr),
		)
		.await?;
		stream.set_nodelay(true)?;
		debug!("connected to '{}' at '{addr}'", descriptor.name());

		let (reader, writer) = stream.into_split();
		Ok(Socket::from_halves(reader, writer, Some(descriptor.clone())))
	}

	async fn listen_for_service(&self, service_id: &str) -> Result<ServerSocket, ListenError> {
		let registration = self.state.claim_service(service_id)?;

		let listener =
			TcpListener::bind(SocketAddr::new(self.config.bind_ip, self.config.listen_port)).await?;
		let local_addr = ServiceAddress::from(listener.local_addr()?);
		debug!("listening for service '{service_id}' on '{local_addr}'");

		*self
			.listen_addr
			.write()
			.unwrap_or_else(PoisonError::into_inner) = Some(local_addr.clone());

		Ok(ServerSocket::spawn(
			service_id,
			Some(local_addr),
			listener,
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

impl Drop for WifiLanMedium {
	fn drop(&mut self) {
		if let Some(daemon) = self
			.daemon
			.get_mut()
			.unwrap_or_else(PoisonError::into_inner)
			.take()
		{
			// Any advertisement still registered is announced as gone by the daemon as it shuts down
			if let Err(err) = daemon.shutdown() {
				warn!("error shutting down mdns daemon: {err}");
			}
		}
	}
}

/// Translate the daemon's browse events into discovery events until the browse is stopped.
async fn forward_mdns_events(
	events: mdns_sd::Receiver<ServiceEvent>,
	sink: DiscoverySink,
	service_type: String,
	own_names: OwnNames,
) {
	while let Ok(event) = events.recv_async().await {
		let delivered = match event {
			ServiceEvent::ServiceResolved(info) => {
				let name = match instance_name(info.get_fullname(), &service_type) {
					Ok(name) => name.to_string(),
					Err(err) => {
						warn!("ignoring resolved service: {err}");
						continue;
					}
				};

				// Prevent discovery of the current node.
				if own_names
					.read()
					.unwrap_or_else(PoisonError::into_inner)
					.contains(&name)
				{
					continue;
				}

				let Some(ip) = info.get_addresses().iter().min() else {
					warn!("resolved service '{name}' has no addresses");
					continue;
				};
				let address = ServiceAddress::new(ip.to_string(), info.get_port());

				let properties = info
					.get_properties()
					.iter()
					.map(|property| (property.key().to_string(), property.val_str().to_string()));
				match ServiceDescriptor::from_txt_properties(name, address, properties) {
					Ok(descriptor) => sink.found(descriptor),
					Err(err) => {
						warn!("ignoring service with malformed attributes: {err}");
						continue;
					}
				}
			}
			ServiceEvent::ServiceRemoved(_, fullname) => match instance_name(&fullname, &service_type) {
				Ok(name) => sink.lost(name),
				Err(err) => {
					warn!("ignoring removed service: {err}");
					continue;
				}
			},
			ServiceEvent::SearchStopped(_) => break,
			_ => continue,
		};

		// The discovery session is gone
		if !delivered {
			break;
		}
	}

	debug!("stopped forwarding mdns events for '{service_type}'");
}

#[cfg(test)]
mod tests {
	use std::{net::Ipv4Addr, time::Duration};

	use tokio::time::timeout;

	use super::*;

	fn loopback() -> WifiLanMedium {
		WifiLanMedium::new(WifiLanConfig {
			bind_ip: Ipv4Addr::LOCALHOST.into(),
			..Default::default()
		})
	}

	#[tokio::test]
	async fn test_listen_and_connect() {
		let server_medium = loopback();
		let client_medium = loopback();

		let server = server_medium.listen_for_service("chat").await.unwrap();
		let address = server.local_addr().cloned().unwrap();
		assert_eq!(server_medium.service_address(), Some(address.clone()));

		let descriptor = ServiceDescriptor::new("chat-host", address);
		let cancel = CancellationToken::new();
		let (accepted, connected) = tokio::join!(
			timeout(Duration::from_secs(5), server.accept()),
			client_medium.connect_to_service(&descriptor, &cancel),
		);
		let accepted = accepted.unwrap().expect("server should accept");
		let connected = connected.unwrap();
		assert_eq!(connected.remote_descriptor(), Some(&descriptor));
		assert!(accepted.remote_descriptor().is_none());

		{
			let mut output = connected.output_stream().await;
			output.write(b"hello").await.unwrap();
			output.flush().await.unwrap();
		}
		assert_eq!(accepted.input_stream().await.read(5).await.unwrap(), b"hello");

		connected.close().await;
		accepted.close().await;
		server.close().await;
	}

	#[tokio::test]
	async fn test_listen_twice_for_same_service() {
		let medium = loopback();
		let server = medium.listen_for_service("chat").await.unwrap();

		assert!(matches!(
			medium.listen_for_service("chat").await,
			Err(ListenError::AlreadyBound(_))
		));

		server.close().await;
		medium
			.listen_for_service("chat")
			.await
			.expect("service id should be released by close")
			.close()
			.await;
	}

	#[tokio::test]
	async fn test_connect_refused() {
		let medium = loopback();

		// Grab a free port and release it again
		let port = {
			let server = medium.listen_for_service("gone").await.unwrap();
			let port = server.local_addr().unwrap().port;
			server.close().await;
			port
		};

		let descriptor = ServiceDescriptor::new("gone", ServiceAddress::new("127.0.0.1", port));
		let result = medium
			.connect_to_service(&descriptor, &CancellationToken::new())
			.await;
		assert!(matches!(result, Err(ConnectError::Refused(_))), "{result:?}");
	}

	#[tokio::test]
	async fn test_connect_to_unroutable_host() {
		let medium = loopback();
		let descriptor =
			ServiceDescriptor::new("radio", ServiceAddress::new("AA:BB:CC:DD:EE:FF", 3));
		let result = medium
			.connect_to_service(&descriptor, &CancellationToken::new())
			.await;
		assert!(matches!(result, Err(ConnectError::Unreachable(name)) if name == "radio"));
	}

	#[tokio::test]
	#[ignore = "requires multicast networking"]
	async fn test_mdns_advertise_and_discover() {
		let advertiser = loopback();
		let browser = loopback();

		let descriptor = ServiceDescriptor::new(
			format!("svc-{}", std::process::id()),
			ServiceAddress::new("127.0.0.1", 4242),
		)
		.with_attribute("id", b"AB12".to_vec());
		advertiser.start_advertising(&descriptor).await.unwrap();

		let (tx, rx) = flume::unbounded();
		let callbacks = DiscoveryCallbacks::new(
			move |found| {
				let _ = tx.send(found.clone());
			},
			|_| {},
		);
		browser.start_discovery(callbacks.clone()).await.unwrap();

		let found = timeout(Duration::from_secs(10), async {
			loop {
				let found = rx.recv_async().await.unwrap();
				if found.name() == descriptor.name() {
					return found;
				}
			}
		})
		.await
		.unwrap();
		assert_eq!(found.attribute("id"), Some(&b"AB12"[..]));

		assert!(browser.stop_discovery(&callbacks).await);
		assert!(advertiser.stop_advertising(&descriptor).await);
	}
}
