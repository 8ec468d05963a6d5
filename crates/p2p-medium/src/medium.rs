use std::{fmt, future::Future, io, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
	discovery::DiscoveryState,
	server::{BoundService, BoundServices},
	ConnectError, DiscoveryCallbacks, DiscoverySink, ListenError, RegistrationError, ServerSocket,
	ServiceAddress, ServiceDescriptor, Socket,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediumKind {
	WifiLan,
	BluetoothClassic,
}

impl fmt::Display for MediumKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::WifiLan => write!(f, "wifi-lan"),
			Self::BluetoothClassic => write!(f, "bluetooth-classic"),
		}
	}
}

/// The operations every transport exposes to the connection layer above it.
///
/// Advertising and discovery are two independent state machines (`Idle <-> Advertising` and `Idle <-> Discovering`),
/// they may be active at the same time.
#[async_trait]
pub trait Medium: Send + Sync {
	fn kind(&self) -> MediumKind;

	/// Make `descriptor` discoverable by peers.
	///
	/// Advertising the descriptor which is already being advertised succeeds without doing anything.
	async fn start_advertising(&self, descriptor: &ServiceDescriptor) -> Result<(), RegistrationError>;

	/// Returns `true` once `descriptor` is no longer being advertised.
	/// Returns `false` if it wasn't being advertised in the first place.
	async fn stop_advertising(&self, descriptor: &ServiceDescriptor) -> bool;

	/// Start reporting services appearing and disappearing to `callbacks`.
	///
	/// Callbacks are invoked from a task owned by the medium, they must not stop discovery synchronously.
	async fn start_discovery(&self, callbacks: DiscoveryCallbacks) -> Result<(), RegistrationError>;

	/// Returns `true` once discovery is well and truly stopped, after which the callbacks are never invoked again.
	///
	/// `callbacks` must be the registration passed to [`Medium::start_discovery`], otherwise this does nothing and returns `false`.
	async fn stop_discovery(&self, callbacks: &DiscoveryCallbacks) -> bool;

	/// Open a connection to a discovered service.
	///
	/// Cancelling `cancel` aborts the attempt with [`ConnectError::Cancelled`], even if the transport connects afterwards.
	async fn connect_to_service(
		&self,
		descriptor: &ServiceDescriptor,
		cancel: &CancellationToken,
	) -> Result<Socket, ConnectError>;

	/// Listen for inbound connections for `service_id`. A service can only be listened for once per medium.
	async fn listen_for_service(&self, service_id: &str) -> Result<ServerSocket, ListenError>;

	/// Find a previously discovered service by its address.
	fn resolve_service(&self, host: &str, port: u16) -> Option<ServiceDescriptor>;

	/// The address this medium accepts connections on, if it is listening.
	fn service_address(&self) -> Option<ServiceAddress>;
}

/// Transport agnostic lifecycle state, each medium implementation owns one and supplies the native steps.
pub(crate) struct MediumState {
	kind: MediumKind,
	/// Serializes start and stop of advertising, holding the active registration.
	advertising: tokio::sync::Mutex<Option<ServiceDescriptor>>,
	discovery: DiscoveryState,
	bound: BoundServices,
}

impl MediumState {
	pub(crate) fn new(kind: MediumKind) -> Self {
		Self {
			kind,
			advertising: tokio::sync::Mutex::new(None),
			discovery: DiscoveryState::new(),
			bound: BoundServices::default(),
		}
	}

	pub(crate) fn kind(&self) -> MediumKind {
		self.kind
	}

	pub(crate) async fn start_advertising<F, Fut>(
		&self,
		descriptor: &ServiceDescriptor,
		publish: F,
	) -> Result<(), RegistrationError>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<(), RegistrationError>>,
	{
		let mut active = self.advertising.lock().await;
		match active.as_ref() {
			Some(active) if active == descriptor => return Ok(()),
			Some(active) => {
				return Err(RegistrationError::AlreadyAdvertising(
					active.name().to_string(),
				))
			}
			None => {}
		}

		publish().await?;

		*active = Some(descriptor.clone());
		debug!("{} started advertising '{}'", self.kind, descriptor.name());
		Ok(())
	}

	pub(crate) async fn stop_advertising<F, Fut>(
		&self,
		descriptor: &ServiceDescriptor,
		unpublish: F,
	) -> bool
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<(), RegistrationError>>,
	{
		let mut active = self.advertising.lock().await;
		if active.as_ref() != Some(descriptor) {
			return false;
		}

		if let Err(err) = unpublish().await {
			warn!(
				"{} failed to stop advertising '{}': {err}",
				self.kind,
				descriptor.name()
			);
			return false;
		}

		*active = None;
		debug!("{} stopped advertising '{}'", self.kind, descriptor.name());
		true
	}

	pub(crate) async fn start_discovery<F, Fut>(
		&self,
		callbacks: DiscoveryCallbacks,
		subscribe: F,
	) -> Result<(), RegistrationError>
	where
		F: FnOnce(DiscoverySink) -> Fut,
		Fut: Future<Output = Result<(), RegistrationError>>,
	{
		self.discovery.start(callbacks, subscribe).await
	}

	pub(crate) async fn stop_discovery<F, Fut>(
		&self,
		callbacks: &DiscoveryCallbacks,
		unsubscribe: F,
	) -> bool
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<(), RegistrationError>>,
	{
		self.discovery.stop(callbacks, unsubscribe).await
	}

	pub(crate) fn resolve(&self, host: &str, port: u16) -> Option<ServiceDescriptor> {
		self.discovery.resolve(&ServiceAddress::new(host, port))
	}

	pub(crate) fn claim_service(&self, service_id: &str) -> Result<BoundService, ListenError> {
		self.bound.claim(service_id)
	}
}

/// Race a native connect against `cancel` and an optional deadline.
///
/// Cancellation always wins: if `cancel` fires the connection is dropped even when the transport managed to connect.
pub(crate) async fn connect_with_cancel<T>(
	target: &str,
	cancel: &CancellationToken,
	deadline: Option<Duration>,
	connect: impl Future<Output = io::Result<T>>,
) -> Result<T, ConnectError> {
	if cancel.is_cancelled() {
		return Err(ConnectError::Cancelled);
	}

	let attempt = async {
		match deadline {
			Some(deadline) => match timeout(deadline, connect).await {
				Ok(result) => result.map_err(|err| ConnectError::from_io(target, err)),
				Err(_) => Err(ConnectError::TimedOut),
			},
			None => connect
				.await
				.map_err(|err| ConnectError::from_io(target, err)),
		}
	};

	let result = tokio::select! {
		biased;
		() = cancel.cancelled() => Err(ConnectError::Cancelled),
		result = attempt => result,
	};

	match result {
		Ok(_) if cancel.is_cancelled() => Err(ConnectError::Cancelled),
		Err(ConnectError::Cancelled) => {
			debug!("connection attempt to '{target}' was cancelled");
			Err(ConnectError::Cancelled)
		}
		result => result,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn descriptor(name: &str) -> ServiceDescriptor {
		ServiceDescriptor::new(name, ServiceAddress::new("10.0.0.5", 4242))
	}

	#[tokio::test]
	async fn test_advertising_state_machine() {
		let state = MediumState::new(MediumKind::WifiLan);
		let svc = descriptor("svc");

		assert!(!state.stop_advertising(&svc, || async { Ok(()) }).await);

		state
			.start_advertising(&svc, || async { Ok(()) })
			.await
			.unwrap();

		// Same registration again is fine, a different one conflicts
		state
			.start_advertising(&svc, || async { Ok(()) })
			.await
			.unwrap();
		let err = state
			.start_advertising(&descriptor("other"), || async { Ok(()) })
			.await
			.unwrap_err();
		assert!(matches!(err, RegistrationError::AlreadyAdvertising(name) if name == "svc"));

		assert!(!state.stop_advertising(&descriptor("other"), || async { Ok(()) }).await);
		assert!(state.stop_advertising(&svc, || async { Ok(()) }).await);
		assert!(!state.stop_advertising(&svc, || async { Ok(()) }).await);
	}

	#[tokio::test]
	async fn test_failed_publish_stays_idle() {
		let state = MediumState::new(MediumKind::BluetoothClassic);
		let svc = descriptor("svc");

		let result = state
			.start_advertising(&svc, || async {
				Err(RegistrationError::Adapter(io::ErrorKind::NotConnected.into()))
			})
			.await;
		assert!(result.is_err());
		assert!(!state.stop_advertising(&svc, || async { Ok(()) }).await);
	}

	#[tokio::test]
	async fn test_cancel_before_connect() {
		let cancel = CancellationToken::new();
		cancel.cancel();

		let result = connect_with_cancel("svc", &cancel, None, async { Ok(()) }).await;
		assert!(matches!(result, Err(ConnectError::Cancelled)));
	}

	#[tokio::test]
	async fn test_cancel_during_connect() {
		let cancel = CancellationToken::new();
		let connect = {
			let cancel = cancel.clone();
			async move {
				cancel.cancel();
				// The transport "succeeds" after cancellation was observed
				Ok(())
			}
		};

		let result = connect_with_cancel("svc", &cancel, None, connect).await;
		assert!(result.unwrap_err().is_cancelled());
	}

	#[tokio::test]
	async fn test_connect_errors() {
		let cancel = CancellationToken::new();

		let refused = connect_with_cancel::<()>("svc", &cancel, None, async {
			Err(io::ErrorKind::ConnectionRefused.into())
		})
		.await;
		assert!(matches!(refused, Err(ConnectError::Refused(target)) if target == "svc"));

		let timed_out = connect_with_cancel::<()>(
			"svc",
			&cancel,
			Some(Duration::from_millis(10)),
			std::future::pending(),
		)
		.await;
		assert!(matches!(timed_out, Err(ConnectError::TimedOut)));
	}
}
