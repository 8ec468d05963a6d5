//! Delivery of native discovery notifications to the application.
//!
//! Native transports report services from threads we don't control. Instead of invoking the application's
//! callbacks from there, every event is pushed through a [`DiscoverySink`] onto a channel which is drained by a
//! delivery task owned by the medium. The delivery task invokes the callbacks while holding the session lock and
//! only if the event belongs to the current session generation, so once [`DiscoveryState::stop`] has taken the
//! session out of the lock no callback can run for it again.

use std::{
	collections::HashMap,
	fmt,
	future::Future,
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc, Mutex, PoisonError, RwLock,
	},
};

use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::{RegistrationError, ServiceAddress, ServiceDescriptor};

type ServiceCallback = Box<dyn Fn(&ServiceDescriptor) + Send + Sync>;

struct Callbacks {
	on_found: ServiceCallback,
	on_lost: ServiceCallback,
}

/// The pair of callbacks a discovery session reports to.
///
/// Registrations are compared by identity: stopping discovery requires a clone of the exact value which started it.
#[derive(Clone)]
pub struct DiscoveryCallbacks(Arc<Callbacks>);

impl DiscoveryCallbacks {
	pub fn new(
		on_found: impl Fn(&ServiceDescriptor) + Send + Sync + 'static,
		on_lost: impl Fn(&ServiceDescriptor) + Send + Sync + 'static,
	) -> Self {
		Self(Arc::new(Callbacks {
			on_found: Box::new(on_found),
			on_lost: Box::new(on_lost),
		}))
	}

	/// Whether `self` and `other` are the same registration (not merely equivalent closures).
	pub fn is_same(&self, other: &Self) -> bool {
		Arc::ptr_eq(&self.0, &other.0)
	}
}

impl fmt::Debug for DiscoveryCallbacks {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_tuple("DiscoveryCallbacks")
			.field(&Arc::as_ptr(&self.0))
			.finish()
	}
}

#[derive(Debug)]
enum NativeEvent {
	Found(ServiceDescriptor),
	/// Native transports usually only know the instance name of a service which disappeared.
	Lost(String),
}

/// Handed to a native transport when discovery starts so it can report what it sees.
///
/// The sink may outlive the session it was created for, events sent after the session stopped are discarded.
#[derive(Debug, Clone)]
pub struct DiscoverySink {
	generation: u64,
	tx: flume::Sender<NativeEvent>,
}

impl DiscoverySink {
	/// Report a service appearing, or changing its attributes.
	/// Returns `false` if the session this sink belonged to is gone.
	pub fn found(&self, descriptor: ServiceDescriptor) -> bool {
		self.tx.send(NativeEvent::Found(descriptor)).is_ok()
	}

	/// Report the service with the instance name `name` disappearing.
	pub fn lost(&self, name: impl Into<String>) -> bool {
		self.tx.send(NativeEvent::Lost(name.into())).is_ok()
	}

	pub fn generation(&self) -> u64 {
		self.generation
	}
}

struct Session {
	generation: u64,
	callbacks: DiscoveryCallbacks,
	/// What this session has reported as found, by instance name.
	found: HashMap<String, ServiceDescriptor>,
	delivery: JoinHandle<()>,
}

#[derive(Default)]
struct Shared {
	session: Mutex<Option<Session>>,
	/// Every service ever reported as found, kept for address lookups.
	known: RwLock<HashMap<ServiceAddress, ServiceDescriptor>>,
}

impl Shared {
	/// Hand one event to the callbacks. Returns `false` once `generation` is no longer the active session.
	fn dispatch(&self, generation: u64, event: NativeEvent) -> bool {
		let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
		let Some(session) = session
			.as_mut()
			.filter(|session| session.generation == generation)
		else {
			trace!("dropping discovery event from stale session {generation}: {event:?}");
			return false;
		};

		match event {
			NativeEvent::Found(descriptor) => {
				if session.found.get(descriptor.name()) == Some(&descriptor) {
					trace!("ignoring re-announcement of '{}'", descriptor.name());
					return true;
				}

				let previous = session
					.found
					.insert(descriptor.name().to_string(), descriptor.clone());

				let mut known = self.known.write().unwrap_or_else(PoisonError::into_inner);
				// The service moved, its old address no longer resolves to it
				if let Some(previous) = previous.filter(|p| p.address() != descriptor.address()) {
					known.remove(previous.address());
				}
				known.insert(descriptor.address().clone(), descriptor.clone());
				drop(known);

				debug!("discovered service '{}' at '{}'", descriptor.name(), descriptor.address());
				(session.callbacks.0.on_found)(&descriptor);
			}
			NativeEvent::Lost(name) => match session.found.remove(&name) {
				Some(descriptor) => {
					debug!("lost service '{}'", descriptor.name());
					(session.callbacks.0.on_lost)(&descriptor);
				}
				// A lost event must never overtake its found event
				None => trace!("ignoring lost event for '{name}' which was never reported as found"),
			},
		}

		true
	}
}

/// The discovery half of a medium's lifecycle: `Idle <-> Discovering`.
pub(crate) struct DiscoveryState {
	/// Serializes start and stop.
	op: tokio::sync::Mutex<()>,
	generation: AtomicU64,
	shared: Arc<Shared>,
}

impl DiscoveryState {
	pub(crate) fn new() -> Self {
		Self {
			op: tokio::sync::Mutex::new(()),
			generation: AtomicU64::new(0),
			shared: Arc::default(),
		}
	}

	pub(crate) fn is_active(&self) -> bool {
		self.shared
			.session
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.is_some()
	}

	/// Look up a previously discovered service by its address.
	pub(crate) fn resolve(&self, address: &ServiceAddress) -> Option<ServiceDescriptor> {
		self.shared
			.known
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.get(address)
			.cloned()
	}

	/// Start a session. `subscribe` performs the native subscription and is handed the sink events must be pushed into.
	pub(crate) async fn start<F, Fut>(
		&self,
		callbacks: DiscoveryCallbacks,
		subscribe: F,
	) -> Result<(), RegistrationError>
	where
		F: FnOnce(DiscoverySink) -> Fut,
		Fut: Future<Output = Result<(), RegistrationError>>,
	{
		let _op = self.op.lock().await;
		if self.is_active() {
			return Err(RegistrationError::AlreadyDiscovering);
		}

		let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
		let (tx, rx) = flume::unbounded();
		subscribe(DiscoverySink { generation, tx }).await?;

		{
			// Held while spawning so the delivery task can't observe the slot before it's filled
			let mut session = self
				.shared
				.session
				.lock()
				.unwrap_or_else(PoisonError::into_inner);
			let delivery = tokio::spawn(deliver(generation, rx, self.shared.clone()));
			*session = Some(Session {
				generation,
				callbacks,
				found: HashMap::new(),
				delivery,
			});
		}

		debug!("started discovery session {generation}");
		Ok(())
	}

	/// Stop the session started with `callbacks`.
	///
	/// Returns `false`, leaving discovery untouched, if nothing is running or `callbacks` belongs to another registration.
	/// When this returns `true` no callback of the session is running and none will run again.
	pub(crate) async fn stop<F, Fut>(&self, callbacks: &DiscoveryCallbacks, unsubscribe: F) -> bool
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<(), RegistrationError>>,
	{
		let _op = self.op.lock().await;

		let session = {
			let mut session = self
				.shared
				.session
				.lock()
				.unwrap_or_else(PoisonError::into_inner);
			let is_same = match session.as_ref() {
				Some(active) => active.callbacks.is_same(callbacks),
				None => return false,
			};
			if !is_same {
				debug!("ignoring request to stop discovery with callbacks of another registration");
				return false;
			}
			session.take()
		};

		let Some(session) = session else {
			return false;
		};
		session.delivery.abort();

		if let Err(err) = unsubscribe().await {
			warn!(
				"error stopping native discovery for session {}: {err}",
				session.generation
			);
		}

		debug!("stopped discovery session {}", session.generation);
		true
	}
}

async fn deliver(generation: u64, rx: flume::Receiver<NativeEvent>, shared: Arc<Shared>) {
	while let Ok(event) = rx.recv_async().await {
		if !shared.dispatch(generation, event) {
			break;
		}
	}
}
