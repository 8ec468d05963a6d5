//! An in-process stand-in for Bluetooth radios.
//!
//! Every [`MemoryAdapter`] created from the same [`Airspace`] can see and connect to the others, which makes it possible
//! to run the whole medium lifecycle inside a single test.

use std::{
	collections::HashMap,
	io,
	sync::{Arc, Mutex, PoisonError},
	time::Duration,
};

use async_trait::async_trait;
use tokio::{
	io::{duplex, DuplexStream},
	sync::mpsc,
};
use tracing::{debug, trace};

use crate::{
	Acceptor, BluetoothAdapter, DiscoverySink, NativeStream, ServiceAddress, ServiceDescriptor,
};

const BUFFER_SIZE: usize = 64 * 1024;

/// RFCOMM has 30 usable channels.
const MAX_CHANNEL: u16 = 30;

#[derive(Default)]
struct Air {
	/// Published records by the address of the adapter which published them.
	published: HashMap<String, ServiceDescriptor>,
	/// Running scans by the address of the adapter scanning.
	scanners: HashMap<String, DiscoverySink>,
	listeners: HashMap<ServiceAddress, mpsc::Sender<DuplexStream>>,
}

/// The shared medium radios created from it communicate over.
#[derive(Clone, Default)]
pub struct Airspace(Arc<Mutex<Air>>);

impl Airspace {
	pub fn new() -> Self {
		Self::default()
	}

	/// A radio with the MAC address `address`.
	pub fn adapter(&self, address: impl Into<String>) -> MemoryAdapter {
		MemoryAdapter {
			address: address.into(),
			air: self.clone(),
			connect_delay: Mutex::new(None),
			last_sink: Mutex::new(None),
		}
	}

	fn lock(&self) -> std::sync::MutexGuard<'_, Air> {
		self.0.lock().unwrap_or_else(PoisonError::into_inner)
	}
}

pub struct MemoryAdapter {
	address: String,
	air: Airspace,
	connect_delay: Mutex<Option<Duration>>,
	/// The sink of the most recent scan, kept after the scan stops.
	last_sink: Mutex<Option<DiscoverySink>>,
}

impl MemoryAdapter {
	/// Delay every following connect by `delay` before it reaches the remote listener.
	pub fn set_connect_delay(&self, delay: Option<Duration>) {
		*self
			.connect_delay
			.lock()
			.unwrap_or_else(PoisonError::into_inner) = delay;
	}

	/// Push a found event into the most recent scan, whether or not it has been stopped since.
	///
	/// This behaves like a native callback which was already in flight when the scan stopped.
	pub fn inject_found(&self, descriptor: ServiceDescriptor) -> bool {
		self.last_sink()
			.map_or(false, |sink| sink.found(descriptor))
	}

	/// The lost event counterpart of [`MemoryAdapter::inject_found`].
	pub fn inject_lost(&self, name: &str) -> bool {
		self.last_sink().map_or(false, |sink| sink.lost(name))
	}

	fn last_sink(&self) -> Option<DiscoverySink> {
		self.last_sink
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.clone()
	}
}

#[async_trait]
impl BluetoothAdapter for MemoryAdapter {
	fn address(&self) -> String {
		self.address.clone()
	}

	async fn publish(&self, descriptor: &ServiceDescriptor) -> io::Result<()> {
		let mut air = self.air.lock();
		air.published
			.insert(self.address.clone(), descriptor.clone());
		for (scanner, sink) in &air.scanners {
			if *scanner != self.address {
				sink.found(descriptor.clone());
			}
		}

		Ok(())
	}

	async fn unpublish(&self, descriptor: &ServiceDescriptor) -> io::Result<()> {
		let mut air = self.air.lock();
		if air.published.remove(&self.address).is_none() {
			return Err(io::Error::new(
				io::ErrorKind::NotFound,
				format!("'{}' was never published", descriptor.name()),
			));
		}
		for (scanner, sink) in &air.scanners {
			if *scanner != self.address {
				sink.lost(descriptor.name());
			}
		}

		Ok(())
	}

	async fn start_scan(&self, sink: DiscoverySink) -> io::Result<()> {
		let mut air = self.air.lock();
		for (publisher, descriptor) in &air.published {
			if *publisher != self.address {
				sink.found(descriptor.clone());
			}
		}
		air.scanners.insert(self.address.clone(), sink.clone());

		*self.last_sink.lock().unwrap_or_else(PoisonError::into_inner) = Some(sink);
		Ok(())
	}

	async fn stop_scan(&self) -> io::Result<()> {
		self.air.lock().scanners.remove(&self.address);
		Ok(())
	}

	async fn connect(&self, address: &ServiceAddress) -> io::Result<Box<dyn NativeStream>> {
		let delay = *self
			.connect_delay
			.lock()
			.unwrap_or_else(PoisonError::into_inner);
		if let Some(delay) = delay {
			trace!("delaying connect to '{address}' by {delay:?}");
			tokio::time::sleep(delay).await;
		}

		let listener = self.air.lock().listeners.get(address).cloned();
		let Some(listener) = listener else {
			return Err(io::Error::new(
				io::ErrorKind::ConnectionRefused,
				format!("nothing is listening on '{address}'"),
			));
		};

		let (local, remote) = duplex(BUFFER_SIZE);
		listener.send(remote).await.map_err(|_| {
			io::Error::new(
				io::ErrorKind::ConnectionRefused,
				format!("listener on '{address}' has closed"),
			)
		})?;

		Ok(Box::new(local))
	}

	async fn listen(&self, service_id: &str) -> io::Result<(u16, Box<dyn Acceptor>)> {
		let mut air = self.air.lock();
		let channel = (1..=MAX_CHANNEL)
			.find(|channel| {
				!air.listeners
					.contains_key(&ServiceAddress::new(self.address.clone(), *channel))
			})
			.ok_or_else(|| {
				io::Error::new(
					io::ErrorKind::AddrInUse,
					format!("no free rfcomm channel for '{service_id}'"),
				)
			})?;

		let address = ServiceAddress::new(self.address.clone(), channel);
		let (tx, rx) = mpsc::channel(8);
		air.listeners.insert(address.clone(), tx);
		debug!("'{service_id}' listening on '{address}'");

		Ok((
			channel,
			Box::new(MemoryAcceptor {
				address,
				incoming: rx,
				air: self.air.clone(),
			}),
		))
	}
}

struct MemoryAcceptor {
	address: ServiceAddress,
	incoming: mpsc::Receiver<DuplexStream>,
	air: Airspace,
}

#[async_trait]
impl Acceptor for MemoryAcceptor {
	async fn accept(&mut self) -> io::Result<Box<dyn NativeStream>> {
		match self.incoming.recv().await {
			Some(stream) => Ok(Box::new(stream)),
			None => Err(io::Error::new(
				io::ErrorKind::NotConnected,
				format!("listener on '{}' was removed", self.address),
			)),
		}
	}
}

impl Drop for MemoryAcceptor {
	fn drop(&mut self) {
		self.air.lock().listeners.remove(&self.address);
	}
}
