#![allow(dead_code)]

use std::time::Duration;

use sd_p2p_medium::{
	memory::{Airspace, MemoryAdapter},
	BluetoothClassicMedium, BluetoothConfig, DiscoveryCallbacks, ServiceAddress, ServiceDescriptor,
};

use tokio::{sync::mpsc, time::timeout};

/// How long we are willing to wait for something which should happen.
pub const EVENTUALLY: Duration = Duration::from_secs(2);

/// How long we watch for something which should never happen.
pub const QUIET_PERIOD: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Seen {
	Found(ServiceDescriptor),
	Lost(ServiceDescriptor),
}

/// Discovery callbacks which record everything they see, in order.
pub fn recorder() -> (DiscoveryCallbacks, mpsc::UnboundedReceiver<Seen>) {
	let (tx, rx) = mpsc::unbounded_channel();
	let lost_tx = tx.clone();
	let callbacks = DiscoveryCallbacks::new(
		move |descriptor| {
			let _ = tx.send(Seen::Found(descriptor.clone()));
		},
		move |descriptor| {
			let _ = lost_tx.send(Seen::Lost(descriptor.clone()));
		},
	);

	(callbacks, rx)
}

pub async fn next_seen(rx: &mut mpsc::UnboundedReceiver<Seen>) -> Seen {
	timeout(EVENTUALLY, rx.recv())
		.await
		.expect("timed out waiting for a discovery callback")
		.expect("callbacks were dropped")
}

pub async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<Seen>) {
	if let Ok(Some(seen)) = timeout(QUIET_PERIOD, rx.recv()).await {
		panic!("expected no discovery callback, got {seen:?}");
	}
}

pub fn bluetooth(air: &Airspace, mac: &str) -> BluetoothClassicMedium<MemoryAdapter> {
	BluetoothClassicMedium::new(air.adapter(mac), BluetoothConfig::default())
}

pub fn svc(address: ServiceAddress) -> ServiceDescriptor {
	ServiceDescriptor::new("svc", address).with_attribute("id", b"AB12".to_vec())
}
