use std::{
	net::{IpAddr, Ipv4Addr},
	time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// DNS-SD limits the service name portion of a service type to 15 characters (RFC 6763 section 7.2).
const MAX_APP_NAME_LEN: usize = 15;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WifiLanConfig {
	/// The DNS-SD service type we advertise and browse, eg. `_spacedrive._tcp.local.`.
	/// This must follow RFC 6763 section 7 "Service Names".
	pub service_type: String,
	/// The local address server sockets bind to and which is advertised to peers.
	pub bind_ip: IpAddr,
	/// `0` lets the OS pick a port for every server socket.
	pub listen_port: u16,
	/// `None` waits for the OS to give up on the connection attempt.
	pub connect_timeout: Option<Duration>,
}

impl Default for WifiLanConfig {
	fn default() -> Self {
		Self {
			service_type: "_spacedrive._tcp.local.".into(),
			bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
			listen_port: 0,
			connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
		}
	}
}

impl WifiLanConfig {
	/// Derive the service type from the application name.
	pub fn for_app(app_name: &str) -> Result<Self, ConfigError> {
		if app_name.is_empty()
			|| app_name.len() > MAX_APP_NAME_LEN
			|| !app_name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
		{
			return Err(ConfigError::InvalidAppName(app_name.to_string()));
		}

		Ok(Self {
			service_type: format!("_{app_name}._tcp.local."),
			..Default::default()
		})
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
	pub connect_timeout: Option<Duration>,
}

impl Default for BluetoothConfig {
	fn default() -> Self {
		Self {
			connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
		}
	}
}
