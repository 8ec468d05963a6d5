use std::{
	collections::{BTreeMap, HashMap},
	fmt,
	net::{IpAddr, Ipv6Addr, SocketAddr},
};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};

use crate::DescriptorError;

/// A single DNS-SD TXT string is length prefixed with one byte.
const MAX_TXT_STRING_LEN: usize = 255;

/// Where a service can be reached.
///
/// For the WiFi LAN medium `host` is an IP literal and `port` a TCP port.
/// For Bluetooth Classic `host` is the adapter's MAC address and `port` the RFCOMM channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceAddress {
	pub host: String,
	pub port: u16,
}

impl ServiceAddress {
	pub fn new(host: impl Into<String>, port: u16) -> Self {
		Self {
			host: host.into(),
			port,
		}
	}

	/// Returns the address as a [`SocketAddr`] if `host` is an IP literal.
	#[must_use]
	pub fn socket_addr(&self) -> Option<SocketAddr> {
		self.host
			.parse::<IpAddr>()
			.ok()
			.map(|ip| SocketAddr::new(ip, self.port))
	}
}

impl From<SocketAddr> for ServiceAddress {
	fn from(addr: SocketAddr) -> Self {
		Self::new(addr.ip().to_string(), addr.port())
	}
}

impl fmt::Display for ServiceAddress {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.host.parse::<Ipv6Addr>().is_ok() {
			write!(f, "[{}]:{}", self.host, self.port)
		} else {
			write!(f, "{}:{}", self.host, self.port)
		}
	}
}

/// An immutable description of a discoverable service.
///
/// Attributes carry opaque endpoint metadata owned by the layer above us, they are never interpreted here.
/// Two descriptors are equal when their name, address and every attribute are equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
	name: String,
	address: ServiceAddress,
	attributes: BTreeMap<String, Vec<u8>>,
}

impl ServiceDescriptor {
	pub fn new(name: impl Into<String>, address: ServiceAddress) -> Self {
		Self {
			name: name.into(),
			address,
			attributes: BTreeMap::new(),
		}
	}

	#[must_use]
	pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
		self.attributes.insert(key.into(), value.into());
		self
	}

	#[must_use]
	pub fn with_attributes(
		mut self,
		attributes: impl IntoIterator<Item = (String, Vec<u8>)>,
	) -> Self {
		self.attributes.extend(attributes);
		self
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn address(&self) -> &ServiceAddress {
		&self.address
	}

	pub fn attributes(&self) -> &BTreeMap<String, Vec<u8>> {
		&self.attributes
	}

	pub fn attribute(&self, key: &str) -> Option<&[u8]> {
		self.attributes.get(key).map(Vec::as_slice)
	}

	/// Encode the attributes as DNS-SD TXT properties.
	///
	/// Values are base64 encoded so arbitrary bytes survive the trip through resolvers which treat TXT values as text.
	pub fn to_txt_properties(&self) -> Result<HashMap<String, String>, DescriptorError> {
		self.attributes
			.iter()
			.map(|(key, value)| {
				if !is_valid_txt_key(key) {
					return Err(DescriptorError::InvalidKey(key.clone()));
				}

				let encoded = URL_SAFE_NO_PAD.encode(value);
				// `key=value`
				let len = key.len() + 1 + encoded.len();
				if len > MAX_TXT_STRING_LEN {
					return Err(DescriptorError::AttributeTooLong {
						key: key.clone(),
						len,
					});
				}

				Ok((key.clone(), encoded))
			})
			.collect()
	}

	/// Rebuild a descriptor from resolved DNS-SD TXT properties.
	pub fn from_txt_properties<K, V>(
		name: impl Into<String>,
		address: ServiceAddress,
		properties: impl IntoIterator<Item = (K, V)>,
	) -> Result<Self, DescriptorError>
	where
		K: Into<String>,
		V: AsRef<str>,
	{
		let attributes = properties
			.into_iter()
			.map(|(key, value)| {
				let key = key.into();
				match URL_SAFE_NO_PAD.decode(value.as_ref()) {
					Ok(value) => Ok((key, value)),
					Err(source) => Err(DescriptorError::InvalidEncoding { key, source }),
				}
			})
			.collect::<Result<BTreeMap<_, _>, _>>()?;

		Ok(Self {
			name: name.into(),
			address,
			attributes,
		})
	}

	pub fn to_bytes(&self) -> Result<Vec<u8>, DescriptorError> {
		Ok(rmp_serde::to_vec_named(self)?)
	}

	pub fn from_bytes(bytes: &[u8]) -> Result<Self, DescriptorError> {
		Ok(rmp_serde::from_slice(bytes)?)
	}
}

/// Strip the `.<service_type>` suffix off a DNS-SD fullname, leaving the instance name.
pub fn instance_name<'a>(fullname: &'a str, service_type: &str) -> Result<&'a str, DescriptorError> {
	fullname
		.strip_suffix(service_type)
		.and_then(|rest| rest.strip_suffix('.'))
		.filter(|name| !name.is_empty())
		.ok_or_else(|| DescriptorError::ForeignServiceType {
			fullname: fullname.to_string(),
			service_type: service_type.to_string(),
		})
}

// RFC 6763 section 6.4
fn is_valid_txt_key(key: &str) -> bool {
	!key.is_empty() && key.bytes().all(|b| (0x20..=0x7E).contains(&b) && b != b'=')
}
