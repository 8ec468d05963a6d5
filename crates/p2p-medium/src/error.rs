use std::{io, sync::Arc};

use thiserror::Error;

/// Starting an advertisement or a discovery session failed.
#[derive(Debug, Error)]
pub enum RegistrationError {
	#[error("already advertising '{0}', stop it before advertising another service")]
	AlreadyAdvertising(String),
	#[error("discovery is already active on this medium")]
	AlreadyDiscovering,
	#[error("error with mdns registration: {0}")]
	Mdns(#[from] mdns_sd::Error),
	#[error("native adapter rejected the registration: {0}")]
	Adapter(#[from] io::Error),
	#[error(transparent)]
	Descriptor(#[from] DescriptorError),
}

/// An outbound connection could not be established.
///
/// Cancellation is its own variant so callers can tell "we gave up" apart from "the peer refused".
#[derive(Debug, Error)]
pub enum ConnectError {
	#[error("connection attempt was cancelled")]
	Cancelled,
	#[error("connection refused by '{0}'")]
	Refused(String),
	#[error("connection attempt timed out")]
	TimedOut,
	#[error("service '{0}' has no reachable address")]
	Unreachable(String),
	#[error("io error while connecting: {0}")]
	Io(#[from] io::Error),
}

impl ConnectError {
	#[must_use]
	pub fn is_cancelled(&self) -> bool {
		matches!(self, Self::Cancelled)
	}

	pub(crate) fn from_io(target: &str, err: io::Error) -> Self {
		match err.kind() {
			io::ErrorKind::ConnectionRefused => Self::Refused(target.to_string()),
			io::ErrorKind::TimedOut => Self::TimedOut,
			_ => Self::Io(err),
		}
	}
}

/// A listening endpoint could not be opened.
#[derive(Debug, Error)]
pub enum ListenError {
	#[error("service '{0}' is already being listened for on this medium")]
	AlreadyBound(String),
	#[error("io error while binding: {0}")]
	Io(#[from] io::Error),
}

/// Failure reported by a [`crate::InputStream`] or [`crate::OutputStream`].
///
/// `Io` holds the original error behind an `Arc` so a broken stream can hand the same failure back on every call.
#[derive(Debug, Clone, Error)]
pub enum StreamError {
	#[error("stream io failure: {0}")]
	Io(Arc<io::Error>),
	#[error("stream is closed")]
	Closed,
}

impl StreamError {
	#[must_use]
	pub fn is_io(&self) -> bool {
		matches!(self, Self::Io(_))
	}
}

impl From<io::Error> for StreamError {
	fn from(err: io::Error) -> Self {
		Self::Io(Arc::new(err))
	}
}

#[derive(Debug, Error)]
pub enum DescriptorError {
	#[error("attribute key '{0}' is not a valid TXT record key")]
	InvalidKey(String),
	#[error("attribute '{key}' does not fit in a single TXT record string ({len} bytes)")]
	AttributeTooLong { key: String, len: usize },
	#[error("attribute '{key}' is not valid base64: {source}")]
	InvalidEncoding {
		key: String,
		source: base64::DecodeError,
	},
	#[error("fullname '{fullname}' does not belong to service type '{service_type}'")]
	ForeignServiceType {
		fullname: String,
		service_type: String,
	},
	#[error("error encoding descriptor: {0}")]
	Encode(#[from] rmp_serde::encode::Error),
	#[error("error decoding descriptor: {0}")]
	Decode(#[from] rmp_serde::decode::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error(
		"the application name '{0}' is invalid. Must be alphanumeric or '-' only and at most 15 characters"
	)]
	InvalidAppName(String),
}
