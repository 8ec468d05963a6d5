//! Transport mediums for Spacedrive's proximity networking.
//!
//! A [`Medium`] hides a local transport behind one contract: advertise a [`ServiceDescriptor`], discover the ones
//! advertised by nearby peers, listen for inbound connections with a [`ServerSocket`] and connect out to a discovered
//! service, yielding a [`Socket`] made up of an [`InputStream`] and an [`OutputStream`].
//!
//! Two transports are provided:
//! - [`WifiLanMedium`] which uses DNS-SD over multicast DNS and TCP;
//! - [`BluetoothClassicMedium`] which drives a [`BluetoothAdapter`], see [`memory`] for an in-process one.

#![warn(
	clippy::all,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	clippy::separated_literal_suffix,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

mod bluetooth;
mod config;
mod descriptor;
mod discovery;
mod error;
mod medium;
pub mod memory;
mod server;
mod socket;
mod stream;
mod wifi_lan;

pub use bluetooth::{BluetoothAdapter, BluetoothClassicMedium};
pub use config::{BluetoothConfig, WifiLanConfig};
pub use descriptor::{instance_name, ServiceAddress, ServiceDescriptor};
pub use discovery::{DiscoveryCallbacks, DiscoverySink};
pub use error::{
	ConfigError, ConnectError, DescriptorError, ListenError, RegistrationError, StreamError,
};
pub use medium::{Medium, MediumKind};
pub use server::{Acceptor, NativeStream, ServerSocket};
pub use socket::Socket;
pub use stream::{InputStream, OutputStream};
pub use wifi_lan::WifiLanMedium;

pub use tokio_util::sync::CancellationToken;
