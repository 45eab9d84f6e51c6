//! rovpn configuration
//!
//! Carries everything the protocol engine needs to reach a server:
//! endpoint, carrier protocol, TLS material, optional tls-crypt key, the
//! data cipher preference list, and the identity strings advertised
//! during negotiation.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod client;
pub mod error;

pub use client::{
    ClientConfig, ControlCryptoConfig, Credentials, DeviceType, Platform, TransportProtocol,
};
pub use error::{ConfigError, Result};
