//! OpenVPN client protocol engine
//!
//! Implements the session layer of the OpenVPN wire protocol from the
//! client side: session packet framing, the reliable control channel,
//! optional tls-crypt wrapping, a TLS byte pump for mutual authentication
//! and key export, key-method-2 negotiation with OCC and PUSH exchange,
//! and the AEAD data channel with replay protection.
//!
//! The engine owns its socket but nothing else: tunnel devices, routing
//! and configuration parsing live with the caller. Everything is driven
//! cooperatively from a single task through [`VpnClient`].

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod client;
pub mod codec;
pub mod data;
pub mod demux;
pub mod error;
pub mod keying;
pub mod opcode;
pub mod options;
pub mod packet;
pub mod reliable;
pub mod tls;
pub mod transport;
pub mod wrap;

pub use client::{ClientState, InboundPacket, SessionSettings, VpnClient};
pub use codec::{PacketReader, PacketWriter};
pub use data::{classify_frame, DataChannel, TunnelFrame, PING_PAYLOAD};
pub use demux::{ConsumerId, SessionDemux};
pub use error::{ProtocolError, Result};
pub use keying::{KeyNegotiation, KeyingPhase};
pub use opcode::{combine, split, KeyId, OpCode};
pub use options::{
    build_occ_string, build_peer_info, parse_options, stringify_options, PushOptions, Topology,
};
pub use packet::{
    ControlHeader, DataHeader, SessionId, SessionPacket, SessionPacketHeader, MAX_ACKS,
};
pub use reliable::{OutgoingControl, ReliableChannel, ReliableConfig};
pub use tls::{load_certs_from_pem, load_key_from_pem, ControlCrypto, PlainCrypto, TlsClient};
pub use transport::Carrier;
pub use wrap::ControlWrap;
