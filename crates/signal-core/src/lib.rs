//! Core signalling overlay: dial/listen engines and relay router for the
//! p2p-webrtc-direct/star transport.
//!
//! This crate owns everything in-scope of the signalling overlay spec: the
//! data model (PID, address, signal envelope), the channel health monitor,
//! the dial and listen engines, the relay router, and the transport facade
//! that wires them together. The peer engine that actually drives
//! offer/answer/ICE is an external collaborator, consumed only through the
//! [`engine::PeerEngine`] trait — see [`testing::LoopEngine`] for the
//! in-memory stand-in this crate's own tests run against.

#![forbid(unsafe_code)]

pub mod address;
pub mod channel;
pub mod config;
pub mod connection;
pub mod dial;
pub mod engine;
pub mod error;
pub mod facade;
pub mod health;
pub mod listen;
pub mod rendezvous;
pub mod router;
pub mod testing;

pub use address::{Address, Pid};
pub use config::{NodeType, TransportConfig};
pub use connection::Connection;
pub use dial::{DialEngine, DialOptions};
pub use engine::{EngineError, EngineOptions, PeerEngine, PeerSession};
pub use error::{AddressError, DialError, ListenError, RouterError};
pub use facade::{Listener, Transport, TransportError};
pub use listen::{HttpListener, ListenEvent, SigListener};
pub use router::RelayRouter;
