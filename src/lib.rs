//! A header-addressed message bus for composing multi-party computation (MPC) protocols.
//!
//! MPC pipelines are built from many sub-protocols (oblivious transfer, VOLE, secret sharing,
//! ...) which run nested in each other and often concurrently, but all talk to the other parties
//! over one logical channel. This crate provides the transport substrate that makes this work:
//! every message carries a [`header::Header`] naming the session, protocol, step and round it
//! belongs to, and incoming messages are demultiplexed to whichever consumer waits for them.
//!
//! ## Main Components
//!
//! * [`header`] and [`packet`]: The routing key and the immutable message envelope.
//! * [`mailbox`]: The concurrent store handing received packets to waiting consumers, either by
//!   exact header or as the next packet of a sender.
//! * [`rpc`]: The endpoint of a party, with connection lifecycle, a synchronization barrier and
//!   traffic statistics, built on a pluggable [`transport`].
//! * [`session`]: The lifecycle of a protocol instance, sub-protocol namespaces ([`namespace`])
//!   and recoverable aborts when another party sends invalid data.
//! * [`registry`]: The process-wide registry of protocol descriptions.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//!
//! use mpc_bus::{
//!     header::PartyId,
//!     namespace::SessionId,
//!     registry::ProtocolDescription,
//!     rpc::{Rpc, RpcConfig},
//!     session::Session,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let coin_toss = ProtocolDescription::register(17, "coin-toss", 2)?;
//! let parties = [PartyId(0), PartyId(1)];
//! let [rpc0, rpc1] = Rpc::simulated(&parties, RpcConfig::default()).try_into().unwrap();
//! let (rpc0, rpc1) = (Arc::new(rpc0), Arc::new(rpc1));
//! rpc0.connect().await?;
//! rpc1.connect().await?;
//!
//! let mut alice = Session::new(rpc0, coin_toss, SessionId::root(1));
//! let mut bob = Session::new(rpc1, coin_toss, SessionId::root(1));
//! alice.send_value(0, PartyId(1), &42u64).await?;
//! let received: u64 = bob.receive_value(0, PartyId(0)).await?;
//! assert_eq!(received, 42);
//! # Ok(())
//! # }
//! ```
#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod codec;
pub mod header;
pub mod mailbox;
pub mod namespace;
pub mod packet;
pub mod registry;
pub mod rpc;
pub mod session;
pub mod transport;

mod error;

pub use error::{AbortReason, Error};
