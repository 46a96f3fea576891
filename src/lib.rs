//! # peerlink
//!
//! A peer-to-peer SOCKS5 proxy data plane: a local SOCKS5 endpoint tunnels
//! client byte streams to a remote peer over a multiplexed transport, with
//! admission to the send queue governed by a pluggable AQM policy.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  SOCKS5 front-end / remote channel service (proxy)      │
//! ├─────────────────────────────────────────────────────────┤
//! │  Peer transport (negotiation, labelled data channels)   │
//! ├─────────────────────────────────────────────────────────┤
//! │  AQM (Null, TailDrop, RED with sentinel sampling)       │
//! ├─────────────────────────────────────────────────────────┤
//! │  Event queues (buffer-until-handled primitive)          │
//! ├─────────────────────────────────────────────────────────┤
//! │  SOCKS5 codec (pure compose/interpret functions)        │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! NAT traversal, transport security and consent management are external
//! collaborators: the transport hands signalling messages and encoded
//! frames to the embedder and accepts their counterparts back.

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

pub mod aqm;
pub mod error;
pub mod proxy;
pub mod queue;
pub mod socks;
pub mod transport;

pub use error::{Error, Result};

/// Default timeout for handshake operations (milliseconds)
pub const HANDSHAKE_TIMEOUT_MS: u64 = 10_000;
