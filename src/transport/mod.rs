//! Peer transport: a negotiated connection multiplexing labelled channels.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │                Application                     │
//! ├────────────────────────────────────────────────┤
//! │  DataChannel (labelled, chunked, AQM-gated)    │
//! ├────────────────────────────────────────────────┤
//! │  PeerConnection (negotiation, channel mux)     │
//! ├────────────────────────────────────────────────┤
//! │  Frame codec  ◄── wire (embedder-provided)     │
//! └────────────────────────────────────────────────┘
//! ```
//!
//! Signalling messages travel out of band through `signal_for_peer_queue`;
//! encoded frames leave through the connection's outbound queue and arrive
//! through `handle_frame`. NAT traversal and transport security belong to
//! whatever carries those bytes, not to this layer.

mod channel;
mod connection;
mod frame;
mod signalling;

pub use channel::DataChannel;
pub use connection::{AqmPolicy, ConnectionAddresses, PeerConnection, PeerConnectionConfig};
pub use frame::{Frame, FrameType, MAX_CHANNEL_PAYLOAD};
pub use signalling::{Candidate, SessionDescription, SignalMessage, SignalType};

/// Connection lifecycle. Transitions are monotonic: a connection or channel
/// only ever moves toward DISCONNECTED, which is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    /// Created; negotiation has not started.
    Waiting,
    /// Negotiation in flight.
    Connecting,
    /// Usable; channels can carry data.
    Connected,
    /// Terminal.
    Disconnected,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_ordering() {
        assert!(State::Waiting < State::Connecting);
        assert!(State::Connecting < State::Connected);
        assert!(State::Connected < State::Disconnected);
    }
}
