//! Peer connectivity: data channels, signaling, negotiation and sessions.

pub mod channel;
#[cfg(test)]
pub mod memory;
pub mod negotiation;
mod rtc;
pub mod session;
pub mod signaling;

pub use channel::{Channel, ChannelError, ChannelEvent, ChannelFrame, ChannelState};
pub use negotiation::PeerIdentity;
pub use session::{ConnectError, PeerSession, SessionError, SessionEvent, SessionState};
pub use signaling::{LocalSignalingHub, Signaling, SignalingPayload};
