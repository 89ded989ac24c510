//! Peer connection lifecycle and mesh management

mod connection;
mod manager;
mod reconnect;

pub use connection::{ConnectionState, PeerConnection};
pub use manager::{PeerConnectionManager, PeerStatus};
pub use reconnect::ReconnectPolicy;
