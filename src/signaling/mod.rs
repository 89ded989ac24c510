//! WebRTC signaling over a shared room mailbox
//!
//! Peers never talk to each other directly during negotiation; every
//! offer, answer, and ICE candidate is written into a room-scoped
//! mailbox and consumed by its addressee. The [`MailboxStore`] trait is
//! the seam to the backing document store; [`MemoryMailbox`] is the
//! in-process implementation used by tests and single-process rooms.

mod channel;
mod mailbox;
mod message;

pub use channel::SignalingChannel;
pub use mailbox::{MailboxStore, MemoryMailbox};
pub use message::{
    epoch_millis, IncomingSignal, SignalKind, SignalMessage, DEFAULT_SIGNAL_TTL_MS,
};
