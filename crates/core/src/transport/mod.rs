//! Network transport layer for RTSP signaling and RTP media.
//!
//! - **TCP** ([`tcp`]): the listener loop and the per-connection read
//!   loop. Every connection is a [`DeadlineStream`] so a stalled peer
//!   cannot hold a session forever, and all of its writes go through one
//!   [`SessionWriter`].
//!
//! - **UDP** ([`udp`]): per-track RTP/RTCP socket pairs allocated from a
//!   wrapping port range.
//!
//! Interleaved media (RFC 2326 §10.12) shares the TCP connection with
//! signaling and is framed by [`crate::protocol::message`].

pub mod deadline;
pub mod tcp;
pub mod udp;
pub mod writer;

pub use deadline::{DeadlineStream, Traffic};
pub use udp::{PortAllocator, UdpPair};
pub use writer::SessionWriter;
