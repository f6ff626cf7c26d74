//! RTSP (RFC 2326) session engine.
//!
//! Accepts RTSP connections, negotiates interleaved or UDP media transport,
//! and bridges media into a [`MediaBus`]. The same session machinery also
//! connects out to pull remote streams onto the bus or push local ones to
//! remote servers.

pub mod bus;
pub mod client;
pub mod config;
pub mod error;
pub mod hub;
pub mod monitor;
pub mod protocol;
pub mod server;
pub mod session;
pub mod transport;

pub use bus::{BusHooks, MediaBus, MediaPacket, PacketKind, PacketSink, TrackKind};
pub use config::{ServerConfig, SetupFailurePolicy};
pub use error::{Result, RtspError, TransportError};
pub use hub::StreamHub;
pub use monitor::{PullStatus, SessionInfo};
pub use protocol::auth::{Authenticator, StaticAuthenticator};
pub use server::{Server, ServerContext};
pub use session::{Role, Session, SessionRegistry, SessionState};
