//! # quartzite-ist: Incremental state transfer
//!
//! IST closes the gap between a joiner's last committed seqno and the
//! group's current position by replaying the missing write-sets out of a
//! donor's cache, optionally preceded by a preload range that rebuilds the
//! joiner's certification index.
//!
//! - [`proto`]: the framed wire protocol and transfer dialog
//! - [`sender`]: donor-side replay ([`Sender`], [`SenderPool`])
//! - [`receiver`]: the joiner's listening endpoint ([`Receiver`])
//! - [`endpoint`]: `(tcp|ssl)://host:port` resolution and streams

pub mod endpoint;
pub mod error;
pub mod proto;
pub mod receiver;
pub mod sender;

pub use endpoint::{Endpoint, Scheme, Stream, TlsConfig};
pub use error::{Error, Result};
pub use proto::{Frame, IdentityCodec, MsgKind, Proto, WriteSetCodec, FLAG_PRELOAD, WIRE_VER_CURRENT};
pub use receiver::{EventHandler, Receiver, ReceiverConfig};
pub use sender::{Sender, SenderPool};

// ============================================================================
// Tests
// ============================================================================
