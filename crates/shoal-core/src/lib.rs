//! shoal-core: wire protocol, content identity, and configuration.
//!
//! Everything in here is shared by the daemon and by anything that embeds a
//! node (tests, a future GUI shell). The only I/O is the config file.

pub mod config;
pub mod content;
pub mod protocol;

pub use content::FileId;
pub use protocol::{Beacon, Envelope, FileAdvert, Payload, ProtocolError};
