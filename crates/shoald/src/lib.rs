//! shoald: the Shoal daemon.
//!
//! A node is a handful of cooperating tasks around one shared catalog:
//! discovery announces us over UDP and learns who else is on the segment,
//! the transport keeps one TCP connection per peer, the router dispatches
//! everything those connections deliver, and the transfer engine pulls files
//! in chunks from whoever holds them. [`node::Node`] wires it all together;
//! the binary and the integration tests drive the same type.

pub mod discovery;
pub mod node;
pub mod router;
pub mod sync;
pub mod transfer;
pub mod transport;

pub use node::Node;
