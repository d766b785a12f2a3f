//! # Sync Types Crate
//!
//! The envelope model exchanged between nodes of the synchronization bus.
//!
//! ## Design Principles
//!
//! - **Envelope Authority**: the bus stamps `sender` on every outbound envelope;
//!   callers never set it themselves.
//! - **Opaque Payloads**: session events and snapshots travel as raw bytes. Only
//!   the list-shaped payloads are understood by the transport.
//! - **Case-Insensitive Identity**: node ids compare and hash without regard to
//!   ASCII case, matching how the broker names subscriptions.

pub mod envelope;
pub mod errors;
pub mod node_id;

pub use envelope::{Envelope, MessageType, Payload, PayloadKind};
pub use errors::TypesError;
pub use node_id::NodeId;
