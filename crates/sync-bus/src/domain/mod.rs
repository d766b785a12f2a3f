//! # Domain Layer
//!
//! Pure bus logic with no I/O: the wire message model, the envelope codec,
//! the per-node subscription filter, and the peer liveness table.

pub mod codec;
pub mod errors;
pub mod filter;
pub mod liveness;
pub mod wire;

pub use codec::{decode, decode_heartbeat, encode, encode_heartbeat, is_heartbeat, Heartbeat};
pub use errors::{BrokerError, BusError, CodecError};
pub use filter::{SubscriptionFilter, NODE_FILTER_RULE};
pub use liveness::LivenessTracker;
pub use wire::{Disposition, PropertyValue, ReceivedMessage, WireMessage};
