//! # Adapters Layer
//!
//! Implementations of the driven ports:
//!
//! - [`memory::InMemoryBroker`]: in-process topic broker
//! - [`time`]: wall clock and manually driven clock

pub mod memory;
pub mod time;

pub use memory::{IdleSweeper, InMemoryBroker, DEFAULT_MAX_DELIVERY_COUNT};
pub use time::{ManualTimeSource, SystemTimeSource};
