//! Durable message stream collaborator
//!
//! This module provides:
//! - [`EventStream`] trait for pull consumers of task events
//! - [`StreamMessage`] with ack / nak / in-progress acknowledgements
//! - [`InMemoryEventStream`] with ack-wait redelivery for testing

mod memory;
mod message;

pub use memory::InMemoryEventStream;
pub use message::{Disposition, EventStream, MessageAcker, StreamError, StreamMessage};
