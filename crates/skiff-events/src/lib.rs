//! Event stream and durable event store.

mod store;
mod stream;

pub use store::{EventStore, FileEventStore};
pub use stream::{
    EventCallback, EventFamily, EventFilter, EventStream, SubscriberKind, callback_fn,
};
