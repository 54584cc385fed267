//! Fan-out of events to live subscribers
//!
//! Producers call [`Broadcaster::publish`]; each subscriber gets the event
//! independently and any subscriber that cannot take it is dropped.

mod event;
mod registry;

pub use event::{ClientCommand, Event};
pub use registry::{Broadcaster, DeliveryFailure, SubscriberChannel, Subscription};
