//! Sonia Events - Broadcast event bus and typed runtime events.
//!
//! Components publish [`SoniaEvent`]s to an in-process [`EventBus`];
//! interested parties (UI stream, diagnostics, tests) subscribe and
//! receive every event in publish order.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod bus;
pub mod event;

pub use bus::{EventBus, EventReceiver, DEFAULT_CHANNEL_CAPACITY};
pub use event::SoniaEvent;
