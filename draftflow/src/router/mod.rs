//! Message routing between the controller and stage executors.

mod bus;
mod handler;
mod mailbox;

pub use bus::{MessageRouter, RouterConfig, RouterStats, SubscriptionId, Topic};
pub use handler::{handler_fn, FnHandler, MessageHandler};
pub use mailbox::Mailbox;
