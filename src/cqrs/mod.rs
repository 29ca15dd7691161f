//! Typed commands and events on top of the router.
//!
//! Buses marshal values into messages and publish them to a topic derived
//! from the value's name. Processors register one router handler per
//! command or event handler; each handler unmarshals the payload and calls
//! typed user code. A command has exactly one handler, an event may have
//! many.

use std::sync::Arc;

use crate::pubsub::Subscriber;
use crate::utils::error::Result;

mod command_bus;
mod command_processor;
mod event_bus;
mod event_processor;
pub mod marshaler;

pub use command_bus::{CommandBus, CommandBusBuilder};
pub use command_processor::{
    CommandHandler, CommandProcessor, CommandProcessorBuilder, FnCommandHandler, command_handler,
};
pub use event_bus::{EventBus, EventBusBuilder};
pub use event_processor::{
    EventHandler, EventProcessor, EventProcessorBuilder, FnEventHandler, event_handler,
};
pub use marshaler::{BincodeMarshaler, JsonMarshaler, Marshaler, NameStrategy};

/// Maps a command or event name to a topic.
pub type GenerateTopicFn = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Builds the subscriber of a processor handler from the handler's name.
pub type SubscriberConstructor = Arc<dyn Fn(&str) -> Result<Arc<dyn Subscriber>> + Send + Sync>;
