//! Command registration, validation and dispatch.

pub mod consumer;
pub mod dispatcher;
pub mod registry;

pub use consumer::CommandConsumer;
pub use dispatcher::CommandDispatcher;
pub use registry::{BoundArgs, CommandRegistry, CommandSpec, Handler, ParamType};
