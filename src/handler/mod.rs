//! Handler module - procedure registration and per-call state.
//!
//! Provides:
//! - [`HandlerRegistry`] - maps procedure names to handlers
//! - [`CallHandle`] - one inbound invocation: input, output, response
//!
//! # Example
//!
//! ```ignore
//! use function_shipper::handler::HandlerRegistry;
//!
//! let mut registry = HandlerRegistry::new();
//!
//! // Typed handler: input decoded and output encoded around the closure
//! registry.register_typed("bla_open", |args: OpenIn| async move {
//!     Ok(OpenOut { event_id: 232, ret: 0 })
//! })?;
//!
//! // Raw handler: drives the call handle itself
//! registry.register_fn("bla_close", bla_close)?;
//! ```

mod call;
mod registry;

pub use call::{CallHandle, CallState};
pub use registry::{
    BoxFuture, FnHandler, Handler, HandlerFn, HandlerRegistry, HandlerResult, TypedHandler,
};
