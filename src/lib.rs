//! # function-shipper
//!
//! Lightweight function-shipping RPC runtime.
//!
//! A caller invokes a named procedure on a remote peer; arguments and results
//! are marshalled by the proc engine and carried over any byte stream.
//!
//! ## Architecture
//!
//! - **Proc engine** (`proc`): one traversal per type for decode, encode and
//!   free; encodes spill once into an extra buffer when the inline buffer is
//!   too small
//! - **Handler registry** (`handler`): procedure name → handler, frozen after
//!   start-up
//! - **Call handle** (`handler::CallHandle`): one in-flight invocation and its
//!   single response
//! - **Dispatch loop** (`shipper`): accepts peers, queues their calls and
//!   services them one at a time with [`Shipper::process`]
//!
//! ## Example
//!
//! ```ignore
//! use function_shipper::{proc_struct, Shipper, TcpNetwork};
//!
//! #[derive(Debug, Default, Clone)]
//! struct Handle { cookie: u64 }
//! proc_struct!(Handle { cookie });
//!
//! #[derive(Debug, Default, Clone)]
//! struct OpenIn { path: String, handle: Handle }
//! proc_struct!(OpenIn { path, handle });
//!
//! #[derive(Debug, Default)]
//! struct OpenOut { event_id: u64, ret: i32 }
//! proc_struct!(OpenOut { event_id, ret });
//!
//! #[tokio::main]
//! async fn main() -> function_shipper::Result<()> {
//!     let network = TcpNetwork::bind("127.0.0.1:7000").await?;
//!     let mut shipper = Shipper::builder()
//!         .handle_typed("bla_open", |args: OpenIn| async move {
//!             Ok(OpenOut { event_id: 232, ret: 0 })
//!         })
//!         .start(network)?;
//!
//!     shipper.process(std::time::Duration::from_secs(10)).await?;
//!     shipper.finalize().await
//! }
//! ```

pub mod caller;
pub mod config;
pub mod error;
pub mod handler;
pub mod proc;
pub mod protocol;
pub mod shipper;
pub mod transport;
pub mod writer;

pub use caller::Caller;
pub use config::ShipperConfig;
pub use error::{Result, ShipperError};
pub use handler::{CallHandle, CallState, Handler, HandlerRegistry};
pub use proc::{MsgPack, Proc, ProcField, ProcMode, Seq};
pub use shipper::{CallOutcome, CallStatus, ServeStats, Shipper, ShipperBuilder, ShutdownHandle};
#[cfg(unix)]
pub use transport::PipeNetwork;
pub use transport::{MemoryNetwork, NetworkClass, PeerId, TcpNetwork};
