//! Handler registry for dispatching calls by procedure name.
//!
//! The registry is filled through `&mut` during start-up and then frozen in
//! an `Arc` by the shipper, so every lookup afterwards is a shared read of a
//! fully built table.
//!
//! # Example
//!
//! ```
//! use function_shipper::handler::{BoxFuture, CallHandle, HandlerRegistry, HandlerResult};
//!
//! fn ping(call: &mut CallHandle) -> BoxFuture<'_, HandlerResult> {
//!     Box::pin(async move { call.respond_with(&mut 0u32).await })
//! }
//!
//! let mut registry = HandlerRegistry::new();
//! registry.register_fn("ping", ping).unwrap();
//! registry
//!     .register_typed("double", |n: u64| async move { Ok(n * 2) })
//!     .unwrap();
//!
//! assert!(registry.resolve("ping").is_ok());
//! assert!(registry.register_fn("ping", ping).is_err());
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use super::CallHandle;
use crate::error::{Result, ShipperError};
use crate::proc::{decode_value, release_value, ProcField};

/// Result type for handler functions.
pub type HandlerResult = Result<()>;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Plain function handler signature.
pub type HandlerFn = for<'a> fn(&'a mut CallHandle) -> BoxFuture<'a, HandlerResult>;

/// Server-side implementation of one procedure.
///
/// The handler owns the whole call: it decodes its arguments from
/// [`CallHandle::input`], runs, and responds through the handle. If it
/// returns without responding, the dispatch loop answers with an error frame.
pub trait Handler: Send + Sync + 'static {
    /// Handle one call.
    fn call<'a>(&'a self, call: &'a mut CallHandle) -> BoxFuture<'a, HandlerResult>;
}

/// Adapter for [`HandlerFn`] items.
pub struct FnHandler(HandlerFn);

impl FnHandler {
    pub fn new(f: HandlerFn) -> Self {
        Self(f)
    }
}

impl Handler for FnHandler {
    fn call<'a>(&'a self, call: &'a mut CallHandle) -> BoxFuture<'a, HandlerResult> {
        (self.0)(call)
    }
}

/// Wrapper that decodes typed input and encodes typed output around an
/// async function.
///
/// The decoded arguments stay with the wrapper and the function gets a copy.
/// Once the call has responded, or the function has failed, the arguments
/// get their free pass. Input that fails to decode is released before the
/// error is returned.
pub struct TypedHandler<F, In, Out, Fut>
where
    F: Fn(In) -> Fut + Send + Sync + 'static,
    In: ProcField + Default + Clone + Send + 'static,
    Out: ProcField + Send + 'static,
    Fut: Future<Output = Result<Out>> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn(In) -> Fut>,
}

impl<F, In, Out, Fut> TypedHandler<F, In, Out, Fut>
where
    F: Fn(In) -> Fut + Send + Sync + 'static,
    In: ProcField + Default + Clone + Send + 'static,
    Out: ProcField + Send + 'static,
    Fut: Future<Output = Result<Out>> + Send + 'static,
{
    /// Create a new typed handler.
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, In, Out, Fut> Handler for TypedHandler<F, In, Out, Fut>
where
    F: Fn(In) -> Fut + Send + Sync + 'static,
    In: ProcField + Default + Clone + Send + 'static,
    Out: ProcField + Send + 'static,
    Fut: Future<Output = Result<Out>> + Send + 'static,
{
    fn call<'a>(&'a self, call: &'a mut CallHandle) -> BoxFuture<'a, HandlerResult> {
        Box::pin(async move {
            let input = call.input()?;
            let mut args: In = decode_value(input)?;
            call.release_input();

            let result = match (self.handler)(args.clone()).await {
                Ok(mut output) => call.respond_with(&mut output).await,
                Err(e) => Err(e),
            };
            let released = release_value(&mut args);
            result.and(released)
        })
    }
}

/// Registry mapping procedure names to handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` if `name` is empty or too long for a frame header
    /// - `DuplicateRegistration` if `name` is already taken
    pub fn register<H: Handler>(&mut self, name: &str, handler: H) -> Result<()> {
        if name.is_empty() {
            return Err(ShipperError::InvalidArgument(
                "procedure name must not be empty".to_string(),
            ));
        }
        if name.len() > crate::protocol::MAX_PROCEDURE_NAME_LEN {
            return Err(ShipperError::InvalidArgument(format!(
                "procedure name of {} bytes is too long",
                name.len()
            )));
        }
        if self.handlers.contains_key(name) {
            return Err(ShipperError::DuplicateRegistration(name.to_string()));
        }

        self.handlers.insert(name.to_string(), Arc::new(handler));
        tracing::debug!(procedure = name, "registered handler");
        Ok(())
    }

    /// Register a plain function handler.
    pub fn register_fn(&mut self, name: &str, f: HandlerFn) -> Result<()> {
        self.register(name, FnHandler::new(f))
    }

    /// Register an async function from typed input to typed output.
    pub fn register_typed<F, In, Out, Fut>(&mut self, name: &str, f: F) -> Result<()>
    where
        F: Fn(In) -> Fut + Send + Sync + 'static,
        In: ProcField + Default + Clone + Send + 'static,
        Out: ProcField + Send + 'static,
        Fut: Future<Output = Result<Out>> + Send + 'static,
    {
        self.register(name, TypedHandler::new(f))
    }

    /// Look up the handler registered under `name`.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Handler>> {
        self.handlers
            .get(name)
            .cloned()
            .ok_or_else(|| ShipperError::UnknownProcedure(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered procedure names, sorted.
    pub fn procedures(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("procedures", &self.procedures())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::CallState;
    use crate::transport::PeerId;
    use crate::proc::{encode_value, OutputBuffer, ProcMode};
    use std::sync::atomic::{AtomicIsize, Ordering};
    use crate::protocol::flags;
    use bytes::Bytes;

    fn noop(call: &mut CallHandle) -> BoxFuture<'_, HandlerResult> {
        Box::pin(async move { call.respond_with(&mut ()).await })
    }

    fn encoded<T: ProcField>(mut value: T) -> Bytes {
        encode_value(&mut value, OutputBuffer::with_capacity(64))
            .unwrap()
            .into_payload()
            .0
    }

    #[test]
    fn test_register_and_resolve() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("bla_open", noop).unwrap();

        assert!(registry.resolve("bla_open").is_ok());
        assert!(registry.contains("bla_open"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("bla_open", noop).unwrap();

        let err = registry.register_fn("bla_open", noop).unwrap_err();
        assert!(matches!(err, ShipperError::DuplicateRegistration(name) if name == "bla_open"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_empty_name_is_invalid() {
        let mut registry = HandlerRegistry::new();
        let err = registry.register_fn("", noop).unwrap_err();
        assert!(matches!(err, ShipperError::InvalidArgument(_)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_names_are_case_sensitive() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("Open", noop).unwrap();
        registry.register_fn("open", noop).unwrap();

        assert_eq!(registry.procedures(), vec!["Open", "open"]);
    }

    #[test]
    fn test_resolve_unknown_procedure() {
        let registry = HandlerRegistry::new();
        let err = registry.resolve("missing").err().unwrap();
        assert!(matches!(err, ShipperError::UnknownProcedure(name) if name == "missing"));
    }

    #[test]
    fn test_concurrent_resolves() {
        let mut registry = HandlerRegistry::new();
        for name in ["a", "b", "c"] {
            registry.register_fn(name, noop).unwrap();
        }
        let registry = Arc::new(registry);

        let threads: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for j in 0..1000 {
                        let name = ["a", "b", "c"][(i + j) % 3];
                        registry.resolve(name).unwrap();
                        registry.resolve("a").unwrap();
                    }
                })
            })
            .collect();

        for thread in threads {
            thread.join().unwrap();
        }
    }

    #[tokio::test]
    async fn test_typed_handler_decodes_and_responds() {
        let handler = TypedHandler::new(|n: u32| async move { Ok(n + 1) });
        let mut call = CallHandle::detached(PeerId(1), 7, "inc", encoded(41u32), 64);

        handler.call(&mut call).await.unwrap();

        assert_eq!(call.state(), CallState::Responded);
        let frame = call.take_sent().unwrap();
        assert_eq!(frame.header[2], flags::RESPONSE);
        assert_eq!(decode_value::<u32>(frame.payload).unwrap(), 42);
    }

    static LIVE_ARGS: AtomicIsize = AtomicIsize::new(0);

    /// Argument whose decode allocation is counted until its free pass.
    #[derive(Debug, Default, Clone)]
    struct TrackedArgs {
        data: Option<Vec<u8>>,
        counted: bool,
    }

    impl ProcField for TrackedArgs {
        fn process(&mut self, proc: &mut crate::proc::Proc) -> Result<()> {
            match proc.mode() {
                ProcMode::Encode => proc.write_blob(self.data.as_deref().unwrap_or_default()),
                ProcMode::Decode => {
                    self.data = Some(proc.read_blob()?.to_vec());
                    self.counted = true;
                    LIVE_ARGS.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
                ProcMode::Free => {
                    if std::mem::take(&mut self.counted) {
                        self.data = None;
                        LIVE_ARGS.fetch_sub(1, Ordering::SeqCst);
                    }
                    Ok(())
                }
            }
        }
    }

    #[tokio::test]
    async fn test_typed_handler_frees_decoded_args() {
        let handler = TypedHandler::new(|args: TrackedArgs| async move {
            Ok(args.data.map_or(0, |d| d.len() as u32))
        });
        let mut call = CallHandle::detached(PeerId(1), 7, "len", encoded(b"/tmp/x".to_vec()), 64);
        handler.call(&mut call).await.unwrap();

        assert_eq!(call.state(), CallState::Responded);
        assert_eq!(decode_value::<u32>(call.take_sent().unwrap().payload).unwrap(), 6);

        let failing = TypedHandler::new(|_: TrackedArgs| async move {
            Err::<u32, _>(ShipperError::Remote("denied".to_string()))
        });
        let mut call = CallHandle::detached(PeerId(1), 8, "len", encoded(b"/etc".to_vec()), 64);
        assert!(failing.call(&mut call).await.is_err());

        assert_eq!(LIVE_ARGS.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_typed_handler_rejects_truncated_input() {
        let handler = TypedHandler::new(|n: u64| async move { Ok(n) });
        let mut call = CallHandle::detached(PeerId(1), 7, "id", Bytes::from_static(&[0, 1]), 64);

        let err = handler.call(&mut call).await.unwrap_err();
        assert!(matches!(err, ShipperError::Truncation { .. }));
        assert!(call.take_sent().is_none());
    }

    #[tokio::test]
    async fn test_typed_handler_propagates_domain_error() {
        let handler = TypedHandler::new(|_: u32| async move {
            Err::<u32, _>(ShipperError::Remote("no such file".to_string()))
        });
        let mut call = CallHandle::detached(PeerId(1), 7, "open", encoded(1u32), 64);

        let err = handler.call(&mut call).await.unwrap_err();
        assert!(matches!(err, ShipperError::Remote(_)));
        assert!(!call.is_terminal());
    }
}
