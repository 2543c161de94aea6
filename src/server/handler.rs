use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::protocol::Kwargs;
use crate::Result;

type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value>> + Send>>;

/// Type-erased async handler function.
///
/// Takes the decoded positional and keyword arguments and produces the
/// `data` field of the response. Wrapped in Arc for cheap cloning when
/// spawning tasks.
pub(super) type BoxedHandler = Arc<dyn Fn(Vec<Value>, Kwargs) -> HandlerFuture + Send + Sync>;

/// Wrap a typed handler function into a type-erased handler.
///
/// This allows the worker to store handlers of different result types in
/// the same HashMap.
pub(super) fn wrap_handler<F, Fut, Resp>(handler: F) -> BoxedHandler
where
    F: Fn(Vec<Value>, Kwargs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp>> + Send + 'static,
    Resp: Serialize + Send + 'static,
{
    // ---
    Arc::new(move |args: Vec<Value>, kwargs: Kwargs| {
        let fut = handler(args, kwargs);
        Box::pin(async move {
            let resp = fut.await?;
            Ok(serde_json::to_value(resp)?)
        }) as HandlerFuture
    })
}
