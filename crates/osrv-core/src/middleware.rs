//! Middleware pipeline and handler contract.
//!
//! Middleware forms a recursive onion: middleware `i` calls [`Next::run`],
//! which invokes middleware `i + 1`; the terminal `Next` invokes the user
//! fetch handler. Ordering is strict:
//!
//! ```text
//! m1.before, m2.before, ..., mN.before, fetch, mN.after, ..., m1.after
//! ```
//!
//! A middleware short-circuits by returning a response without calling
//! `next`; later middleware and the fetch handler then never run. Errors are
//! first-class: a failing middleware or fetch propagates `Err` to the caller
//! exactly like an exception unwinding through the onion.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::ServerError;
use crate::request::Request;
use crate::response::Response;

/// A boxed future for async handler operations.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The user fetch handler: request in, response out.
pub trait FetchHandler: Send + Sync {
    /// Produce a response for the request. May suspend.
    fn fetch<'a>(&'a self, req: &'a mut Request) -> BoxFuture<'a, Result<Response, ServerError>>;
}

/// Any `Fn(&mut Request) -> Future<Output = Result<Response, ServerError>>`
/// is a fetch handler.
///
/// The returned future must be `'static`: take what you need from the
/// request (for example via `take_body`) before the first await.
impl<F, Fut> FetchHandler for F
where
    F: Fn(&mut Request) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Response, ServerError>> + Send + 'static,
{
    fn fetch<'a>(&'a self, req: &'a mut Request) -> BoxFuture<'a, Result<Response, ServerError>> {
        Box::pin(self(req))
    }
}

/// A middleware wrapping the rest of the pipeline.
pub trait Middleware: Send + Sync {
    /// Handle the request, optionally delegating to `next`.
    fn handle<'a>(
        &'a self,
        req: &'a mut Request,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<Response, ServerError>>;

    /// Middleware name for logs.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// The continuation of the middleware onion.
///
/// Consumed by `run`; a middleware that drops it without calling `run`
/// short-circuits the pipeline.
pub struct Next<'a> {
    rest: &'a [Arc<dyn Middleware>],
    fetch: &'a dyn FetchHandler,
}

impl<'a> Next<'a> {
    /// Build the continuation for a full chain.
    #[must_use]
    pub fn new(chain: &'a [Arc<dyn Middleware>], fetch: &'a dyn FetchHandler) -> Self {
        Self { rest: chain, fetch }
    }

    /// Invoke the rest of the pipeline.
    pub async fn run(self, req: &mut Request) -> Result<Response, ServerError> {
        match self.rest.split_first() {
            Some((mw, rest)) => {
                mw.handle(
                    req,
                    Next {
                        rest,
                        fetch: self.fetch,
                    },
                )
                .await
            }
            None => self.fetch.fetch(req).await,
        }
    }
}

/// Execute a middleware chain around a fetch handler.
pub async fn execute(
    chain: &[Arc<dyn Middleware>],
    fetch: &dyn FetchHandler,
    req: &mut Request,
) -> Result<Response, ServerError> {
    Next::new(chain, fetch).run(req).await
}
