//! Server orchestrator: lifecycle, dispatch, error routing, close.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::{ResolvedConfig, ServerOptions};
use crate::error::{
    default_error_response, limit_exceeded_response, render_stack, BoxError, ErrorStage,
    ServerError, TransportError,
};
use crate::middleware::{execute, BoxFuture, FetchHandler, Middleware};
use crate::plugin::Plugin;
use crate::request::Request;
use crate::response::Response;
use crate::runtime::ServerCapabilities;
use crate::tasks::{TaskSet, WaitUntil};

const LOG_TARGET: &str = "osrv::server";

/// Lifecycle state of a server instance.
///
/// The lifecycle is one-shot: once closed (or failed), the instance does not
/// serve again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Constructed, not yet serving.
    Constructed,
    /// Running `on_register` hooks.
    Registering,
    /// Running `on_before_serve` and binding the transport.
    Starting,
    /// Accepting requests.
    Serving,
    /// `close()` in progress.
    Draining,
    /// Fully closed.
    Closed,
    /// Terminal failure state.
    Failed,
}

/// What a transport reports after binding.
#[derive(Debug, Clone)]
pub struct BindInfo {
    /// Actual capabilities after bind.
    pub capabilities: ServerCapabilities,
    /// Bound local address, when the transport has one.
    pub local_addr: Option<SocketAddr>,
}

/// A pluggable transport: something that can deliver requests into
/// [`ServerCore::dispatch`].
///
/// Concrete implementations: the native socket transport (osrv-http), the
/// JSON bridge ([`crate::bridge::BridgeTransport`]), and
/// [`UnsupportedTransport`] for builds with no serving surface.
pub trait Transport: Send {
    /// Transport name for logs.
    fn name(&self) -> &'static str;

    /// Bind and start delivering requests to `core`.
    fn bind(&mut self, core: Arc<ServerCore>) -> Result<BindInfo, TransportError>;

    /// Stop the transport. `force` skips waiting for in-flight requests.
    fn close(&mut self, force: bool) -> Result<(), TransportError>;
}

/// Transport that refuses to bind. The default when a server is constructed
/// without a serving surface.
#[derive(Debug, Default)]
pub struct UnsupportedTransport;

impl Transport for UnsupportedTransport {
    fn name(&self) -> &'static str {
        "unsupported"
    }

    fn bind(&mut self, _core: Arc<ServerCore>) -> Result<BindInfo, TransportError> {
        Err(TransportError::Unsupported(
            "this build has no transport; construct the server with one".to_string(),
        ))
    }

    fn close(&mut self, _force: bool) -> Result<(), TransportError> {
        Ok(())
    }
}

/// User-supplied error handler.
pub trait ErrorHandler: Send + Sync {
    /// Produce a response for an error. For lifecycle stages the response is
    /// discarded (the error is rethrown), but the handler still observes the
    /// failure. A handler failure is logged and the default response used.
    fn handle<'a>(
        &'a self,
        error: &'a ServerError,
        stack: &'a str,
        request: Option<&'a Request>,
    ) -> BoxFuture<'a, Result<Response, BoxError>>;
}

impl<F, Fut> ErrorHandler for F
where
    F: for<'a> Fn(&'a ServerError, &'a str, Option<&'a Request>) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Response, BoxError>> + Send + 'static,
{
    fn handle<'a>(
        &'a self,
        error: &'a ServerError,
        stack: &'a str,
        request: Option<&'a Request>,
    ) -> BoxFuture<'a, Result<Response, BoxError>> {
        Box::pin(self(error, stack, request))
    }
}

/// The request-path state shared between the orchestrator and its transport.
///
/// The server exclusively owns the plugin list, middleware list and
/// background-task registry; transports reach them only through this handle.
pub struct ServerCore {
    config: ResolvedConfig,
    middleware: Vec<Arc<dyn Middleware>>,
    fetch: Arc<dyn FetchHandler>,
    error_handler: Option<Arc<dyn ErrorHandler>>,
    plugins: Vec<Arc<dyn Plugin>>,
    tasks: TaskSet,
    emitting_error: AtomicBool,
}

impl fmt::Debug for ServerCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerCore")
            .field("middleware", &self.middleware.len())
            .field("plugins", &self.plugins.len())
            .field("production", &self.config.production)
            .finish_non_exhaustive()
    }
}

impl ServerCore {
    /// The resolved configuration.
    #[must_use]
    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    /// A background-task sink for attaching to requests.
    #[must_use]
    pub fn wait_until_sink(&self) -> WaitUntil {
        self.tasks.sink()
    }

    /// Number of currently registered background tasks.
    #[must_use]
    pub fn background_tasks(&self) -> usize {
        self.tasks.active()
    }

    /// Run the middleware chain and fetch handler for one request.
    ///
    /// Never fails: errors are routed through plugins and the error handler,
    /// and a response always comes back. Exactly one response per request.
    pub async fn dispatch(&self, req: &mut Request) -> Response {
        match execute(&self.middleware, self.fetch.as_ref(), &mut *req).await {
            Ok(response) => response,
            Err(error) => self.request_error_response(error, Some(req)).await,
        }
    }

    /// Convert a request-stage error into a response, notifying plugins.
    pub async fn request_error_response(
        &self,
        error: ServerError,
        request: Option<&Request>,
    ) -> Response {
        let stack = render_stack(&error);
        self.emit_error(ErrorStage::Request, &error, &stack, request)
            .await;

        if let ServerError::RequestLimitExceeded {
            max_bytes,
            actual_bytes,
        } = &error
        {
            return limit_exceeded_response(*max_bytes, *actual_bytes);
        }

        if let Some(handler) = &self.error_handler {
            match handler.handle(&error, &stack, request).await {
                Ok(response) => return response,
                Err(handler_err) => crate::logging::warn(
                    LOG_TARGET,
                    &format!("error handler failed: {handler_err}; using default response"),
                ),
            }
        }

        default_error_response(self.config.production, &error, &stack)
    }

    /// Notify every plugin's `on_error` hook.
    ///
    /// A nested error raised while already emitting does not re-enter the
    /// emission loop; it is logged and dropped.
    pub async fn emit_error(
        &self,
        stage: ErrorStage,
        error: &ServerError,
        stack: &str,
        request: Option<&Request>,
    ) {
        if self.emitting_error.swap(true, Ordering::SeqCst) {
            crate::logging::warn(
                LOG_TARGET,
                &format!("nested error during plugin notification dropped ({stage}): {error}"),
            );
            return;
        }
        for plugin in &self.plugins {
            if let Err(nested) = plugin.on_error(stage, error, stack, request).await {
                crate::logging::error(
                    LOG_TARGET,
                    &format!(
                        "plugin {} on_error failed ({stage}): {nested}; dropped",
                        plugin.name()
                    ),
                );
            }
        }
        self.emitting_error.store(false, Ordering::SeqCst);
    }

    async fn run_hook_phase(&self, stage: ErrorStage) -> Result<(), ServerError> {
        for plugin in &self.plugins {
            let result = match stage {
                ErrorStage::Register => plugin.on_register().await,
                ErrorStage::BeforeServe => plugin.on_before_serve().await,
                ErrorStage::AfterServe => plugin.on_after_serve().await,
                ErrorStage::BeforeClose => plugin.on_before_close().await,
                ErrorStage::AfterClose => plugin.on_after_close().await,
                _ => Ok(()),
            };
            if let Err(source) = result {
                return Err(ServerError::Lifecycle { stage, source });
            }
        }
        Ok(())
    }

    async fn lifecycle_failure(&self, error: &ServerError) {
        let stack = render_stack(error);
        self.emit_error(error.stage(), error, &stack, None).await;
        if let Some(handler) = &self.error_handler {
            if let Err(handler_err) = handler.handle(error, &stack, None).await {
                crate::logging::warn(
                    LOG_TARGET,
                    &format!("error handler failed during lifecycle error: {handler_err}"),
                );
            }
        }
    }
}

/// Builder for [`Server`].
pub struct ServerBuilder {
    fetch: Arc<dyn FetchHandler>,
    middleware: Vec<Arc<dyn Middleware>>,
    plugins: Vec<Arc<dyn Plugin>>,
    error_handler: Option<Arc<dyn ErrorHandler>>,
    options: ServerOptions,
    env: Option<HashMap<String, String>>,
    transport: Option<Box<dyn Transport>>,
}

impl ServerBuilder {
    /// Start building a server around a fetch handler.
    #[must_use]
    pub fn new<H: FetchHandler + 'static>(fetch: H) -> Self {
        Self {
            fetch: Arc::new(fetch),
            middleware: Vec::new(),
            plugins: Vec::new(),
            error_handler: None,
            options: ServerOptions::default(),
            env: None,
            transport: None,
        }
    }

    /// Append a middleware. Declaration order is execution order for the
    /// before phase.
    #[must_use]
    pub fn middleware<M: Middleware + 'static>(mut self, middleware: M) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    /// Register a plugin. Hooks run in declaration order within each phase.
    #[must_use]
    pub fn plugin<P: Plugin + 'static>(mut self, plugin: P) -> Self {
        self.plugins.push(Arc::new(plugin));
        self
    }

    /// Set the user error handler.
    #[must_use]
    pub fn error_handler<E: ErrorHandler + 'static>(mut self, handler: E) -> Self {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    /// Set explicit server options.
    #[must_use]
    pub fn options(mut self, options: ServerOptions) -> Self {
        self.options = options;
        self
    }

    /// Override the environment snapshot (defaults to the process env).
    #[must_use]
    pub fn env(mut self, env: HashMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    /// Set the transport. Defaults to [`UnsupportedTransport`].
    #[must_use]
    pub fn transport(mut self, transport: Box<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Resolve configuration and build the server.
    #[must_use]
    pub fn build(self) -> Server {
        let env = self.env.unwrap_or_else(ResolvedConfig::capture_env);
        let config = ResolvedConfig::resolve(self.options, env);
        crate::logging::init(config.log.clone());

        let core = Arc::new(ServerCore {
            config,
            middleware: self.middleware,
            fetch: self.fetch,
            error_handler: self.error_handler,
            plugins: self.plugins,
            tasks: TaskSet::new(),
            emitting_error: AtomicBool::new(false),
        });

        Server {
            core,
            transport: self
                .transport
                .unwrap_or_else(|| Box::new(UnsupportedTransport)),
            state: LifecycleState::Constructed,
            capabilities: None,
            local_addr: None,
        }
    }
}

/// The server: one listener, one handler, one lifecycle.
pub struct Server {
    core: Arc<ServerCore>,
    transport: Box<dyn Transport>,
    state: LifecycleState,
    capabilities: Option<ServerCapabilities>,
    local_addr: Option<SocketAddr>,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("state", &self.state)
            .field("transport", &self.transport.name())
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Start building a server around a fetch handler.
    #[must_use]
    pub fn builder<H: FetchHandler + 'static>(fetch: H) -> ServerBuilder {
        ServerBuilder::new(fetch)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Whether the server is currently serving.
    #[must_use]
    pub fn is_serving(&self) -> bool {
        self.state == LifecycleState::Serving
    }

    /// Capabilities reported by the transport after bind.
    #[must_use]
    pub fn capabilities(&self) -> Option<&ServerCapabilities> {
        self.capabilities.as_ref()
    }

    /// Bound local address, when the transport has one.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Shared request-path state (for tests and embedding).
    #[must_use]
    pub fn core(&self) -> &Arc<ServerCore> {
        &self.core
    }

    /// Dispatch a request directly, outside any transport.
    pub async fn dispatch(&self, req: &mut Request) -> Response {
        self.core.dispatch(req).await
    }

    /// Transition constructed → serving.
    ///
    /// Runs `on_register` for every plugin in declaration order, then
    /// `on_before_serve`, binds the transport, marks the server serving, and
    /// runs `on_after_serve`. Idempotent while serving.
    ///
    /// # Errors
    ///
    /// Any failure notifies plugins via `on_error`, moves the server to
    /// `Failed`, and re-surfaces the original error.
    pub async fn serve(&mut self) -> Result<(), ServerError> {
        match self.state {
            LifecycleState::Constructed => {}
            // Already ready; return like the cached ready future would.
            LifecycleState::Serving => return Ok(()),
            other => {
                return Err(ServerError::Lifecycle {
                    stage: ErrorStage::Unknown,
                    source: format!("serve() called in state {other:?}; lifecycle is one-shot")
                        .into(),
                });
            }
        }

        self.state = LifecycleState::Registering;
        if let Err(error) = self.core.run_hook_phase(ErrorStage::Register).await
        {
            return self.fail(error).await;
        }

        self.state = LifecycleState::Starting;
        if let Err(error) = self.core.run_hook_phase(ErrorStage::BeforeServe).await
        {
            return self.fail(error).await;
        }

        let info = match self.transport.bind(Arc::clone(&self.core)) {
            Ok(info) => info,
            Err(transport_err) => {
                return self.fail(ServerError::Transport(transport_err)).await;
            }
        };
        self.capabilities = Some(info.capabilities);
        self.local_addr = info.local_addr;
        self.state = LifecycleState::Serving;
        crate::logging::info(
            LOG_TARGET,
            &format!(
                "serving on {} ({})",
                self.local_addr
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| self.core.config.bind_addr()),
                self.transport.name()
            ),
        );

        if let Err(error) = self.core.run_hook_phase(ErrorStage::AfterServe).await
        {
            // Unwind the partial lifecycle before re-surfacing.
            let _ = self.transport.close(true);
            return self.fail(error).await;
        }

        Ok(())
    }

    /// Transition serving → closed.
    ///
    /// Runs `on_before_close`, closes the transport, waits for background
    /// tasks (unless forced) up to the graceful timeout, then runs
    /// `on_after_close`. Exit is guaranteed: drain overruns are logged and
    /// close proceeds.
    ///
    /// # Errors
    ///
    /// The first lifecycle failure is re-surfaced after the close sequence
    /// completes; later steps still run.
    pub async fn close(&mut self, force: bool) -> Result<(), ServerError> {
        match self.state {
            LifecycleState::Serving => {}
            LifecycleState::Closed | LifecycleState::Failed => return Ok(()),
            other => {
                return Err(ServerError::Lifecycle {
                    stage: ErrorStage::Unknown,
                    source: format!("close() called in state {other:?}").into(),
                });
            }
        }
        self.state = LifecycleState::Draining;
        let mut first_error: Option<ServerError> = None;

        if let Err(error) = self.core.run_hook_phase(ErrorStage::BeforeClose).await
        {
            self.core.lifecycle_failure(&error).await;
            first_error.get_or_insert(error);
        }

        if let Err(transport_err) = self.transport.close(force) {
            let error = ServerError::Transport(transport_err);
            self.core.lifecycle_failure(&error).await;
            first_error.get_or_insert(error);
        }

        if !force {
            let timeout = self.core.config.shutdown.graceful_timeout;
            if !self.core.tasks.drain(timeout) {
                crate::logging::warn(
                    LOG_TARGET,
                    &format!(
                        "{} background task(s) still pending after {:?}; proceeding with close",
                        self.core.tasks.active(),
                        timeout
                    ),
                );
            }
        }

        if let Err(error) = self.core.run_hook_phase(ErrorStage::AfterClose).await
        {
            self.core.lifecycle_failure(&error).await;
            first_error.get_or_insert(error);
        }

        match first_error {
            Some(error) => {
                self.state = LifecycleState::Failed;
                Err(error)
            }
            None => {
                self.state = LifecycleState::Closed;
                crate::logging::info(LOG_TARGET, "closed");
                Ok(())
            }
        }
    }

    async fn fail(&mut self, error: ServerError) -> Result<(), ServerError> {
        self.core.lifecycle_failure(&error).await;
        self.state = LifecycleState::Failed;
        Err(error)
    }
}
