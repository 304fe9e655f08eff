//! Plugin lifecycle hooks.
//!
//! A plugin is a record of optional async hooks invoked by the orchestrator
//! at fixed points in the server lifecycle. Hooks run in plugin declaration
//! order within a phase; phases never overlap for one server instance. Every
//! hook except `on_error` runs at most once per phase.

use crate::error::{BoxError, ErrorStage, ServerError};
use crate::middleware::BoxFuture;
use crate::request::Request;

/// Result type for lifecycle hooks.
pub type HookResult = Result<(), BoxError>;

fn ok<'a>() -> BoxFuture<'a, HookResult> {
    Box::pin(std::future::ready(Ok(())))
}

/// Lifecycle hooks. All hooks default to no-ops.
pub trait Plugin: Send + Sync {
    /// Plugin name for logs.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Runs during `serve()`, before any other phase.
    fn on_register(&self) -> BoxFuture<'_, HookResult> {
        ok()
    }

    /// Runs during `serve()`, before the transport binds.
    fn on_before_serve(&self) -> BoxFuture<'_, HookResult> {
        ok()
    }

    /// Runs during `serve()`, after the transport is bound.
    fn on_after_serve(&self) -> BoxFuture<'_, HookResult> {
        ok()
    }

    /// Runs during `close()`, before the transport closes.
    fn on_before_close(&self) -> BoxFuture<'_, HookResult> {
        ok()
    }

    /// Runs during `close()`, after the transport closed and background
    /// tasks drained.
    fn on_after_close(&self) -> BoxFuture<'_, HookResult> {
        ok()
    }

    /// Called for every non-recovered error, with the stage it was raised
    /// in. A failure returned from this hook is logged and dropped; it never
    /// re-enters error emission.
    fn on_error<'a>(
        &'a self,
        stage: ErrorStage,
        error: &'a ServerError,
        stack: &'a str,
        request: Option<&'a Request>,
    ) -> BoxFuture<'a, HookResult> {
        let _ = (stage, error, stack, request);
        ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct Recorder {
        events: Arc<Mutex<Vec<String>>>,
    }

    impl Plugin for Recorder {
        fn on_register(&self) -> BoxFuture<'_, HookResult> {
            self.events.lock().push("register".to_string());
            ok()
        }

        fn on_error<'a>(
            &'a self,
            stage: ErrorStage,
            _error: &'a ServerError,
            _stack: &'a str,
            _request: Option<&'a Request>,
        ) -> BoxFuture<'a, HookResult> {
            self.events.lock().push(format!("error:{stage}"));
            ok()
        }
    }

    #[test]
    fn default_hooks_are_noops() {
        struct Bare;
        impl Plugin for Bare {}

        let plugin = Bare;
        futures_executor::block_on(async {
            plugin.on_register().await.unwrap();
            plugin.on_before_serve().await.unwrap();
            plugin.on_after_serve().await.unwrap();
            plugin.on_before_close().await.unwrap();
            plugin.on_after_close().await.unwrap();
        });
    }

    #[test]
    fn overridden_hooks_observe_calls() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let plugin = Recorder {
            events: events.clone(),
        };
        let err = ServerError::handler("x");
        futures_executor::block_on(async {
            plugin.on_register().await.unwrap();
            plugin
                .on_error(ErrorStage::Request, &err, "", None)
                .await
                .unwrap();
        });
        assert_eq!(*events.lock(), vec!["register", "error:request"]);
    }
}
