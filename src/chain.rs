//! Middleware chain
//!
//! Runs an ordered list of handlers for one connection event. Each handler
//! receives a [`Next`] token and decides how the chain proceeds by signalling
//! through it exactly once:
//!
//! - `next.advance()` continues with the same context
//! - `next.replace(ctx)` continues with `ctx` for every later handler
//! - `next.fail(err)` stops the chain and hands `err` to the error sink
//!
//! A handler that returns without signalling ends the chain at its index.
//! Signalling twice is a handler defect: the driver reports a single
//! `DoubleAdvance` to the sink and no later handler runs for that event.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, error};

use crate::connection::Connection;
use crate::error::{AppError, ErrorKind};
use crate::sink::ErrorSink;

/// Future returned by a handler
pub type HandlerFuture = BoxFuture<'static, Result<(), AppError>>;

/// A middleware function
pub type Handler = Arc<dyn Fn(Connection, Value, Next) -> HandlerFuture + Send + Sync>;

/// Wrap an async closure as a [`Handler`]
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Connection, Value, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), AppError>> + Send + 'static,
{
    Arc::new(move |conn, ctx, next| Box::pin(f(conn, ctx, next)))
}

/// What a handler asks the driver to do next
#[derive(Debug)]
pub enum NextSignal {
    /// Continue with the unchanged context
    Continue,
    /// Continue with a replacement context
    Replace(Value),
    /// Abort and route the error to the sink
    Fail(AppError),
}

#[derive(Debug, Default)]
struct Slot {
    signal: Option<NextSignal>,
    consumed: bool,
    overrun: bool,
    settled: bool,
}

/// Single-shot continuation token for one chain step
#[derive(Clone)]
pub struct Next {
    index: usize,
    slot: Arc<Mutex<Slot>>,
    conn: Connection,
    sink: Arc<dyn ErrorSink>,
}

impl Next {
    fn new(index: usize, conn: Connection, sink: Arc<dyn ErrorSink>) -> Self {
        Self {
            index,
            slot: Arc::new(Mutex::new(Slot::default())),
            conn,
            sink,
        }
    }

    /// Index of the handler this token belongs to
    pub fn index(&self) -> usize {
        self.index
    }

    /// Continue with the unchanged context
    ///
    /// The signal takes effect once the handler's future completes. If the
    /// token is signalled again before then, the event is aborted and the
    /// next handler never runs.
    pub fn advance(&self) -> Result<(), AppError> {
        self.signal(NextSignal::Continue)
    }

    /// Continue with `context` replacing the current one
    pub fn replace(&self, context: Value) -> Result<(), AppError> {
        self.signal(NextSignal::Replace(context))
    }

    /// Stop the chain with `error`
    pub fn fail(&self, error: AppError) -> Result<(), AppError> {
        self.signal(NextSignal::Fail(error))
    }

    /// Record a signal; only the first one per token is accepted
    ///
    /// A second signal after the handler returned is still reported to the
    /// error sink, from a separate task.
    pub fn signal(&self, signal: NextSignal) -> Result<(), AppError> {
        let mut slot = self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.consumed {
            slot.overrun = true;
            if slot.settled {
                self.report_late();
            }
            return Err(AppError::DoubleAdvance { index: self.index });
        }
        slot.consumed = true;
        if slot.settled {
            debug!(
                "Handler {} signalled after its chain moved on; ignored",
                self.index
            );
            return Ok(());
        }
        slot.signal = Some(signal);
        Ok(())
    }

    fn report_late(&self) {
        let err = AppError::DoubleAdvance { index: self.index };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let conn = self.conn.clone();
                let sink = self.sink.clone();
                runtime.spawn(async move { sink.report(&conn, err).await });
            }
            Err(_) => error!("Connection {}: {} outside the runtime", self.conn.id, err),
        }
    }

    /// Close the token for the driver: returns the overrun flag and the signal
    fn settle(&self) -> (bool, Option<NextSignal>) {
        let mut slot = self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        slot.settled = true;
        (slot.overrun, slot.signal.take())
    }
}

impl fmt::Debug for Next {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next").field("index", &self.index).finish()
    }
}

/// Terminal state of a chain run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainOutcome {
    /// Every handler advanced
    Completed,
    /// Handler at `index` returned without advancing
    Halted { index: usize },
    /// Handler at `index` failed; the error went to the sink
    Aborted { index: usize, kind: ErrorKind },
}

/// Ordered, append-only list of handlers
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    handlers: Vec<Handler>,
}

impl MiddlewareChain {
    /// Create a chain from an ordered list of handlers
    pub fn new(handlers: Vec<Handler>) -> Self {
        Self { handlers }
    }

    /// Append handlers to the end of the chain
    pub fn push(&mut self, handlers: impl IntoIterator<Item = Handler>) {
        self.handlers.extend(handlers);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Execute the chain for one event
    ///
    /// Recoverable errors are reported to `sink` and yield
    /// `ChainOutcome::Aborted`. A `Fatal` error returned by a handler is
    /// propagated to the caller instead.
    pub async fn run(
        &self,
        conn: &Connection,
        context: Value,
        sink: Arc<dyn ErrorSink>,
    ) -> Result<ChainOutcome, AppError> {
        let mut context = context;

        for (index, handler) in self.handlers.iter().enumerate() {
            let next = Next::new(index, conn.clone(), sink.clone());
            let result = handler(conn.clone(), context.clone(), next.clone()).await;
            let (overrun, signal) = next.settle();

            if overrun {
                let err = AppError::DoubleAdvance { index };
                let kind = err.kind();
                sink.report(conn, err).await;
                return Ok(ChainOutcome::Aborted { index, kind });
            }

            if let Err(err) = result {
                if !err.is_recoverable() {
                    return Err(err);
                }
                let kind = err.kind();
                sink.report(conn, err).await;
                return Ok(ChainOutcome::Aborted { index, kind });
            }

            match signal {
                Some(NextSignal::Continue) => {}
                Some(NextSignal::Replace(replacement)) => {
                    context = replacement;
                }
                Some(NextSignal::Fail(err)) => {
                    let kind = err.kind();
                    sink.report(conn, err).await;
                    return Ok(ChainOutcome::Aborted { index, kind });
                }
                None => {
                    debug!("Chain for {} halted at handler {}", conn.id, index);
                    return Ok(ChainOutcome::Halted { index });
                }
            }
        }

        Ok(ChainOutcome::Completed)
    }
}

impl fmt::Debug for MiddlewareChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiddlewareChain")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::ConnectionId;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::sleep;

    /// Sink that records every error it receives
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub(crate) errors: Mutex<Vec<AppError>>,
    }

    impl RecordingSink {
        pub(crate) fn kinds(&self) -> Vec<ErrorKind> {
            self.errors.lock().unwrap().iter().map(AppError::kind).collect()
        }
    }

    #[async_trait]
    impl ErrorSink for RecordingSink {
        async fn report(&self, _conn: &Connection, error: AppError) {
            self.errors.lock().unwrap().push(error);
        }
    }

    pub(crate) fn test_connection() -> Connection {
        let (tx, _rx) = mpsc::channel(32);
        Connection::new(ConnectionId::new(), "/test", tx)
    }

    fn recording(log: &Arc<Mutex<Vec<usize>>>, id: usize) -> Handler {
        let log = log.clone();
        handler(move |_conn, _ctx, next: Next| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(id);
                next.advance()
            }
        })
    }

    #[tokio::test]
    async fn test_runs_each_handler_once_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = MiddlewareChain::new((0..5).map(|i| recording(&log, i)).collect());
        let sink = Arc::new(RecordingSink::default());

        let outcome = chain.run(&test_connection(), Value::Null, sink.clone()).await.unwrap();

        assert_eq!(outcome, ChainOutcome::Completed);
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert!(sink.kinds().is_empty());
    }

    #[tokio::test]
    async fn test_empty_chain_completes() {
        let sink = Arc::new(RecordingSink::default());
        let outcome = MiddlewareChain::default()
            .run(&test_connection(), Value::Null, sink.clone())
            .await
            .unwrap();
        assert_eq!(outcome, ChainOutcome::Completed);
    }

    #[tokio::test]
    async fn test_replace_context_for_later_handlers() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in = seen.clone();
        let mut chain = MiddlewareChain::new(vec![handler(|_conn, _ctx, next: Next| async move {
            next.replace(json!({"user": "alice"}))
        })]);
        chain.push([
            handler(|_conn, _ctx, next: Next| async move { next.advance() }),
            handler(move |_conn, ctx, next: Next| {
                let seen = seen_in.clone();
                async move {
                    seen.lock().unwrap().push(ctx);
                    next.advance()
                }
            }),
        ]);
        let sink = Arc::new(RecordingSink::default());

        chain.run(&test_connection(), json!({"raw": true}), sink.clone()).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![json!({"user": "alice"})]);
    }

    #[tokio::test]
    async fn test_fail_stops_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = MiddlewareChain::new(vec![
            recording(&log, 0),
            handler(|_conn, _ctx, next: Next| async move {
                next.fail(AppError::Validation("nope".into()))
            }),
            recording(&log, 2),
        ]);
        let sink = Arc::new(RecordingSink::default());

        let outcome = chain.run(&test_connection(), Value::Null, sink.clone()).await.unwrap();

        assert_eq!(
            outcome,
            ChainOutcome::Aborted {
                index: 1,
                kind: ErrorKind::ClientInput
            }
        );
        assert_eq!(*log.lock().unwrap(), vec![0]);
        assert_eq!(sink.kinds(), vec![ErrorKind::ClientInput]);
    }

    #[tokio::test]
    async fn test_double_advance_reported_once() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = MiddlewareChain::new(vec![
            handler(|_conn, _ctx, next: Next| async move {
                next.advance()?;
                next.advance()
            }),
            recording(&log, 1),
        ]);
        let sink = Arc::new(RecordingSink::default());

        let outcome = chain.run(&test_connection(), Value::Null, sink.clone()).await.unwrap();

        assert_eq!(
            outcome,
            ChainOutcome::Aborted {
                index: 0,
                kind: ErrorKind::ProtocolDefect
            }
        );
        let errors = sink.errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], AppError::DoubleAdvance { index: 0 }));
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_double_advance_ignored_result_still_reported() {
        let chain = MiddlewareChain::new(vec![handler(|_conn, _ctx, next: Next| async move {
            next.advance()?;
            let _ = next.replace(Value::Null);
            Ok(())
        })]);
        let sink = Arc::new(RecordingSink::default());

        chain.run(&test_connection(), Value::Null, sink.clone()).await.unwrap();

        assert_eq!(sink.kinds(), vec![ErrorKind::ProtocolDefect]);
    }

    #[tokio::test]
    async fn test_late_double_advance_still_reported() {
        let chain = MiddlewareChain::new(vec![handler(|_conn, _ctx, next: Next| async move {
            next.advance()?;
            tokio::spawn(async move {
                sleep(Duration::from_millis(10)).await;
                let _ = next.advance();
            });
            Ok(())
        })]);
        let sink = Arc::new(RecordingSink::default());

        let outcome = chain.run(&test_connection(), Value::Null, sink.clone()).await.unwrap();
        assert_eq!(outcome, ChainOutcome::Completed);

        for _ in 0..100 {
            if !sink.kinds().is_empty() {
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(sink.kinds(), vec![ErrorKind::ProtocolDefect]);
    }

    #[tokio::test]
    async fn test_returned_error_goes_to_sink() {
        let chain = MiddlewareChain::new(vec![handler(|_conn, _ctx, _next| async move {
            Err(AppError::ProducerNotFound("rooms".into()))
        })]);
        let sink = Arc::new(RecordingSink::default());

        let outcome = chain.run(&test_connection(), Value::Null, sink.clone()).await.unwrap();

        assert!(matches!(outcome, ChainOutcome::Aborted { index: 0, .. }));
        assert_eq!(sink.kinds(), vec![ErrorKind::NotFound]);
    }

    #[tokio::test]
    async fn test_fatal_error_propagates() {
        let chain = MiddlewareChain::new(vec![handler(|_conn, _ctx, _next| async move {
            Err(AppError::Fatal("corrupted state".into()))
        })]);
        let sink = Arc::new(RecordingSink::default());

        let result = chain.run(&test_connection(), Value::Null, sink.clone()).await;

        assert!(matches!(result, Err(AppError::Fatal(_))));
        assert!(sink.kinds().is_empty());
    }

    #[tokio::test]
    async fn test_silent_handler_halts_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = MiddlewareChain::new(vec![
            recording(&log, 0),
            handler(|_conn, _ctx, _next| async move { Ok(()) }),
            recording(&log, 2),
        ]);
        let sink = Arc::new(RecordingSink::default());

        let outcome = chain.run(&test_connection(), Value::Null, sink.clone()).await.unwrap();

        assert_eq!(outcome, ChainOutcome::Halted { index: 1 });
        assert_eq!(*log.lock().unwrap(), vec![0]);
    }
}
