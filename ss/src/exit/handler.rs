//! Exit handler orchestrator
//!
//! Owns the shutdown registry and runs it exactly once when the process is
//! asked to stop, whether by signal, by a fatal error, or on request.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use eyre::eyre;
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::ExitConfig;
use super::recover::{self, catch_recovered};
use super::registry::{HandlerId, ShutdownHandler, ShutdownRegistry};
use super::signals;
use super::terminator::{ProcessTerminator, Terminator};

/// Errors from the exit handler
#[derive(Debug, Error)]
pub enum ExitError {
    #[error("Shutdown already started, no handlers can be bound")]
    Frozen,

    #[error("No Tokio runtime available: {0}")]
    NoRuntime(String),
}

/// Why the shutdown chain is running
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// Termination signal
    Signal(&'static str),
    /// Explicit graceful exit with the given code
    Requested(i32),
    /// Panic or unhandled asynchronous error
    Fatal(String),
}

impl ExitReason {
    /// Process exit code once the chain succeeds
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Signal(_) => 0,
            Self::Requested(code) => *code,
            Self::Fatal(_) => 1,
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Signal(name) => write!(f, "signal {}", name),
            Self::Requested(code) => write!(f, "requested exit ({})", code),
            Self::Fatal(message) => write!(f, "fatal error: {}", message),
        }
    }
}

/// What a trigger ended up doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Chain completed, terminator asked to exit with this code
    Exited(i32),
    /// Chain timed out or failed, terminator asked to kill
    ForceKilled,
    /// Another trigger already ran the chain
    AlreadyHandled,
}

pub(crate) struct ExitInner {
    registry: Mutex<ShutdownRegistry>,
    pub(crate) armed: AtomicBool,
    handled: AtomicBool,
    timeout_enabled: watch::Sender<bool>,
    timeout: Duration,
    handle_signals: bool,
    listener_started: AtomicBool,
    pub(crate) listening: AtomicBool,
    listener_cancel: CancellationToken,
    pub(crate) terminator: Arc<dyn Terminator>,
}

impl Drop for ExitInner {
    fn drop(&mut self) {
        self.listener_cancel.cancel();
    }
}

/// Process-wide shutdown coordinator
///
/// Construct one at the process entry point and pass clones down to the
/// components that need to register cleanup. State machine:
/// Idle → Executing → Exit(code) | ForceKill, never back to Idle.
#[derive(Clone)]
pub struct ExitHandler {
    inner: Arc<ExitInner>,
}

impl fmt::Debug for ExitHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExitHandler")
            .field("registry", &*self.registry())
            .field("handled", &self.is_handled())
            .field("timeout_enabled", &self.exit_timeout_enabled())
            .field("timeout", &self.inner.timeout)
            .finish()
    }
}

impl ExitHandler {
    /// Create an orchestrator that exits the real process
    pub fn new(config: &ExitConfig) -> Self {
        Self::with_terminator(config, Arc::new(ProcessTerminator))
    }

    /// Create an orchestrator with a custom terminator
    pub fn with_terminator(config: &ExitConfig, terminator: Arc<dyn Terminator>) -> Self {
        debug!(?config, "ExitHandler::with_terminator: called");
        Self {
            inner: Arc::new(ExitInner {
                registry: Mutex::new(ShutdownRegistry::new()),
                armed: AtomicBool::new(false),
                handled: AtomicBool::new(false),
                timeout_enabled: watch::Sender::new(config.timeout_enabled),
                timeout: config.timeout(),
                handle_signals: config.handle_signals,
                listener_started: AtomicBool::new(false),
                listening: AtomicBool::new(false),
                listener_cancel: CancellationToken::new(),
                terminator,
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<ExitInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &ExitInner {
        &self.inner
    }

    fn registry(&self) -> MutexGuard<'_, ShutdownRegistry> {
        self.inner.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a handler at the end of the chain
    pub fn bind<F, Fut>(&self, handler: F) -> Result<HandlerId, ExitError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = eyre::Result<()>> + Send + 'static,
    {
        self.insert(Arc::new(move || handler().boxed()), false)
    }

    /// Register a handler at the front of the chain
    pub fn bind_first<F, Fut>(&self, handler: F) -> Result<HandlerId, ExitError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = eyre::Result<()>> + Send + 'static,
    {
        self.insert(Arc::new(move || handler().boxed()), true)
    }

    fn insert(&self, handler: ShutdownHandler, prepend: bool) -> Result<HandlerId, ExitError> {
        let id = self.registry().insert(handler, prepend).ok_or(ExitError::Frozen)?;
        self.arm();
        Ok(id)
    }

    /// Remove a registration; returns false if it was not bound
    pub fn unbind(&self, id: HandlerId) -> bool {
        debug!(%id, "ExitHandler::unbind: called");
        let (removed, empty) = {
            let mut registry = self.registry();
            let removed = registry.remove(id);
            (removed, registry.is_empty())
        };

        if removed && empty {
            debug!("ExitHandler::unbind: registry empty, disarming signal handling");
            self.inner.armed.store(false, Ordering::SeqCst);
        }
        removed
    }

    fn arm(&self) {
        self.inner.armed.store(true, Ordering::SeqCst);

        if !self.inner.handle_signals || self.inner.listener_started.swap(true, Ordering::SeqCst) {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                signals::spawn_listener(&handle, Arc::downgrade(&self.inner), self.inner.listener_cancel.clone());
                debug!("ExitHandler::arm: signal listener installed");
            }
            Err(e) => {
                self.inner.listener_started.store(false, Ordering::SeqCst);
                warn!(error = %e, "No runtime, termination signals will not run shutdown handlers");
            }
        }
    }

    /// Number of bound handlers
    pub fn handler_count(&self) -> usize {
        self.registry().len()
    }

    /// Whether the chain has started
    pub fn is_handled(&self) -> bool {
        self.inner.handled.load(Ordering::SeqCst)
    }

    /// Bound the chain by the configured budget
    ///
    /// If the budget already ran out while the timeout was off, the rest of
    /// the chain gets a fresh budget from this point.
    pub fn enable_exit_timeout(&self) {
        debug!("ExitHandler::enable_exit_timeout: called");
        self.inner.timeout_enabled.send_replace(true);
    }

    /// Let the chain take as long as it needs
    pub fn disable_exit_timeout(&self) {
        debug!("ExitHandler::disable_exit_timeout: called");
        self.inner.timeout_enabled.send_replace(false);
    }

    pub fn exit_timeout_enabled(&self) -> bool {
        *self.inner.timeout_enabled.borrow()
    }

    /// Run the shutdown chain and exit with `code`
    pub async fn exit_gracefully(&self, code: i32) -> ExitOutcome {
        self.trigger(ExitReason::Requested(code)).await
    }

    /// Funnel an unhandled asynchronous error into the shutdown chain
    pub async fn report_fatal(&self, err: eyre::Report) -> ExitOutcome {
        error!(error = ?err, "Unhandled error, shutting down");
        self.trigger(ExitReason::Fatal(format!("{:#}", err))).await
    }

    /// Spawn a task whose error, if any, shuts the process down
    pub fn spawn_guarded<F>(&self, future: F) -> JoinHandle<()>
    where
        F: Future<Output = eyre::Result<()>> + Send + 'static,
    {
        let exit = self.clone();
        tokio::spawn(async move {
            if let Err(e) = future.await {
                exit.report_fatal(e).await;
            }
        })
    }

    /// Route panics anywhere in the process into the shutdown chain
    ///
    /// The previous hook still runs first, so the panic message is printed.
    /// Panics raised under [`catch_recovered`](super::catch_recovered) are
    /// handled where they happen and only logged here.
    pub fn install_panic_hook(&self) -> Result<(), ExitError> {
        let handle = tokio::runtime::Handle::try_current().map_err(|e| ExitError::NoRuntime(e.to_string()))?;
        let inner = Arc::downgrade(&self.inner);
        let previous = std::panic::take_hook();

        std::panic::set_hook(Box::new(move |info| {
            if recover::is_recovering() {
                debug!(panic = %info, "Recovered panic, not shutting down");
                return;
            }
            previous(info);
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let exit = ExitHandler::from_inner(inner);
            let message = info.to_string();
            handle.spawn(async move {
                exit.trigger(ExitReason::Fatal(message)).await;
            });
        }));

        debug!("ExitHandler::install_panic_hook: installed");
        Ok(())
    }

    /// Run the chain once; later triggers return `AlreadyHandled`
    pub async fn trigger(&self, reason: ExitReason) -> ExitOutcome {
        if self.inner.handled.swap(true, Ordering::SeqCst) {
            debug!(%reason, "ExitHandler::trigger: already handled");
            return ExitOutcome::AlreadyHandled;
        }

        let handlers = self.registry().freeze();
        info!(%reason, handlers = handlers.len(), "Running shutdown handlers");

        let mut enabled = self.inner.timeout_enabled.subscribe();
        let chain = run_chain(handlers);
        tokio::pin!(chain);
        let deadline = tokio::time::sleep(self.inner.timeout);
        tokio::pin!(deadline);
        let mut deadline_pending = true;

        let result = loop {
            tokio::select! {
                result = &mut chain => break result,
                _ = &mut deadline, if deadline_pending => {
                    if self.exit_timeout_enabled() {
                        error!(
                            timeout_ms = self.inner.timeout.as_millis() as u64,
                            "Shutdown handlers exceeded their time budget"
                        );
                        self.inner.terminator.kill();
                        return ExitOutcome::ForceKilled;
                    }
                    debug!("ExitHandler::trigger: budget passed with timeout disabled, waiting");
                    deadline_pending = false;
                }
                Ok(()) = enabled.changed(), if !deadline_pending => {
                    if *enabled.borrow_and_update() {
                        debug!("ExitHandler::trigger: timeout re-enabled, restarting budget");
                        deadline.as_mut().reset(tokio::time::Instant::now() + self.inner.timeout);
                        deadline_pending = true;
                    }
                }
            }
        };

        match result {
            Ok(()) => {
                let code = reason.exit_code();
                info!(code, "Shutdown complete");
                self.inner.terminator.exit(code);
                ExitOutcome::Exited(code)
            }
            Err(e) => {
                error!(error = ?e, "Shutdown chain failed");
                self.inner.terminator.kill();
                ExitOutcome::ForceKilled
            }
        }
    }
}

/// Await every handler in order, stopping at the first failure
async fn run_chain(handlers: Vec<(HandlerId, ShutdownHandler)>) -> eyre::Result<()> {
    for (id, handler) in handlers {
        debug!(%id, "run_chain: running handler");
        match catch_recovered(async { handler().await }).await {
            Ok(Ok(())) => debug!(%id, "run_chain: handler finished"),
            Ok(Err(e)) => return Err(e.wrap_err(format!("Shutdown handler {} failed", id))),
            Err(_) => return Err(eyre!("Shutdown handler {} panicked", id)),
        }
    }
    Ok(())
}
