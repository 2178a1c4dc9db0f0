//! Termination signal listener

use std::sync::Weak;
use std::sync::atomic::Ordering;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::handler::{ExitHandler, ExitInner, ExitReason};

/// Exit code used when a signal arrives with nothing bound
fn unhandled_code(signo: i32) -> i32 {
    128 + signo
}

/// Spawn the listener task on the current runtime
///
/// The task lives as long as the orchestrator. While the registry is empty
/// the listener is disarmed and a signal terminates the process without
/// running anything, matching the default disposition.
pub(crate) fn spawn_listener(handle: &tokio::runtime::Handle, inner: Weak<ExitInner>, cancel: CancellationToken) {
    debug!("spawn_listener: called");
    handle.spawn(async move {
        if let Err(e) = listen(inner, cancel).await {
            warn!(error = %e, "Signal listener stopped");
        }
    });
}

fn mark_listening(inner: &Weak<ExitInner>) {
    if let Some(inner) = inner.upgrade() {
        inner.listening.store(true, Ordering::SeqCst);
    }
}

fn on_signal(inner: &Weak<ExitInner>, name: &'static str, signo: i32) -> bool {
    let Some(inner) = inner.upgrade() else {
        debug!(name, "on_signal: orchestrator dropped, stopping listener");
        return false;
    };
    let exit = ExitHandler::from_inner(inner);

    if exit.inner().armed.load(Ordering::SeqCst) {
        info!(signal = name, "Termination signal received");
        tokio::spawn(async move {
            exit.trigger(ExitReason::Signal(name)).await;
        });
    } else {
        warn!(signal = name, "Termination signal received with no shutdown handlers bound");
        exit.inner().terminator.exit(unhandled_code(signo));
    }
    true
}

#[cfg(unix)]
async fn listen(inner: Weak<ExitInner>, cancel: CancellationToken) -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;
    let mut sighup = signal(SignalKind::hangup())?;
    debug!("listen: unix signal handlers installed");
    mark_listening(&inner);

    loop {
        let keep_going = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("listen: cancelled");
                false
            }
            _ = sigint.recv() => on_signal(&inner, "SIGINT", 2),
            _ = sigterm.recv() => on_signal(&inner, "SIGTERM", 15),
            _ = sigquit.recv() => on_signal(&inner, "SIGQUIT", 3),
            _ = sighup.recv() => on_signal(&inner, "SIGHUP", 1),
        };
        if !keep_going {
            return Ok(());
        }
    }
}

#[cfg(windows)]
async fn listen(inner: Weak<ExitInner>, cancel: CancellationToken) -> std::io::Result<()> {
    use tokio::signal::windows::{ctrl_break, ctrl_c};

    let mut ctrl_c = ctrl_c()?;
    let mut ctrl_break = ctrl_break()?;
    debug!("listen: console control handlers installed");
    mark_listening(&inner);

    loop {
        let keep_going = tokio::select! {
            _ = cancel.cancelled() => false,
            _ = ctrl_c.recv() => on_signal(&inner, "CTRL_C", 2),
            _ = ctrl_break.recv() => on_signal(&inner, "CTRL_BREAK", 21),
        };
        if !keep_going {
            return Ok(());
        }
    }
}

#[cfg(not(any(unix, windows)))]
async fn listen(inner: Weak<ExitInner>, cancel: CancellationToken) -> std::io::Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => {}
        result = tokio::signal::ctrl_c() => {
            result?;
            on_signal(&inner, "CTRL_C", 2);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unhandled_code_follows_shell_convention() {
        assert_eq!(unhandled_code(2), 130);
        assert_eq!(unhandled_code(15), 143);
    }

    #[cfg(unix)]
    mod unix {
        use std::sync::atomic::AtomicUsize;
        use std::sync::{Arc, Mutex};
        use std::time::Duration;

        use nix::sys::signal::{Signal, raise};
        use serial_test::serial;

        use super::*;
        use crate::exit::{ExitConfig, Terminator};

        #[derive(Default)]
        struct Recorder(Mutex<Vec<Option<i32>>>);

        impl Recorder {
            fn calls(&self) -> Vec<Option<i32>> {
                self.0.lock().unwrap().clone()
            }
        }

        impl Terminator for Recorder {
            fn exit(&self, code: i32) {
                self.0.lock().unwrap().push(Some(code));
            }

            fn kill(&self) {
                self.0.lock().unwrap().push(None);
            }
        }

        fn listening_exit() -> (ExitHandler, Arc<Recorder>) {
            let config = ExitConfig {
                handle_signals: true,
                ..Default::default()
            };
            let recorder = Arc::new(Recorder::default());
            (ExitHandler::with_terminator(&config, recorder.clone()), recorder)
        }

        async fn wait_for(mut ready: impl FnMut() -> bool) {
            tokio::time::timeout(Duration::from_secs(5), async {
                while !ready() {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await
            .unwrap();
        }

        #[tokio::test]
        #[serial]
        async fn test_sigterm_runs_chain_once() {
            let (exit, recorder) = listening_exit();
            let runs = Arc::new(AtomicUsize::new(0));

            let r = runs.clone();
            exit.bind(move || {
                let r = r.clone();
                async move {
                    r.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .unwrap();
            wait_for(|| exit.inner().listening.load(Ordering::SeqCst)).await;

            raise(Signal::SIGTERM).unwrap();
            wait_for(|| !recorder.calls().is_empty()).await;

            raise(Signal::SIGTERM).unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;

            assert!(exit.is_handled());
            assert_eq!(runs.load(Ordering::SeqCst), 1);
            assert_eq!(recorder.calls(), vec![Some(0)]);
        }

        #[tokio::test]
        #[serial]
        async fn test_signal_after_unbind_exits_with_signal_code() {
            let (exit, recorder) = listening_exit();
            let ran = Arc::new(AtomicUsize::new(0));

            let r = ran.clone();
            let id = exit
                .bind(move || {
                    let r = r.clone();
                    async move {
                        r.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                })
                .unwrap();
            wait_for(|| exit.inner().listening.load(Ordering::SeqCst)).await;
            assert!(exit.unbind(id));

            raise(Signal::SIGTERM).unwrap();
            wait_for(|| !recorder.calls().is_empty()).await;

            assert!(!exit.is_handled());
            assert_eq!(ran.load(Ordering::SeqCst), 0);
            assert_eq!(recorder.calls(), vec![Some(143)]);
        }
    }
}
