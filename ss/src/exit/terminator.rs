//! Process termination

use tracing::error;

/// Performs the final process exit once the shutdown chain settles
///
/// The orchestrator never calls `std::process::exit` directly so isolated
/// instances can run inside tests.
pub trait Terminator: Send + Sync {
    /// Exit with the given status code
    fn exit(&self, code: i32);

    /// Terminate immediately, without further cleanup
    fn kill(&self);
}

/// Terminator for the real process
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessTerminator;

impl Terminator for ProcessTerminator {
    fn exit(&self, code: i32) {
        std::process::exit(code);
    }

    fn kill(&self) {
        error!("Forcing process termination");

        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;

            let _ = kill(Pid::this(), Signal::SIGKILL);
        }

        std::process::abort();
    }
}
