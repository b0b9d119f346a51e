//! Interrupt-driven cleanup of every socket the process has opened.
//!
//! The acceptor registers the raw fd of each socket it creates (the listener
//! and every accepted connection). When an interrupt arrives, or a fatal
//! error path asks for it, every registered fd is closed in registration
//! order and the process exits with failure status.

use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};

use tracing::{debug, error, info};

/// Append-only record of every socket fd opened since process start.
///
/// Entries are never removed: a connection task that finishes leaves its fd
/// behind, so the cleanup pass may close an fd that is already closed.
/// `close(2)` fails with EBADF in that case, which is ignored.
pub struct HandleRegistry {
    fds: Mutex<Vec<RawFd>>,
}

impl Default for HandleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self {
            fds: Mutex::new(Vec::new()),
        }
    }

    /// Record a newly opened socket.
    pub fn register(&self, fd: RawFd) {
        self.fds.lock().expect("registry lock poisoned").push(fd);
    }

    /// Close every registered fd, in registration order.
    ///
    /// Errors from already-closed fds are ignored.
    pub fn close_all(&self) {
        let fds = self.fds.lock().expect("registry lock poisoned");
        for &fd in fds.iter() {
            unsafe { libc::close(fd) };
        }
    }

    /// Number of fds registered so far.
    pub fn len(&self) -> usize {
        self.fds.lock().expect("registry lock poisoned").len()
    }

    /// Snapshot of the registered fds for testing
    #[cfg(test)]
    fn snapshot(&self) -> Vec<RawFd> {
        self.fds.lock().expect("registry lock poisoned").clone()
    }
}

/// Close every tracked socket and exit with failure status.
///
/// Fatal error paths call this directly; the interrupt handler lands here as
/// well. This is the only path that ever closes the listening socket.
pub fn cleanup_and_exit(registry: &HandleRegistry) -> ! {
    info!(handles = registry.len(), "Cleaning up");
    registry.close_all();
    std::process::exit(1);
}

/// Install the interrupt handler.
///
/// Spawned before the listener starts, so an early interrupt still finds the
/// registry. Failure to listen for the signal is treated like any other
/// fatal error.
pub fn install_interrupt_handler(registry: Arc<HandleRegistry>) {
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for interrupt signal");
            cleanup_and_exit(&registry);
        }
        debug!("Interrupt received");
        cleanup_and_exit(&registry);
    });
}
