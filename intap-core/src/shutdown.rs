//! Clean-shutdown plumbing: a `SIGINT`/`SIGTERM` handler that interrupts an
//! in-progress, infinitely-blocked `SocketSet::wait()` via a `mio::Waker`
//! rather than by shortening the poll timeout. The event loop still blocks
//! with an infinite timeout in the steady state; only a signal wakes it
//! early.

use mio::{Token, Waker};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub const WAKER_TOKEN: Token = Token(usize::MAX - 1);

pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
}

impl ShutdownHandle {
    /// Installs a signal handler that flips the flag and wakes `registry`.
    /// Returns an object the event loop can poll each cycle.
    pub fn install(registry: &mio::Registry) -> std::io::Result<ShutdownHandle> {
        let waker = Arc::new(Waker::new(registry, WAKER_TOKEN)?);
        let flag = Arc::new(AtomicBool::new(false));

        let flag_for_handler = flag.clone();
        ctrlc::set_handler(move || {
            flag_for_handler.store(true, Ordering::SeqCst);
            let _ = waker.wake();
        })
        .expect("signal handler can only be installed once");

        Ok(ShutdownHandle { flag })
    }

    pub fn requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}
