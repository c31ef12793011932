//! Signal trapping for the event loop
//!
//! The installed handler only flags the signal as pending; the event loop
//! picks the flag up at the top of its next turn and runs the registered
//! callback on the loop thread. The handler interrupts `epoll_wait`, so a
//! blocked loop notices promptly.

use costack_core::error::{CoError, CoResult};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::{AtomicBool, Ordering};

const MAX_SIGNAL: usize = 65;

static PENDING: [AtomicBool; MAX_SIGNAL] = [const { AtomicBool::new(false) }; MAX_SIGNAL];

extern "C" fn on_signal(signo: libc::c_int) {
    if let Some(flag) = PENDING.get(signo as usize) {
        flag.store(true, Ordering::Release);
    }
}

/// Route `sig` to the pending-flag handler
pub fn install(sig: Signal) -> CoResult<()> {
    let action = SigAction::new(SigHandler::Handler(on_signal), SaFlags::empty(), SigSet::empty());
    unsafe { signal::sigaction(sig, &action) }.map_err(|e| CoError::Os(e as i32))?;
    Ok(())
}

/// Restore the default disposition of `sig`
pub fn uninstall(sig: Signal) -> CoResult<()> {
    let action = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    unsafe { signal::sigaction(sig, &action) }.map_err(|e| CoError::Os(e as i32))?;
    Ok(())
}

/// Consume the pending flag of `sig`
pub fn take_pending(sig: Signal) -> bool {
    PENDING
        .get(sig as usize)
        .map(|flag| flag.swap(false, Ordering::AcqRel))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raise_sets_pending() {
        install(Signal::SIGUSR2).unwrap();
        assert!(!take_pending(Signal::SIGUSR2));
        signal::raise(Signal::SIGUSR2).unwrap();
        assert!(take_pending(Signal::SIGUSR2));
        assert!(!take_pending(Signal::SIGUSR2));
        uninstall(Signal::SIGUSR2).unwrap();
    }
}
