//! Process and thread signal helpers.
//!
//! The reactor assumes two pieces of process-global signal state:
//! `SIGPIPE` is ignored (a write to a disconnected peer must surface as
//! `EPIPE`, not kill the process), and threads that want to wait for
//! `SIGINT`/`SIGTERM` block them and collect them with
//! [`thread_wait_for_signal`] on one thread, usually main.

use crate::error::{Error, Result};
use std::mem::MaybeUninit;

/// Ignores `sig` process-wide.
pub fn ignore_signal(sig: libc::c_int) -> Result<()> {
    if unsafe { libc::signal(sig, libc::SIG_IGN) } == libc::SIG_ERR {
        return Err(Error::system(format!("ignore signal {sig}")));
    }
    Ok(())
}

/// Restores the default disposition of `sig`.
pub fn reset_signal(sig: libc::c_int) -> Result<()> {
    if unsafe { libc::signal(sig, libc::SIG_DFL) } == libc::SIG_ERR {
        return Err(Error::system(format!("reset signal {sig}")));
    }
    Ok(())
}

fn sigset_of(sigs: &[libc::c_int]) -> libc::sigset_t {
    let mut set = MaybeUninit::<libc::sigset_t>::uninit();
    unsafe {
        libc::sigemptyset(set.as_mut_ptr());
        for sig in sigs {
            libc::sigaddset(set.as_mut_ptr(), *sig);
        }
        set.assume_init()
    }
}

fn mask_signals(how: libc::c_int, sigs: &[libc::c_int]) -> Result<()> {
    let set = sigset_of(sigs);
    let ret = unsafe { libc::pthread_sigmask(how, &set, std::ptr::null_mut()) };
    if ret != 0 {
        return Err(Error::system_errno("pthread_sigmask", ret));
    }
    Ok(())
}

/// Blocks `sig` for the calling thread.
pub fn thread_block_signal(sig: libc::c_int) -> Result<()> {
    mask_signals(libc::SIG_BLOCK, &[sig])
}

/// Blocks several signals for the calling thread.
pub fn thread_block_signals(sigs: &[libc::c_int]) -> Result<()> {
    mask_signals(libc::SIG_BLOCK, sigs)
}

/// Unblocks `sig` for the calling thread.
pub fn thread_unblock_signal(sig: libc::c_int) -> Result<()> {
    mask_signals(libc::SIG_UNBLOCK, &[sig])
}

/// Unblocks several signals for the calling thread.
pub fn thread_unblock_signals(sigs: &[libc::c_int]) -> Result<()> {
    mask_signals(libc::SIG_UNBLOCK, sigs)
}

/// Waits until one of `sigs` is delivered to this thread and returns it.
/// The signals must already be blocked on every thread of the process.
pub fn thread_wait_for_signals(sigs: &[libc::c_int]) -> Result<libc::c_int> {
    let set = sigset_of(sigs);
    let mut got: libc::c_int = 0;
    let ret = unsafe { libc::sigwait(&set, &mut got) };
    if ret != 0 {
        return Err(Error::system_errno("sigwait", ret));
    }
    Ok(got)
}

/// Waits until `sig` is delivered to this thread.
pub fn thread_wait_for_signal(sig: libc::c_int) -> Result<()> {
    thread_wait_for_signals(&[sig]).map(|_| ())
}

/// Raises `sig` on the calling thread.
pub fn thread_raise_signal(sig: libc::c_int) -> Result<()> {
    let ret = unsafe { libc::pthread_kill(libc::pthread_self(), sig) };
    if ret != 0 {
        return Err(Error::system_errno("pthread_kill", ret));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_and_collect_a_raised_signal() {
        thread_block_signal(libc::SIGUSR1).expect("block");
        thread_raise_signal(libc::SIGUSR1).expect("raise");
        let got = thread_wait_for_signals(&[libc::SIGUSR1]).expect("sigwait");
        assert_eq!(got, libc::SIGUSR1);
        thread_unblock_signal(libc::SIGUSR1).expect("unblock");
    }

    #[test]
    fn ignore_and_reset() {
        // SIGUSR2 rather than SIGPIPE; other tests in this binary rely
        // on SIGPIPE staying ignored.
        ignore_signal(libc::SIGUSR2).expect("ignore");
        reset_signal(libc::SIGUSR2).expect("reset");
    }
}
