use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use nix::sys::signal::{kill, sigaction, sigprocmask, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal};
use nix::unistd::{fork, getpid, ForkResult, Pid};

// one pending-signal event per process; barriers are used sequentially
static SIGNALLED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigusr1(_: libc::c_int) {
    SIGNALLED.store(true, Ordering::SeqCst);
}

/// Block SIGUSR1 in the calling thread. Must run before any other threads
/// are spawned: they inherit the mask, so the barrier's suspension point
/// stays the only place the signal can be delivered.
pub fn reserve_signal() -> Result<()> {
    let mut block = SigSet::empty();
    block.add(Signal::SIGUSR1);
    sigprocmask(SigmaskHow::SIG_BLOCK, Some(&block), None)?;
    Ok(())
}

/// Pairwise rendezvous between a parent and its forked child. Either side
/// calls `signal()` to release the other's pending `wait()`, carried over
/// SIGUSR1. The constructor installs the handler and forks; dropping the
/// barrier restores the default disposition.
pub struct ForkBarrier {
    is_child: bool,
    peer: Option<Pid>,
}

impl ForkBarrier {
    pub fn fork() -> Result<Self> {
        SIGNALLED.store(false, Ordering::SeqCst);

        let action = SigAction::new(
            SigHandler::Handler(on_sigusr1),
            SaFlags::empty(),
            SigSet::empty(),
        );
        unsafe { sigaction(Signal::SIGUSR1, &action)? };

        // keep SIGUSR1 blocked outside wait() so a signal arriving between
        // the flag check and the suspension is left pending, not lost
        reserve_signal()?;

        let parent = getpid();
        // SAFE: both processes are single-threaded at this point
        match unsafe { fork()? } {
            ForkResult::Parent { child } => Ok(Self {
                is_child: false,
                peer: Some(child),
            }),
            ForkResult::Child => Ok(Self {
                is_child: true,
                peer: Some(parent),
            }),
        }
    }

    pub fn is_child(&self) -> bool {
        self.is_child
    }

    pub fn is_parent(&self) -> bool {
        !self.is_child
    }

    pub fn peer(&self) -> Option<Pid> {
        self.peer
    }

    /// Release the other side's pending or future `wait()`. No-op when the
    /// peer pid is unset.
    pub fn signal(&self) -> Result<()> {
        if let Some(peer) = self.peer {
            kill(peer, Signal::SIGUSR1)?;
        }
        Ok(())
    }

    /// Block until the other side signals, then clear the event.
    pub fn wait(&self) -> Result<()> {
        loop {
            if SIGNALLED.swap(false, Ordering::SeqCst) {
                return Ok(());
            }
            // atomically unblock SIGUSR1 and suspend; sigsuspend returns
            // once the handler has run
            unsafe {
                let mut mask = MaybeUninit::<libc::sigset_t>::uninit();
                libc::sigemptyset(mask.as_mut_ptr());
                libc::sigsuspend(mask.as_ptr());
            }
        }
    }
}

impl Drop for ForkBarrier {
    fn drop(&mut self) {
        // restore the default disposition but leave the signal blocked:
        // it stays reserved for barrier use, and a stray late signal must
        // not be able to kill the process
        let action = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        unsafe {
            let _ = sigaction(Signal::SIGUSR1, &action);
        }
    }
}

/// Undo `reserve_signal`, for an exec'd payload that should not inherit a
/// blocked SIGUSR1.
pub fn release_signal() -> Result<()> {
    let mut unblock = SigSet::empty();
    unblock.add(Signal::SIGUSR1);
    sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&unblock), None)?;
    Ok(())
}
