//! Async-signal flags consumed by the display loops.
//!
//! SIGCONT means the process regained the foreground after a suspend, so the
//! recorded cursor origin may be stale; SIGWINCH means the terminal was
//! resized. Handlers only set flags, the loops pick them up on their next
//! tick.

use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

static GOT_CONT: AtomicBool = AtomicBool::new(false);
static GOT_WINCH: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_cont(_: libc::c_int) {
    GOT_CONT.store(true, Ordering::SeqCst);
}

extern "C" fn handle_winch(_: libc::c_int) {
    GOT_WINCH.store(true, Ordering::SeqCst);
}

/// Install the SIGCONT and SIGWINCH flag handlers.
pub fn install() -> nix::Result<()> {
    let cont = SigAction::new(
        SigHandler::Handler(handle_cont),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    let winch = SigAction::new(
        SigHandler::Handler(handle_winch),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    unsafe {
        sigaction(Signal::SIGCONT, &cont)?;
        sigaction(Signal::SIGWINCH, &winch)?;
    }
    Ok(())
}

/// Consume the "regained foreground" flag.
pub fn take_continued() -> bool {
    GOT_CONT.swap(false, Ordering::SeqCst)
}

/// Consume the "terminal resized" flag.
pub fn take_resized() -> bool {
    GOT_WINCH.swap(false, Ordering::SeqCst)
}
