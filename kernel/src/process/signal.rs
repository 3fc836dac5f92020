//! Signal marking and default dispositions.
//!
//! `kill` only sets a pending bit; delivery happens at the timer-tick
//! checkpoint against the current process. Default actions terminate,
//! stop, or continue; user handlers are recorded but never run on the user
//! stack. The pending bit is still consumed so handlers can be polled.

use super::scheduler::{Scheduler, SwitchDecision};
use super::{sig, Process, ProcessId, ProcessState, SignalDisposition, NSIG};
use crate::error::KernelError;

/// Mark `signal` pending on `pid`.
///
/// SIGCONT additionally unblocks a stopped target right away, since a
/// blocked process never reaches the delivery checkpoint on its own.
pub fn send(sched: &mut Scheduler, pid: ProcessId, signal: u32) -> Result<(), KernelError> {
    if signal == 0 || signal as usize >= NSIG {
        return Err(KernelError::InvalidArgument);
    }
    let p = sched.get_mut(pid).ok_or(KernelError::NotFound)?;
    if p.state == ProcessState::Terminated {
        return Err(KernelError::NotFound);
    }
    p.pending_signals |= 1 << signal;

    if signal == sig::SIGCONT && p.state == ProcessState::Blocked {
        sched.unblock(pid)?;
    }
    Ok(())
}

/// Replace a signal's disposition, returning the old one.
/// SIGKILL and SIGSTOP cannot be caught or ignored.
pub fn set_disposition(
    p: &mut Process,
    signal: u32,
    disposition: SignalDisposition,
) -> Result<SignalDisposition, KernelError> {
    if signal == 0 || signal as usize >= NSIG {
        return Err(KernelError::InvalidArgument);
    }
    if signal == sig::SIGKILL || signal == sig::SIGSTOP {
        return Err(KernelError::InvalidArgument);
    }
    let old = p.signal_dispositions[signal as usize];
    p.signal_dispositions[signal as usize] = disposition;
    Ok(old)
}

fn default_action_terminates(signal: u32) -> bool {
    matches!(
        signal,
        sig::SIGHUP
            | sig::SIGINT
            | sig::SIGQUIT
            | sig::SIGILL
            | sig::SIGABRT
            | sig::SIGKILL
            | sig::SIGSEGV
            | sig::SIGTERM
    )
}

/// Deliver every pending signal of the current process. Returns a switch
/// decision when a default action took the process off the CPU.
pub fn deliver_pending(sched: &mut Scheduler) -> SwitchDecision {
    let current = sched.current_pid();
    let (mut pending, dispositions) = match sched.get_mut(current) {
        Some(p) if p.pending_signals != 0 => {
            let pending = p.pending_signals;
            p.pending_signals = 0;
            (pending, p.signal_dispositions)
        }
        _ => return None,
    };

    for signal in 1..NSIG as u32 {
        if pending & (1 << signal) == 0 {
            continue;
        }
        pending &= !(1 << signal);

        // SIGKILL and SIGSTOP ignore the disposition table.
        let disposition = if signal == sig::SIGKILL || signal == sig::SIGSTOP {
            SignalDisposition::Default
        } else {
            dispositions[signal as usize]
        };

        match disposition {
            SignalDisposition::Ignore => {}
            SignalDisposition::Handler(entry) => {
                log::debug!(
                    "signal {} handler at {:#x} for {} (no cross-ring delivery)",
                    signal,
                    entry,
                    current
                );
            }
            SignalDisposition::Default => {
                if default_action_terminates(signal) {
                    log::info!("process {} terminated by signal {}", current, signal);
                    // Re-queue the signals we did not get to.
                    if let Some(p) = sched.get_mut(current) {
                        p.pending_signals |= pending;
                    }
                    return sched.kill(current, -(signal as i32)).unwrap_or(None);
                }
                if signal == sig::SIGSTOP {
                    if let Some(p) = sched.get_mut(current) {
                        p.pending_signals |= pending;
                    }
                    return sched.block(current).unwrap_or(None);
                }
                // SIGCHLD, SIGCONT and the rest default to ignore here.
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler_with_worker() -> (Scheduler, ProcessId) {
        crate::testing::init_test_pmm();
        let mut s = Scheduler::new();
        s.adopt_boot_task("init").unwrap();
        let pid = s.spawn_kernel_task(0x1000, "worker", 0).unwrap();
        (s, pid)
    }

    #[test]
    fn invalid_signal_numbers_are_rejected() {
        let (mut s, pid) = scheduler_with_worker();
        assert!(send(&mut s, pid, 0).is_err());
        assert!(send(&mut s, pid, NSIG as u32).is_err());
        assert!(send(&mut s, ProcessId(999), sig::SIGTERM).is_err());
    }

    #[test]
    fn sigterm_default_terminates_at_checkpoint() {
        let (mut s, pid) = scheduler_with_worker();
        // Make the worker current.
        s.yield_current().unwrap();
        assert_eq!(s.current_pid(), pid);
        send(&mut s, pid, sig::SIGTERM).unwrap();

        deliver_pending(&mut s);
        assert_eq!(s.get(pid).unwrap().state, ProcessState::Terminated);
        assert_eq!(s.get(pid).unwrap().exit_status, -(sig::SIGTERM as i32));
    }

    #[test]
    fn ignored_signal_is_consumed_without_action() {
        let (mut s, pid) = scheduler_with_worker();
        s.yield_current().unwrap();
        set_disposition(
            s.get_mut(pid).unwrap(),
            sig::SIGTERM,
            SignalDisposition::Ignore,
        )
        .unwrap();
        send(&mut s, pid, sig::SIGTERM).unwrap();
        assert_eq!(deliver_pending(&mut s), None);
        assert_eq!(s.get(pid).unwrap().state, ProcessState::Running);
        assert_eq!(s.get(pid).unwrap().pending_signals, 0);
    }

    #[test]
    fn sigkill_cannot_be_ignored() {
        let (mut s, pid) = scheduler_with_worker();
        assert!(set_disposition(
            s.get_mut(pid).unwrap(),
            sig::SIGKILL,
            SignalDisposition::Ignore
        )
        .is_err());

        s.yield_current().unwrap();
        send(&mut s, pid, sig::SIGKILL).unwrap();
        deliver_pending(&mut s);
        assert_eq!(s.get(pid).unwrap().state, ProcessState::Terminated);
    }

    #[test]
    fn sigstop_blocks_and_sigcont_resumes() {
        let (mut s, pid) = scheduler_with_worker();
        s.yield_current().unwrap();
        send(&mut s, pid, sig::SIGSTOP).unwrap();
        deliver_pending(&mut s);
        assert_eq!(s.get(pid).unwrap().state, ProcessState::Blocked);

        send(&mut s, pid, sig::SIGCONT).unwrap();
        assert_eq!(s.get(pid).unwrap().state, ProcessState::Ready);
    }

    #[test]
    fn handler_disposition_consumes_without_termination() {
        let (mut s, pid) = scheduler_with_worker();
        s.yield_current().unwrap();
        set_disposition(
            s.get_mut(pid).unwrap(),
            sig::SIGTERM,
            SignalDisposition::Handler(0x0040_2000),
        )
        .unwrap();
        send(&mut s, pid, sig::SIGTERM).unwrap();
        assert_eq!(deliver_pending(&mut s), None);
        assert_eq!(s.get(pid).unwrap().state, ProcessState::Running);
    }
}
