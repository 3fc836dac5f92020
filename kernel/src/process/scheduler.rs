//! Process table and preemptive scheduler.
//!
//! Single CPU, priority-weighted round-robin. The run queue is a deque of
//! pids in cyclic order; the running process is not on it. Every timer
//! tick charges the current process one tick of its slice and reschedules
//! when the slice drains or the process stopped being runnable.
//!
//! Protocol with hardware on a switch: write the incoming kernel-stack top
//! into the TSS ring-0 slot and load the incoming directory into CR3
//! before the assembly switch consumes the saved stack pointers.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::String;
use alloc::vec::Vec;

use lazy_static::lazy_static;
use spin::Mutex;

use super::{creation, Process, ProcessId, ProcessState};
use crate::error::KernelError;
use crate::mm::{AddressSpace, FrameSource};

/// Ticks granted per slice: `10 + priority / 64`.
pub fn time_slice_for(priority: u8) -> u32 {
    10 + priority as u32 / 64
}

/// Outcome of a wait attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// A terminated child was reaped: (pid, exit status)
    Reaped(ProcessId, i32),
    /// The child exists but has not terminated
    StillRunning,
    /// No such child
    NoChild,
}

/// A pending context switch: (outgoing, incoming).
pub type SwitchDecision = Option<(ProcessId, ProcessId)>;

/// The process table plus scheduling state.
pub struct Scheduler {
    processes: BTreeMap<ProcessId, Process>,
    run_queue: VecDeque<ProcessId>,
    current: ProcessId,
    next_pid: u32,
    total_ticks: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            processes: BTreeMap::new(),
            run_queue: VecDeque::new(),
            current: ProcessId(0),
            next_pid: 1,
            total_ticks: 0,
        }
    }

    /// Register the already-running boot flow as pid 0. It has a stack, so
    /// only a record to save state into is needed.
    pub fn adopt_boot_task(&mut self, name: &str) -> Result<ProcessId, KernelError> {
        let mut p = Process::new(ProcessId(0), name, 0)?;
        p.state = ProcessState::Running;
        self.current = ProcessId(0);
        self.processes.insert(ProcessId(0), p);
        Ok(ProcessId(0))
    }

    fn allocate_pid(&mut self) -> ProcessId {
        let pid = ProcessId(self.next_pid);
        self.next_pid += 1;
        pid
    }

    /// Create a kernel task that starts at `entry` on its own stack.
    pub fn spawn_kernel_task(
        &mut self,
        entry: usize,
        name: &str,
        priority: u8,
    ) -> Result<ProcessId, KernelError> {
        let pid = self.allocate_pid();
        let mut p = Process::new(pid, name, priority)?;
        // SAFETY: the stack region was just allocated for this task.
        p.stack_ptr = unsafe { creation::build_kernel_task_stack(p.kernel_stack.top(), entry) };
        self.processes.insert(pid, p);
        self.run_queue.push_back(pid);
        log::debug!("spawned kernel task {} ({})", pid, name);
        Ok(pid)
    }

    /// Create a ring-3 task from a flat binary image. The address space is
    /// cloned from `template` (the kernel space), the image is mapped at
    /// the user code base, and the initial kernel stack arranges an iretd
    /// through `trampoline` into ring 3.
    pub fn spawn_user_task(
        &mut self,
        alloc: &mut impl FrameSource,
        template: &AddressSpace,
        image: &[u8],
        trampoline: usize,
        name: &str,
        priority: u8,
    ) -> Result<ProcessId, KernelError> {
        let pid = self.allocate_pid();
        let mut p = Process::new(pid, name, priority)?;
        p.space = Some(template.clone_space(alloc)?);
        let (entry, user_stack) = p.exec_image(alloc, image)?;
        // SAFETY: the stack region was just allocated for this task.
        p.stack_ptr = unsafe {
            creation::build_user_task_stack(p.kernel_stack.top(), trampoline, entry, user_stack)
        };
        self.processes.insert(pid, p);
        self.run_queue.push_back(pid);
        log::debug!("spawned user task {} ({})", pid, name);
        Ok(pid)
    }

    /// Fork the current process: deep-copied address space, duplicated
    /// kernel stack whose switch frame replays `trap` with EAX = 0.
    pub fn fork_current(
        &mut self,
        alloc: &mut impl FrameSource,
        trap: &crate::arch::context::TrapFrame,
        trampoline: usize,
    ) -> Result<ProcessId, KernelError> {
        let pid = self.allocate_pid();
        let parent = self
            .processes
            .get(&self.current)
            .ok_or(KernelError::NotFound)?;

        let mut child = Process::new(pid, parent.name.as_str(), parent.priority)?;
        child.parent = Some(self.current);
        child.brk_start = parent.brk_start;
        child.brk = parent.brk;
        child.files = parent.files;
        child.signal_dispositions = parent.signal_dispositions;
        child.space = match &parent.space {
            Some(space) => Some(space.clone_space(alloc)?),
            None => None,
        };
        child.kernel_stack.copy_from(&parent.kernel_stack);
        // SAFETY: the child stack region was just allocated and copied.
        child.stack_ptr =
            unsafe { creation::build_fork_stack(child.kernel_stack.top(), trampoline, trap) };

        self.processes.insert(pid, child);
        self.run_queue.push_back(pid);
        log::debug!("fork: {} -> {}", self.current, pid);
        Ok(pid)
    }

    pub fn current_pid(&self) -> ProcessId {
        self.current
    }

    pub fn current(&self) -> Option<&Process> {
        self.processes.get(&self.current)
    }

    pub fn current_mut(&mut self) -> Option<&mut Process> {
        self.processes.get_mut(&self.current)
    }

    pub fn get(&self, pid: ProcessId) -> Option<&Process> {
        self.processes.get(&pid)
    }

    pub fn get_mut(&mut self, pid: ProcessId) -> Option<&mut Process> {
        self.processes.get_mut(&pid)
    }

    pub fn process_count(&self) -> usize {
        self.processes.len()
    }

    pub fn total_ticks(&self) -> u64 {
        self.total_ticks
    }

    /// Pids currently on the ready queue.
    pub fn ready_pids(&self) -> Vec<ProcessId> {
        self.run_queue.iter().copied().collect()
    }

    /// `ps`-style snapshot: (pid, name, state, priority, runtime).
    pub fn enumerate(&self) -> Vec<(ProcessId, String, ProcessState, u8, u64)> {
        self.processes
            .values()
            .map(|p| {
                (
                    p.pid,
                    p.name.clone(),
                    p.state,
                    p.priority,
                    p.total_runtime,
                )
            })
            .collect()
    }

    /// Charge one tick to the current process; returns a switch decision
    /// when the slice drained or the current process stopped running.
    pub fn timer_tick(&mut self) -> SwitchDecision {
        self.total_ticks += 1;
        let needs_resched = match self.processes.get_mut(&self.current) {
            Some(p) => {
                p.total_runtime += 1;
                p.time_slice = p.time_slice.saturating_sub(1);
                p.time_slice == 0 || p.state != ProcessState::Running
            }
            None => true,
        };
        if needs_resched {
            self.reschedule()
        } else {
            None
        }
    }

    /// Give up the rest of the slice.
    pub fn yield_current(&mut self) -> SwitchDecision {
        if let Some(p) = self.processes.get_mut(&self.current) {
            p.time_slice = 0;
        }
        self.reschedule()
    }

    /// Pick the next Ready process, starting at the successor of the
    /// current one in cyclic order. Returns `None` when the current
    /// process simply continues (with a fresh slice).
    pub fn reschedule(&mut self) -> SwitchDecision {
        let next = loop {
            match self.run_queue.pop_front() {
                Some(pid) => {
                    // Entries can go stale: killed or blocked while queued.
                    if self
                        .processes
                        .get(&pid)
                        .map(|p| p.state == ProcessState::Ready)
                        .unwrap_or(false)
                    {
                        break Some(pid);
                    }
                }
                None => break None,
            }
        };

        let outgoing = self.current;
        let next = match next {
            Some(pid) => pid,
            None => {
                // Nobody else is ready; keep running if we still can.
                if let Some(p) = self.processes.get_mut(&self.current) {
                    if p.state == ProcessState::Running {
                        p.time_slice = time_slice_for(p.priority);
                    }
                }
                return None;
            }
        };

        if let Some(p) = self.processes.get_mut(&outgoing) {
            if p.state == ProcessState::Running {
                p.state = ProcessState::Ready;
                self.run_queue.push_back(outgoing);
            }
        }

        let incoming = self.processes.get_mut(&next).expect("picked a live pid");
        incoming.state = ProcessState::Running;
        incoming.time_slice = time_slice_for(incoming.priority);
        self.current = next;

        #[cfg(feature = "sched_debug")]
        log::debug!("switch {} -> {}", outgoing, next);

        Some((outgoing, next))
    }

    /// Mark `pid` blocked and drop it from the ready structures. Returns a
    /// switch decision when the current process blocked itself.
    pub fn block(&mut self, pid: ProcessId) -> Result<SwitchDecision, KernelError> {
        let p = self.processes.get_mut(&pid).ok_or(KernelError::NotFound)?;
        if p.state == ProcessState::Terminated {
            return Err(KernelError::InvalidArgument);
        }
        p.state = ProcessState::Blocked;
        self.run_queue.retain(|&q| q != pid);
        if pid == self.current {
            Ok(self.reschedule())
        } else {
            Ok(None)
        }
    }

    /// Make a blocked process runnable again.
    pub fn unblock(&mut self, pid: ProcessId) -> Result<(), KernelError> {
        let p = self.processes.get_mut(&pid).ok_or(KernelError::NotFound)?;
        if p.state != ProcessState::Blocked {
            return Err(KernelError::InvalidArgument);
        }
        p.state = ProcessState::Ready;
        p.waiting_for = None;
        self.run_queue.push_back(pid);
        Ok(())
    }

    /// Terminate `pid` with `status`. The record stays in the table until
    /// reaped so the parent can collect the status. When the current
    /// process kills itself the returned decision must be honored
    /// immediately and the killed frame never returned to.
    pub fn kill(&mut self, pid: ProcessId, status: i32) -> Result<SwitchDecision, KernelError> {
        if pid == ProcessId(0) {
            return Err(KernelError::InvalidArgument);
        }
        let p = self.processes.get_mut(&pid).ok_or(KernelError::NotFound)?;
        if p.state == ProcessState::Terminated {
            return Err(KernelError::InvalidArgument);
        }
        p.state = ProcessState::Terminated;
        p.exit_status = status;
        let parent = p.parent;
        self.run_queue.retain(|&q| q != pid);

        // Wake a parent blocked in waitpid on this child (or on any child).
        if let Some(ppid) = parent {
            let waiting = self
                .processes
                .get(&ppid)
                .map(|pp| {
                    pp.state == ProcessState::Blocked
                        && matches!(pp.waiting_for, Some(w) if w == pid)
                })
                .unwrap_or(false);
            if waiting {
                self.unblock(ppid)?;
            }
        }

        log::debug!("killed {} with status {}", pid, status);
        if pid == self.current {
            Ok(self.reschedule())
        } else {
            Ok(None)
        }
    }

    /// Attempt to reap a terminated child of `parent`. The child's
    /// resources are released through `alloc`.
    pub fn try_wait(
        &mut self,
        alloc: &mut impl FrameSource,
        parent: ProcessId,
        pid: ProcessId,
    ) -> Result<WaitResult, KernelError> {
        let child = match self.processes.get(&pid) {
            Some(c) if c.parent == Some(parent) => c,
            _ => return Ok(WaitResult::NoChild),
        };
        if child.state != ProcessState::Terminated {
            return Ok(WaitResult::StillRunning);
        }
        let child = self.processes.remove(&pid).expect("checked above");
        let status = child.exit_status;
        if let Some(space) = child.space {
            space.destroy(alloc)?;
        }
        Ok(WaitResult::Reaped(pid, status))
    }

    /// Change a process's priority. Takes effect with the next slice
    /// refresh; the current slice is left alone.
    pub fn set_priority(&mut self, pid: ProcessId, priority: u8) -> Result<(), KernelError> {
        let p = self.processes.get_mut(&pid).ok_or(KernelError::NotFound)?;
        p.priority = priority;
        Ok(())
    }

    /// Record that `parent` is blocked waiting for `pid`.
    pub fn mark_waiting(&mut self, parent: ProcessId, pid: ProcessId) -> Result<(), KernelError> {
        let p = self
            .processes
            .get_mut(&parent)
            .ok_or(KernelError::NotFound)?;
        p.waiting_for = Some(pid);
        Ok(())
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static! {
    /// The scheduler. Lock only inside an interrupt-disabled section.
    pub static ref SCHEDULER: Mutex<Scheduler> = Mutex::new(Scheduler::new());
}

/// The brk window of the current process, for the page-fault handler.
pub fn current_brk_window() -> Option<(usize, usize)> {
    let sched = SCHEDULER.lock();
    sched.current().map(|p| (p.brk_start, p.brk))
}

/// Run `f` against the current process's address space.
pub fn with_current_space<R>(
    f: impl FnOnce(&mut AddressSpace) -> Result<R, KernelError>,
) -> Result<R, KernelError> {
    let mut sched = SCHEDULER.lock();
    let p = sched.current_mut().ok_or(KernelError::NotFound)?;
    let space = p.space.as_mut().ok_or(KernelError::NotFound)?;
    f(space)
}

/// Timer-interrupt hook: deliver pending signals, charge the tick, and
/// perform the context switch the policy asked for.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn on_timer_tick() {
    let decision = {
        let mut sched = SCHEDULER.lock();
        // A default action may take the current process off the CPU; that
        // switch wins over the tick accounting.
        match super::signal::deliver_pending(&mut sched) {
            Some(switch) => Some(switch),
            None => sched.timer_tick(),
        }
    };
    if let Some((from, to)) = decision {
        perform_switch(from, to);
    }
}

/// Cooperative yield from kernel code.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn yield_now() {
    let decision = crate::sync::without_interrupts(|| SCHEDULER.lock().yield_current());
    if let Some((from, to)) = decision {
        perform_switch(from, to);
    }
}

/// Honor a switch decision returned by the policy layer.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn apply_switch(decision: SwitchDecision) {
    if let Some((from, to)) = decision {
        perform_switch(from, to);
    }
}

/// Carry out a switch decision: TSS ring-0 stack, CR3, then the assembly
/// switch over the saved stack pointers.
#[cfg(all(target_arch = "x86", target_os = "none"))]
fn perform_switch(from: ProcessId, to: ProcessId) {
    use crate::arch::x86::{context::switch_context, tss};

    let (from_sp_ptr, to_sp, to_stack_top, to_dir) = {
        let mut sched = SCHEDULER.lock();
        let to_proc = sched.get(to).expect("incoming process vanished");
        let to_sp = to_proc.stack_ptr;
        let to_stack_top = to_proc.kernel_stack.top();
        let to_dir = to_proc.space.as_ref().map(|s| s.directory_address());
        let from_sp_ptr = match sched.get_mut(from) {
            Some(p) => &mut p.stack_ptr as *mut usize,
            None => core::ptr::null_mut(),
        };
        (from_sp_ptr, to_sp, to_stack_top, to_dir)
    };

    tss::set_kernel_stack(to_stack_top);
    if let Some(dir) = to_dir {
        // SAFETY: the directory belongs to the live incoming process.
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) dir.as_usize(), options(nostack));
        }
    }

    // SAFETY: both stack pointers reference live kernel stacks; the table
    // entries are heap-stable and cannot move while interrupts are off on
    // this single CPU. The switch saves outgoing state through from_sp_ptr
    // (null when the outgoing record is already gone) and resumes the
    // incoming stack.
    unsafe { switch_context(from_sp_ptr, to_sp) };
}
