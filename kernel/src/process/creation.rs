//! Synthetic initial kernel stacks.
//!
//! The switch routine restores EFLAGS and the eight general-purpose
//! registers from the incoming kernel stack and then returns into whatever
//! return address that stack holds. A new task therefore starts life as a
//! hand-built stack image:
//!
//! - kernel task: `[EFLAGS][8 x GPR][entry]`; the switch `ret` lands
//!   directly in the task body;
//! - user task: the same, but the return target is a trampoline that
//!   executes `iretd` over a synthetic `[eip cs eflags esp ss]` block to
//!   drop into ring 3;
//! - fork child: the trampoline replays a copy of the parent's trap frame
//!   whose saved EAX was rewritten to 0.

use crate::arch::context::{TrapFrame, EFLAGS_IF, USER_CS, USER_DS};

const WORD: usize = core::mem::size_of::<usize>();

/// Words in the callee frame consumed by the switch routine:
/// EFLAGS + eight GPRs + return address.
pub const SWITCH_FRAME_WORDS: usize = 10;

#[inline]
unsafe fn push(top: &mut usize, value: usize) {
    *top -= WORD;
    // SAFETY: caller guarantees the stack region below the original top is
    // writable; every push stays inside it.
    unsafe { core::ptr::write(*top as *mut usize, value) };
}

/// Build the initial stack of a kernel task.
///
/// Returns the stack pointer to store in the process record.
///
/// # Safety
///
/// `stack_top` must be the exclusive top of a writable region of at least
/// [`SWITCH_FRAME_WORDS`] words.
pub unsafe fn build_kernel_task_stack(stack_top: usize, entry: usize) -> usize {
    let mut sp = stack_top;
    // SAFETY: per contract the region below stack_top is writable.
    unsafe {
        push(&mut sp, entry); // switch ret target
        for _ in 0..8 {
            push(&mut sp, 0); // eax, ecx, edx, ebx, esp, ebp, esi, edi
        }
        push(&mut sp, EFLAGS_IF);
    }
    sp
}

/// Build the initial stack of a user task.
///
/// `trampoline` is the ring-3 entry stub that pops the iret block.
///
/// # Safety
///
/// `stack_top` must be the exclusive top of a writable region of at least
/// [`SWITCH_FRAME_WORDS`] + 5 words.
pub unsafe fn build_user_task_stack(
    stack_top: usize,
    trampoline: usize,
    user_entry: usize,
    user_stack: usize,
) -> usize {
    let mut sp = stack_top;
    // SAFETY: per contract the region below stack_top is writable.
    unsafe {
        // iretd block, popped by the trampoline (ascending: eip first)
        push(&mut sp, USER_DS); // ss
        push(&mut sp, user_stack); // esp
        push(&mut sp, EFLAGS_IF); // eflags, interrupts on in ring 3
        push(&mut sp, USER_CS); // cs
        push(&mut sp, user_entry); // eip

        push(&mut sp, trampoline); // switch ret target
        for _ in 0..8 {
            push(&mut sp, 0);
        }
        push(&mut sp, EFLAGS_IF);
    }
    sp
}

/// Build the stack of a forked child: the parent's trap frame, EAX forced
/// to 0, under a switch frame whose return target replays it.
///
/// # Safety
///
/// `stack_top` must be the exclusive top of a writable region of at least
/// [`SWITCH_FRAME_WORDS`] + [`TrapFrame::WORDS`] words.
pub unsafe fn build_fork_stack(stack_top: usize, trampoline: usize, trap: &TrapFrame) -> usize {
    let mut child = *trap;
    child.eax = 0; // fork returns 0 in the child

    let mut sp = stack_top - core::mem::size_of::<TrapFrame>();
    // SAFETY: per contract the region below stack_top is writable and
    // large enough for the frame copy.
    unsafe {
        core::ptr::write(sp as *mut TrapFrame, child);
    }
    // SAFETY: as above.
    unsafe {
        push(&mut sp, trampoline);
        for _ in 0..8 {
            push(&mut sp, 0);
        }
        push(&mut sp, EFLAGS_IF);
    }
    sp
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn stack_buffer(words: usize) -> (vec::Vec<usize>, usize) {
        let buf = vec![0usize; words];
        let top = buf.as_ptr() as usize + words * WORD;
        (buf, top)
    }

    #[test]
    fn kernel_task_frame_layout() {
        let (buf, top) = stack_buffer(16);
        // SAFETY: buf backs the region below top.
        let sp = unsafe { build_kernel_task_stack(top, 0x1234_5678) };
        assert_eq!(top - sp, SWITCH_FRAME_WORDS * WORD);

        let words = &buf[16 - SWITCH_FRAME_WORDS..];
        assert_eq!(words[0], EFLAGS_IF, "eflags at the stack pointer");
        assert!(words[1..9].iter().all(|&w| w == 0), "gprs start zeroed");
        assert_eq!(words[9], 0x1234_5678, "entry is the ret target");
    }

    #[test]
    fn user_task_frame_ends_in_iret_block() {
        let (buf, top) = stack_buffer(32);
        // SAFETY: buf backs the region below top.
        let sp = unsafe { build_user_task_stack(top, 0xAAAA_0000, 0x0040_0000, 0x00C0_0000) };
        assert_eq!(top - sp, (SWITCH_FRAME_WORDS + 5) * WORD);

        let words = &buf[32 - (SWITCH_FRAME_WORDS + 5)..];
        assert_eq!(words[0], EFLAGS_IF);
        assert!(words[1..9].iter().all(|&w| w == 0));
        assert_eq!(words[9], 0xAAAA_0000, "trampoline is the ret target");
        // iretd pops ascending: eip, cs, eflags, esp, ss
        assert_eq!(words[10], 0x0040_0000, "user eip");
        assert_eq!(words[11], USER_CS);
        assert_eq!(words[12], EFLAGS_IF, "interrupts enabled in ring 3");
        assert_eq!(words[13], 0x00C0_0000, "user esp");
        assert_eq!(words[14], USER_DS);
    }

    #[test]
    fn fork_stack_replays_trap_frame_with_zero_eax() {
        let (buf, top) = stack_buffer(64);
        let trap = TrapFrame {
            edi: 7,
            esi: 6,
            ebp: 5,
            esp_dummy: 0,
            ebx: 4,
            edx: 3,
            ecx: 2,
            eax: 0xFFFF,
            eip: 0x0040_0010,
            cs: USER_CS,
            eflags: EFLAGS_IF,
            user_esp: 0x00BF_FFF0,
            user_ss: USER_DS,
        };
        // SAFETY: buf backs the region below top.
        let sp = unsafe { build_fork_stack(top, 0xBBBB_0000, &trap) };
        assert_eq!(top - sp, (SWITCH_FRAME_WORDS + TrapFrame::WORDS) * WORD);

        let base = 64 - SWITCH_FRAME_WORDS - TrapFrame::WORDS;
        let words = &buf[base..];
        assert_eq!(words[0], EFLAGS_IF);
        assert_eq!(words[9], 0xBBBB_0000, "fork trampoline");
        // The replayed frame starts right above the switch frame.
        let replay = &words[SWITCH_FRAME_WORDS..];
        assert_eq!(replay[0], 7, "edi preserved");
        assert_eq!(replay[7], 0, "eax forced to zero for the child");
        assert_eq!(replay[8], 0x0040_0010, "eip preserved");
        assert_eq!(replay[12], USER_DS, "user ss preserved");
    }
}
