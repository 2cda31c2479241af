//! # Context Switch Primitive
//!
//! The switch saves the callee-saved register set and the FPU/SSE state on
//! the **outgoing** task's kernel stack, publishes the resulting stack
//! pointer, then loads the incoming task's stack pointer and restores
//! symmetrically. Everything else (RIP, caller-saved registers) is covered by
//! the System V calling convention of the call site.
//!
//! Saved-frame layout, ascending from the published stack pointer:
//!
//! ```text
//! +0    FXSAVE area (512 bytes used, padded to 520)
//! +520  r15
//! +528  r14   ← first-run hook for freshly built frames
//! +536  r13   ← exit function for freshly built frames
//! +544  r12   ← entry argument for freshly built frames
//! +552  rbx   ← entry function for freshly built frames
//! +560  rbp
//! +568  return address
//! ```
//!
//! The published stack pointer is always 16-byte aligned, which FXSAVE and
//! FXRSTOR require.

/// Size of one saved context frame on the stack.
pub const CONTEXT_FRAME_SIZE: usize = 576;

const FXAREA_SIZE: usize = 520;

#[cfg(target_arch = "x86_64")]
mod imp {
    use super::{CONTEXT_FRAME_SIZE, FXAREA_SIZE};

    /// Switch kernel stacks.
    ///
    /// Stores the outgoing stack pointer through `old_sp` and resumes on
    /// `new_sp`, which must either have been published by a previous switch
    /// or built by [`init_stack_frame`](super::init_stack_frame). Returns on
    /// the **new** stack; implies a full barrier on both sides.
    ///
    /// # Safety
    /// - `old_sp` must be a valid destination for the outgoing pointer.
    /// - `new_sp` must point at a well-formed saved frame on a live stack.
    /// - Must be called with interrupts disabled; the scheduler lock must be
    ///   released before the epilogue runs on the new stack.
    #[unsafe(naked)]
    pub unsafe extern "C" fn switch_stacks(old_sp: *mut u64, new_sp: u64) {
        core::arch::naked_asm!(
            // Callee-saved set of the outgoing task.
            "push rbp",
            "push rbx",
            "push r12",
            "push r13",
            "push r14",
            "push r15",
            // FPU/SSE state. RSP is 16-aligned here (entry RSP ≡ 8 mod 16,
            // minus 48 for the pushes, minus 520).
            "sub rsp, 520",
            "fxsave [rsp]",
            // Publish the outgoing stack pointer, adopt the incoming one.
            "mov [rdi], rsp",
            "mov rsp, rsi",
            // Restore mirror-image.
            "fxrstor [rsp]",
            "add rsp, 520",
            "pop r15",
            "pop r14",
            "pop r13",
            "pop r12",
            "pop rbx",
            "pop rbp",
            "ret",
        );
    }

    /// First code a fresh task runs, entered via the `ret` of
    /// [`switch_stacks`]. The frame builder parked the entry function in RBX,
    /// its argument in R12, the exit function in R13 and the first-run hook
    /// in R14.
    ///
    /// A fresh frame is switched onto while the dispatching context still
    /// holds the scheduler lock with interrupts disabled, and there is no
    /// unwind path here to undo either: the hook releases the lock, then
    /// interrupt delivery is re-enabled before the body runs.
    #[unsafe(naked)]
    extern "C" fn task_trampoline() {
        core::arch::naked_asm!(
            "call r14",
            "sti",
            "mov rdi, r12",
            "call rbx",
            // The task body returned; retire the task. Never returns.
            "call r13",
            "ud2",
        );
    }

    /// Build the initial saved frame for a new task on `stack_top`
    /// (exclusive upper end of the stack) and return the stack pointer to
    /// hand to [`switch_stacks`].
    ///
    /// The first switch onto the returned pointer restores a neutral FPU
    /// state (FCW `0x037F`, MXCSR `0x1F80`) and lands in a trampoline that
    /// runs `first_run` (the scheduler's lock-handoff release), then
    /// `entry(arg)`, then `exit` if the body ever returns.
    ///
    /// # Safety
    /// `stack_top` must be the exclusive top of at least
    /// [`CONTEXT_FRAME_SIZE`] writable bytes.
    pub unsafe fn init_stack_frame(
        stack_top: *mut u8,
        entry: extern "C" fn(usize),
        arg: usize,
        first_run: extern "C" fn(),
        exit: extern "C" fn() -> !,
    ) -> u64 {
        let top = (stack_top as usize) & !15;
        let sp = top - CONTEXT_FRAME_SIZE;

        unsafe {
            core::ptr::write_bytes(sp as *mut u8, 0, CONTEXT_FRAME_SIZE);
            // Neutral x87/SSE state: default control word and MXCSR.
            core::ptr::write(sp as *mut u16, 0x037F);
            core::ptr::write((sp + 24) as *mut u32, 0x1F80);

            let slots = (sp + FXAREA_SIZE) as *mut u64;
            // r15 stays zero.
            core::ptr::write(slots.add(1), first_run as usize as u64); // r14
            core::ptr::write(slots.add(2), exit as usize as u64); // r13
            core::ptr::write(slots.add(3), arg as u64); // r12
            core::ptr::write(slots.add(4), entry as usize as u64); // rbx
            // rbp stays zero.
            let trampoline: extern "C" fn() = task_trampoline;
            core::ptr::write(slots.add(6), trampoline as usize as u64);
        }

        sp as u64
    }
}

#[cfg(not(target_arch = "x86_64"))]
mod imp {
    /// # Safety
    /// Unsupported on this architecture.
    pub unsafe extern "C" fn switch_stacks(_old_sp: *mut u64, _new_sp: u64) {
        unimplemented!("context switch is x86-64 only");
    }

    /// # Safety
    /// Unsupported on this architecture.
    pub unsafe fn init_stack_frame(
        _stack_top: *mut u8,
        _entry: extern "C" fn(usize),
        _arg: usize,
        _first_run: extern "C" fn(),
        _exit: extern "C" fn() -> !,
    ) -> u64 {
        unimplemented!("context switch is x86-64 only");
    }
}

pub use imp::{init_stack_frame, switch_stacks};
