//! x86_64 context switching (System V AMD64)
//!
//! Only callee-saved state is kept: the switch is an ordinary function
//! call from the compiler's point of view, so everything else is already
//! spilled by the caller.

use std::arch::naked_asm;

/// Default MXCSR: all exceptions masked, round to nearest
const MXCSR_DEFAULT: u32 = 0x1F80;
/// Default x87 control word: extended precision, all exceptions masked
const FPUCW_DEFAULT: u16 = 0x037F;

/// Callee-saved register set of a suspended context
///
/// Field offsets are hard-coded in `switch_context`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SavedContext {
    pub rsp: u64,   // 0x00
    pub rip: u64,   // 0x08
    pub rbx: u64,   // 0x10
    pub rbp: u64,   // 0x18
    pub r12: u64,   // 0x20
    pub r13: u64,   // 0x28
    pub r14: u64,   // 0x30
    pub r15: u64,   // 0x38
    pub mxcsr: u32, // 0x40
    pub fpucw: u16, // 0x44
    _pad: u16,
}

/// Prepare `ctx` so that switching to it calls `entry(arg)` on a fresh stack
///
/// `entry` must never return.
///
/// # Safety
///
/// `stack_top` must be the high end of a writable stack region.
#[inline]
pub unsafe fn init_context(
    ctx: &mut SavedContext,
    stack_top: *mut u8,
    entry: unsafe extern "C" fn(usize),
    arg: usize,
) {
    // The trampoline is entered by `jmp` and then `call`s entry, which pushes
    // 8 bytes. Entry therefore sees rsp+8 aligned to 16, as the ABI wants.
    let sp = (stack_top as usize) & !0xF;

    *ctx = SavedContext {
        rsp: sp as u64,
        rip: fiber_entry_trampoline as usize as u64,
        r12: entry as usize as u64,
        r13: arg as u64,
        mxcsr: MXCSR_DEFAULT,
        fpucw: FPUCW_DEFAULT,
        ..SavedContext::default()
    };
}

#[unsafe(naked)]
unsafe extern "C" fn fiber_entry_trampoline() {
    naked_asm!(
        "xor ebp, ebp",
        "mov rdi, r13",
        "call r12",
        // Fiber entries never return
        "ud2",
    );
}

/// Save the current context into `from` and resume `to`
///
/// Returns when some other context switches back into `from`.
///
/// # Safety
///
/// `to` must hold a context produced by `init_context` or by an earlier
/// `switch_context`, whose stack is still alive and not running.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_from: *mut SavedContext, _to: *const SavedContext) {
    naked_asm!(
        // Save into `from` (rdi)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        "stmxcsr [rdi + 0x40]",
        "fnstcw [rdi + 0x44]",
        // Load from `to` (rsi)
        "ldmxcsr [rsi + 0x40]",
        "fldcw [rsi + 0x44]",
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        "jmp rax",
        // Resumed here; return to whoever called switch_context
        "1:",
        "ret",
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::offset_of;

    #[test]
    fn test_layout_matches_asm() {
        assert_eq!(offset_of!(SavedContext, rsp), 0x00);
        assert_eq!(offset_of!(SavedContext, rip), 0x08);
        assert_eq!(offset_of!(SavedContext, r15), 0x38);
        assert_eq!(offset_of!(SavedContext, mxcsr), 0x40);
        assert_eq!(offset_of!(SavedContext, fpucw), 0x44);
    }

    #[test]
    fn test_init_context_aligns_stack() {
        let mut stack = vec![0u8; 4096];
        let mut ctx = SavedContext::default();
        unsafe extern "C" fn never(_: usize) {}
        unsafe {
            let top = stack.as_mut_ptr().add(4096 - 3);
            init_context(&mut ctx, top, never, 7);
        }
        assert_eq!(ctx.rsp % 16, 0);
        assert_eq!(ctx.r13, 7);
        assert_eq!(ctx.mxcsr, MXCSR_DEFAULT);
    }
}
