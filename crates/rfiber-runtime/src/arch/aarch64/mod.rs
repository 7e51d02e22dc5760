//! aarch64 context switching (AAPCS64)

use std::arch::naked_asm;

/// Callee-saved register set of a suspended context
///
/// x19..x28, fp (x29), lr (x30), sp, then the low halves of v8..v15.
/// Offsets are hard-coded in `switch_context`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SavedContext {
    pub x: [u64; 12], // 0x00: x19..x30
    pub sp: u64,      // 0x60
    pub d: [u64; 8],  // 0x68: d8..d15
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
    let sp = (stack_top as usize) & !0xF;

    *ctx = SavedContext::default();
    ctx.x[0] = entry as usize as u64; // x19
    ctx.x[1] = arg as u64; // x20
    ctx.x[11] = fiber_entry_trampoline as usize as u64; // lr
    ctx.sp = sp as u64;
}

#[unsafe(naked)]
unsafe extern "C" fn fiber_entry_trampoline() {
    naked_asm!(
        "mov x29, xzr",
        "mov x0, x20",
        "blr x19",
        // Fiber entries never return
        "brk #1",
    );
}

/// Save the current context into `from` and resume `to`
///
/// # Safety
///
/// Same contract as the x86_64 version.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_from: *mut SavedContext, _to: *const SavedContext) {
    naked_asm!(
        // Save into `from` (x0)
        "stp x19, x20, [x0, #0x00]",
        "stp x21, x22, [x0, #0x10]",
        "stp x23, x24, [x0, #0x20]",
        "stp x25, x26, [x0, #0x30]",
        "stp x27, x28, [x0, #0x40]",
        "stp x29, x30, [x0, #0x50]",
        "mov x9, sp",
        "str x9, [x0, #0x60]",
        "stp d8, d9, [x0, #0x68]",
        "stp d10, d11, [x0, #0x78]",
        "stp d12, d13, [x0, #0x88]",
        "stp d14, d15, [x0, #0x98]",
        // Load from `to` (x1)
        "ldp x19, x20, [x1, #0x00]",
        "ldp x21, x22, [x1, #0x10]",
        "ldp x23, x24, [x1, #0x20]",
        "ldp x25, x26, [x1, #0x30]",
        "ldp x27, x28, [x1, #0x40]",
        "ldp x29, x30, [x1, #0x50]",
        "ldr x9, [x1, #0x60]",
        "mov sp, x9",
        "ldp d8, d9, [x1, #0x68]",
        "ldp d10, d11, [x1, #0x78]",
        "ldp d12, d13, [x1, #0x88]",
        "ldp d14, d15, [x1, #0x98]",
        // lr is either the caller of an earlier switch or the trampoline
        "ret",
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{offset_of, size_of};

    #[test]
    fn test_layout_matches_asm() {
        assert_eq!(offset_of!(SavedContext, sp), 0x60);
        assert_eq!(offset_of!(SavedContext, d), 0x68);
        assert_eq!(size_of::<SavedContext>(), 0xA8);
    }
}
