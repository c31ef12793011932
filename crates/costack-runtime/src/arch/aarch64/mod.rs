//! aarch64 context switching implementation (AAPCS64)

use super::EntryFn;
use std::arch::naked_asm;

/// Callee-saved registers of a suspended execution point
///
/// x19-x29, the link register and the low halves of v8-v15.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Context {
    pub sp: u64,
    pub lr: u64,
    pub x: [u64; 11],
    pub d: [u64; 8],
}

impl Context {
    #[inline]
    pub fn stack_pointer(&self) -> usize {
        self.sp as usize
    }
}

/// Prime `ctx` so that switching to it calls `entry(arg)` on the stack
/// ending at `stack_top`.
///
/// # Safety
///
/// `ctx` must be valid for writes and `stack_top` must be the high end of a
/// writable stack region.
#[inline]
pub unsafe fn init_context(ctx: *mut Context, stack_top: usize, entry: EntryFn, arg: usize) {
    let ctx = &mut *ctx;
    *ctx = Context::default();
    ctx.sp = (stack_top & !0xF) as u64;
    ctx.lr = coroutine_trampoline as usize as u64;
    ctx.x[0] = entry as usize as u64; // x19
    ctx.x[1] = arg as u64; // x20
}

/// First code a primed context runs: `x19(x20)`
#[unsafe(naked)]
unsafe extern "C" fn coroutine_trampoline() {
    naked_asm!(
        "mov x0, x20",
        "blr x19",
        "bl {cleanup}",
        "brk #0",
        cleanup = sym super::entry_returned,
    );
}

/// Save the current execution point into `from` and continue at `to`
///
/// # Safety
///
/// Same contract as the x86_64 version.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_from: *mut Context, _to: *const Context) {
    naked_asm!(
        // Save into `from` (x0)
        "mov x9, sp",
        "str x9, [x0, #0x00]",
        "str x30, [x0, #0x08]",
        "stp x19, x20, [x0, #0x10]",
        "stp x21, x22, [x0, #0x20]",
        "stp x23, x24, [x0, #0x30]",
        "stp x25, x26, [x0, #0x40]",
        "stp x27, x28, [x0, #0x50]",
        "str x29, [x0, #0x60]",
        "stp d8, d9, [x0, #0x68]",
        "stp d10, d11, [x0, #0x78]",
        "stp d12, d13, [x0, #0x88]",
        "stp d14, d15, [x0, #0x98]",
        // Load from `to` (x1)
        "ldr x9, [x1, #0x00]",
        "mov sp, x9",
        "ldr x30, [x1, #0x08]",
        "ldp x19, x20, [x1, #0x10]",
        "ldp x21, x22, [x1, #0x20]",
        "ldp x23, x24, [x1, #0x30]",
        "ldp x25, x26, [x1, #0x40]",
        "ldp x27, x28, [x1, #0x50]",
        "ldr x29, [x1, #0x60]",
        "ldp d8, d9, [x1, #0x68]",
        "ldp d10, d11, [x1, #0x78]",
        "ldp d12, d13, [x1, #0x88]",
        "ldp d14, d15, [x1, #0x98]",
        "ret",
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_layout() {
        assert_eq!(std::mem::size_of::<Context>(), 0xa8);
    }
}
