//! x86_64 context switching implementation
//!
//! Naked functions, stable since Rust 1.88.

use super::EntryFn;
use std::arch::naked_asm;

/// Callee-saved registers of a suspended execution point (System V AMD64)
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Context {
    pub rsp: u64,
    pub rip: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

impl Context {
    /// Stack pointer at the moment the context was saved
    #[inline]
    pub fn stack_pointer(&self) -> usize {
        self.rsp as usize
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
    // The trampoline's `call` pushes 8 bytes, so starting from a 16-byte
    // aligned rsp the entry function sees rsp % 16 == 8 like any callee.
    let ctx = &mut *ctx;
    ctx.rsp = (stack_top & !0xF) as u64;
    ctx.rip = coroutine_trampoline as usize as u64;
    ctx.rbx = 0;
    ctx.rbp = 0;
    ctx.r12 = entry as usize as u64;
    ctx.r13 = arg as u64;
    ctx.r14 = 0;
    ctx.r15 = 0;
}

/// First code a primed context runs: `r12(r13)`
#[unsafe(naked)]
unsafe extern "C" fn coroutine_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        "call {cleanup}",
        "ud2",
        cleanup = sym super::entry_returned,
    );
}

/// Save the current execution point into `from` and continue at `to`
///
/// Returns when something later switches back to `from`.
///
/// # Safety
///
/// `to` must hold a context saved by this function or primed by
/// `init_context`, and its stack must still hold the bytes it had then.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_from: *mut Context, _to: *const Context) {
    naked_asm!(
        // Save into `from` (RDI)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Load from `to` (RSI)
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        "jmp rax",
        // Resume point of a saved context
        "1:",
        "ret",
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn noop(_: usize) {}

    #[test]
    fn test_context_layout() {
        assert_eq!(std::mem::size_of::<Context>(), 0x40);
    }

    #[test]
    fn test_init_context_aligns_stack() {
        let mut ctx = Context::default();
        unsafe { init_context(&mut ctx, 0x1000_0007, noop, 99) };
        assert_eq!(ctx.rsp % 16, 0);
        assert_eq!(ctx.stack_pointer(), 0x1000_0000);
        assert_eq!(ctx.r13, 99);
        assert_eq!(ctx.rip, coroutine_trampoline as usize as u64);
    }
}
