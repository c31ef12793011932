//! Architecture-specific context switching
//!
//! Each backend provides the same surface:
//!
//! - `Context` - callee-saved register block, `#[repr(C)]`
//! - `init_context` - prime a `Context` so the first switch enters a function
//! - `switch_context` - save into one `Context`, load from another
//!
//! A switch only preserves callee-saved state; the caller of
//! `switch_context` treats it like any other `extern "C"` call.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
        pub use self::x86_64::{Context, init_context, switch_context};
    } else if #[cfg(target_arch = "aarch64")] {
        pub mod aarch64;
        pub use self::aarch64::{Context, init_context, switch_context};
    } else {
        compile_error!("costack supports x86_64 and aarch64 only");
    }
}

/// Entry signature for a freshly primed context
pub type EntryFn = extern "C" fn(usize);

/// Reached only if an entry function returns instead of switching away
extern "C" fn entry_returned() {
    costack_core::kerror!("coroutine entry returned without switching back");
    std::process::abort();
}
