//! Thread-local storage for the running coroutine

use crate::coroutine::Coroutine;
use costack_core::id::CoroutineId;
use costack_core::kprint;
use std::cell::Cell;

thread_local! {
    /// Coroutine currently executing on this thread's shared stack
    static CURRENT: Cell<*const Coroutine> = const { Cell::new(std::ptr::null()) };
}

/// Mark `co` as running on this thread
#[inline]
pub(crate) fn set_current(co: *const Coroutine, id: CoroutineId) {
    CURRENT.with(|cell| cell.set(co));
    kprint::set_coroutine_tag(id.as_u64());
}

/// Back on the thread's own stack
#[inline]
pub(crate) fn clear_current() {
    CURRENT.with(|cell| cell.set(std::ptr::null()));
    kprint::set_coroutine_tag(0);
}

/// Raw pointer to the running coroutine, null outside one
///
/// The pointee is kept alive by the `resume()` frame that switched into it.
#[inline]
pub(crate) fn current_ptr() -> *const Coroutine {
    CURRENT.with(|cell| cell.get())
}

/// Check if we're running inside a coroutine
#[inline]
pub fn in_coroutine() -> bool {
    !current_ptr().is_null()
}

/// Id of the running coroutine, `CoroutineId::NONE` outside one
#[inline]
pub fn current_id() -> CoroutineId {
    let ptr = current_ptr();
    if ptr.is_null() {
        CoroutineId::NONE
    } else {
        unsafe { (*ptr).id() }
    }
}
