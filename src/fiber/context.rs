//! The context save/restore primitive.
//!
//! A thin wrapper over the POSIX `getcontext`/`makecontext`/`swapcontext`
//! family: [`Context::make`] initializes a context so its first activation
//! enters `entry` on the given stack, and [`Context::swap`] atomically saves
//! the caller's registers and jumps to another context.
//!
//! The `ucontext_t` is boxed and must never move: on some libc builds the
//! saved machine state contains a pointer into the structure itself.

use std::mem::MaybeUninit;
use std::ptr;

use super::stack::Stack;

pub(crate) struct Context {
    ctx: Box<libc::ucontext_t>,
}

impl Context {
    /// A zeroed context, usable only as the save target of a swap.
    pub fn empty() -> Self {
        Self {
            ctx: Box::new(unsafe { MaybeUninit::zeroed().assume_init() }),
        }
    }

    /// Initialize this context so that its first activation enters `entry`
    /// running on `stack`. `entry` must never return: the context has no
    /// successor link, so falling off its end would exit the thread.
    pub fn make(&mut self, stack: &Stack, entry: extern "C" fn()) {
        unsafe {
            if libc::getcontext(&mut *self.ctx) != 0 {
                panic!(
                    "getcontext failed: {}",
                    std::io::Error::last_os_error()
                );
            }
            self.ctx.uc_link = ptr::null_mut();
            self.ctx.uc_stack.ss_sp = stack.bottom() as *mut libc::c_void;
            self.ctx.uc_stack.ss_size = stack.len();
            libc::makecontext(&mut *self.ctx, entry, 0);
        }
    }

    /// Save the caller into `from` and activate `to`.
    ///
    /// # Safety
    ///
    /// `to` must hold machine state prepared by [`Context::make`] or a prior
    /// save, on a stack no other thread is executing on, and both pointers
    /// must stay valid until control returns to `from`.
    pub unsafe fn swap(from: *mut Context, to: *mut Context) {
        let rc = libc::swapcontext(&mut *(*from).ctx, &mut *(*to).ctx);
        // swapcontext only fails on a malformed target context.
        assert_eq!(rc, 0, "swapcontext failed");
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Context").finish_non_exhaustive()
    }
}
