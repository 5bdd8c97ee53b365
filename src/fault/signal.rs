//! The OS adapter: delivers `SIGSEGV` and `SIGILL` to a process-wide
//! [`FaultManager`], and applies the [`Redirect`] of a claimed trap.
//!
//! Traps that no handler claims are passed to whatever handled the signal
//! before [`install()`].
//!
//! [`Redirect`]: super::Redirect

use std::{io, mem, ptr};
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use libc::{c_int, c_void};

use crate::error::{InstallError};
use crate::target::{Native, Target};
use super::{FaultManager, StackWrite, Trap, TrapMemory, Verdict};

/** The saved-register context of the host. */
pub type NativeContext = <Native as Target>::Context;

/** The signals that generated code raises on purpose. */
pub const SIGNALS: [c_int; 2] = [libc::SIGSEGV, libc::SIGILL];

struct Installed {
    manager: FaultManager<NativeContext>,
    /// The actions replaced by [`install()`], in the order of [`SIGNALS`].
    previous: [libc::sigaction; 2],
}

/**
 * Null until [`install()`] publishes a manager. Cleared again only if
 * [`install()`] fails, in which case the [`Installed`] is leaked, because a
 * signal may still be reading it.
 */
static INSTALLED: AtomicPtr<Installed> = AtomicPtr::new(ptr::null_mut());

fn installed() -> Option<&'static Installed> {
    unsafe { INSTALLED.load(Ordering::Acquire).as_ref() }
}

static RELEASED: AtomicBool = AtomicBool::new(false);

//-----------------------------------------------------------------------------

/**
 * Reads the memory of the current process without faulting, by asking the
 * kernel to copy it.
 */
#[derive(Debug, Default, Copy, Clone)]
pub struct ProcessMemory;

impl TrapMemory for ProcessMemory {
    fn read(&self, address: usize, buffer: &mut [u8]) -> bool {
        let local = libc::iovec {iov_base: buffer.as_mut_ptr() as *mut c_void, iov_len: buffer.len()};
        let remote = libc::iovec {iov_base: address as *mut c_void, iov_len: buffer.len()};
        let copied = unsafe { libc::process_vm_readv(libc::getpid(), &local, 1, &remote, 1, 0) };
        copied == buffer.len() as isize
    }
}

/**
 * Performs `write` on the current thread's stack.
 *
 * # Safety
 *
 * `write.address` must be writable.
 */
unsafe fn apply(write: &StackWrite) {
    match write.size {
        4 => ptr::write_unaligned(write.address as *mut u32, write.value as u32),
        8 => ptr::write_unaligned(write.address as *mut u64, write.value as u64),
        _ => panic!("Bad stack write size {}", write.size),
    }
}

//-----------------------------------------------------------------------------

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        /** The `gregs` index of each [`Register`](crate::target::x86_64::Register). */
        const GREGS: [c_int; 16] = [
            libc::REG_RAX, libc::REG_RCX, libc::REG_RDX, libc::REG_RBX,
            libc::REG_RSP, libc::REG_RBP, libc::REG_RSI, libc::REG_RDI,
            libc::REG_R8, libc::REG_R9, libc::REG_R10, libc::REG_R11,
            libc::REG_R12, libc::REG_R13, libc::REG_R14, libc::REG_R15,
        ];

        fn read_context(uc: &libc::ucontext_t) -> NativeContext {
            let gregs = &uc.uc_mcontext.gregs;
            let mut context = NativeContext::new(gregs[libc::REG_RIP as usize] as u64, 0);
            for (i, &r) in GREGS.iter().enumerate() {
                context.gregs[i] = gregs[r as usize] as u64;
            }
            context
        }

        fn write_context(uc: &mut libc::ucontext_t, context: &NativeContext) {
            let gregs = &mut uc.uc_mcontext.gregs;
            for (i, &r) in GREGS.iter().enumerate() {
                gregs[r as usize] = context.gregs[i] as i64;
            }
            gregs[libc::REG_RIP as usize] = context.rip as i64;
        }
    } else if #[cfg(target_arch = "x86")] {
        /** The `gregs` index of each [`Register`](crate::target::x86::Register). */
        const GREGS: [usize; 8] = [11, 10, 9, 8, 7, 6, 5, 4];

        const REG_EIP: usize = 14;

        fn read_context(uc: &libc::ucontext_t) -> NativeContext {
            let gregs = &uc.uc_mcontext.gregs;
            let mut context = NativeContext::new(gregs[REG_EIP] as u32, 0);
            for (i, &r) in GREGS.iter().enumerate() {
                context.gregs[i] = gregs[r] as u32;
            }
            context
        }

        fn write_context(uc: &mut libc::ucontext_t, context: &NativeContext) {
            let gregs = &mut uc.uc_mcontext.gregs;
            for (i, &r) in GREGS.iter().enumerate() {
                gregs[r] = context.gregs[i] as i32;
            }
            gregs[REG_EIP] = context.eip as i32;
        }
    } else if #[cfg(target_arch = "aarch64")] {
        fn read_context(uc: &libc::ucontext_t) -> NativeContext {
            let mcontext = &uc.uc_mcontext;
            let mut context = NativeContext::new(mcontext.pc, mcontext.sp);
            context.x.copy_from_slice(&mcontext.regs);
            context
        }

        fn write_context(uc: &mut libc::ucontext_t, context: &NativeContext) {
            let mcontext = &mut uc.uc_mcontext;
            mcontext.regs.copy_from_slice(&context.x);
            mcontext.sp = context.sp;
            mcontext.pc = context.pc;
        }
    }
}

//-----------------------------------------------------------------------------

impl Installed {
    fn previous(&self, signal: c_int) -> Option<&libc::sigaction> {
        SIGNALS.iter().position(|&s| s == signal).map(|i| &self.previous[i])
    }

    /** Passes a trap that we did not claim to the previous handler. */
    unsafe fn chain(&self, signal: c_int, info: *mut libc::siginfo_t, ucontext: *mut c_void) {
        let Some(previous) = self.previous(signal) else { return };
        let handler = previous.sa_sigaction;
        if handler == libc::SIG_DFL || handler == libc::SIG_IGN {
            // The faulting instruction runs again, and takes the old action.
            libc::sigaction(signal, previous, ptr::null_mut());
        } else if previous.sa_flags & libc::SA_SIGINFO != 0 {
            let handler: extern "C" fn(c_int, *mut libc::siginfo_t, *mut c_void) = mem::transmute(handler);
            handler(signal, info, ucontext);
        } else {
            let handler: extern "C" fn(c_int) = mem::transmute(handler);
            handler(signal);
        }
    }
}

extern "C" fn handle_signal(signal: c_int, info: *mut libc::siginfo_t, ucontext: *mut c_void) {
    let Some(installed) = installed() else { return };
    unsafe {
        if !RELEASED.load(Ordering::Acquire) {
            let uc = &mut *(ucontext as *mut libc::ucontext_t);
            let trap = Trap {
                signal,
                code: (*info).si_code,
                fault_address: (*info).si_addr() as usize,
                context: read_context(uc),
            };
            if let Verdict::Claimed(redirect) = installed.manager.handle(&trap, &ProcessMemory) {
                for write in redirect.stack_writes.iter() {
                    apply(write);
                }
                write_context(uc, &redirect.context);
                if redirect.remove_suspend_trigger {
                    installed.manager.managed().remove_suspend_trigger();
                }
                return;
            }
        }
        installed.chain(signal, info, ucontext);
    }
}

fn check(signal: c_int, result: c_int) -> Result<(), InstallError> {
    if result == 0 {
        Ok(())
    } else {
        Err(InstallError::Sigaction {signal, source: io::Error::last_os_error()})
    }
}

/** The action that sends a signal to [`handle_signal()`]. */
fn action() -> libc::sigaction {
    let mut action: libc::sigaction = unsafe { mem::zeroed() };
    action.sa_sigaction = handle_signal as *const () as usize;
    action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK | libc::SA_NODEFER;
    unsafe { libc::sigemptyset(&mut action.sa_mask) };
    action
}

/**
 * Sets `action` for each of `signals`. If one fails, the signals already set
 * get back their `previous` action, which is in the same order as `signals`.
 */
fn hook(signals: &[c_int], action: &libc::sigaction, previous: &[libc::sigaction]) -> Result<(), InstallError> {
    assert_eq!(signals.len(), previous.len());
    for (i, &signal) in signals.iter().enumerate() {
        if let Err(e) = check(signal, unsafe { libc::sigaction(signal, action, ptr::null_mut()) }) {
            for (&signal, previous) in signals[..i].iter().zip(previous) {
                unsafe { libc::sigaction(signal, previous, ptr::null_mut()) };
            }
            return Err(e);
        }
    }
    Ok(())
}

/**
 * Makes `manager` handle the [`SIGNALS`] of this process, and returns it.
 * Fails if a manager has been installed before, even if it was released.
 * If a `sigaction()` fails, nothing is installed and `install()` may be
 * called again.
 */
pub fn install(manager: FaultManager<NativeContext>) -> Result<&'static FaultManager<NativeContext>, InstallError> {
    let mut previous: [libc::sigaction; 2] = unsafe { mem::zeroed() };
    for (&signal, previous) in SIGNALS.iter().zip(&mut previous) {
        check(signal, unsafe { libc::sigaction(signal, ptr::null(), previous) })?;
    }
    let new = Box::into_raw(Box::new(Installed {manager, previous}));
    if INSTALLED.compare_exchange(ptr::null_mut(), new, Ordering::AcqRel, Ordering::Acquire).is_err() {
        drop(unsafe { Box::from_raw(new) });
        return Err(InstallError::AlreadyInstalled);
    }
    let installed: &'static Installed = unsafe { &*new };
    if let Err(e) = hook(&SIGNALS, &action(), &installed.previous) {
        INSTALLED.store(ptr::null_mut(), Ordering::Release);
        tracing::warn!(target: "crossing::signals", error = %e, "Could not install fault manager");
        return Err(e);
    }
    tracing::info!(target: "crossing::signals", target_arch = Native::NAME, "Installed fault manager");
    Ok(&installed.manager)
}

/** The installed manager, if any. */
pub fn manager() -> Option<&'static FaultManager<NativeContext>> {
    installed().map(|installed| &installed.manager)
}

/**
 * Restores the signal actions replaced by [`install()`]. Afterwards, traps
 * go straight to the previous handlers.
 */
pub fn release() {
    let Some(installed) = installed() else { return };
    if RELEASED.swap(true, Ordering::AcqRel) { return; }
    for (&signal, previous) in SIGNALS.iter().zip(&installed.previous) {
        unsafe { libc::sigaction(signal, previous, ptr::null_mut()) };
    }
    tracing::info!(target: "crossing::signals", "Released fault manager");
}

//-----------------------------------------------------------------------------
