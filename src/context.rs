//! Saved CPU register state and the context-switch routine.
//!
//! Everything above this module is architecture-neutral. The only pieces that
//! know about registers and calling conventions are [`ExecutionContext`], the
//! naked [`switch_execution_context`] routine, and the entry trampoline that
//! bootstraps a fresh fiber stack. One implementation exists per supported
//! target; unsupported targets fail at compile time.
//!
//! A context is only valid while its owning fiber's stack is alive and
//! untouched since the switch-out.

use core::arch::naked_asm;

#[cfg(any(feature = "asan", feature = "tsan"))]
use std::ffi::c_void;

/// Entry signature the trampoline hands control to. Never returns; the fiber
/// switches back to its worker instead.
pub(crate) type RawFiberEntry = extern "C" fn(*mut ()) -> !;

// ---------------------------------------------------------------------------
// x86_64 System V
// ---------------------------------------------------------------------------

/// Callee-saved register set for x86_64 System V.
///
/// `rsp` is stored pointing at the return address of the call that entered
/// [`switch_execution_context`], so `ret` after a restore resumes the saved
/// call site exactly.
#[cfg(all(target_arch = "x86_64", unix))]
#[repr(C)]
#[derive(Clone, Debug, Default)]
pub struct ExecutionContext {
    rsp: u64,
    rbp: u64,
    rbx: u64,
    r12: u64,
    r13: u64,
    r14: u64,
    r15: u64,
}

/// Saves the current callee-saved registers into `save` and restores the set
/// in `load`, resuming execution where `load` was captured (or at the
/// trampoline for a freshly primed context).
///
/// # Safety
///
/// Both pointers must be valid and distinct. `load` must have been captured
/// by a prior switch or primed by [`ExecutionContext::prime`], and the stack
/// it refers to must still be alive.
#[cfg(all(target_arch = "x86_64", unix))]
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn switch_execution_context(
    _save: *mut ExecutionContext,
    _load: *const ExecutionContext,
) {
    naked_asm!(
        // save into rdi
        "mov [rdi + 0x00], rsp",
        "mov [rdi + 0x08], rbp",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], r13",
        "mov [rdi + 0x28], r14",
        "mov [rdi + 0x30], r15",
        // load from rsi
        "mov rsp, [rsi + 0x00]",
        "mov rbp, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov r12, [rsi + 0x18]",
        "mov r13, [rsi + 0x20]",
        "mov r14, [rsi + 0x28]",
        "mov r15, [rsi + 0x30]",
        // fresh context: pops the trampoline address
        // suspended context: returns into the saved switch call site
        "ret",
    );
}

/// First code a fresh fiber executes. Entered via `ret` with RSP ≡ 8 mod 16,
/// the same misalignment an ordinary `call` would have produced, so the entry
/// function below observes a conforming frame.
#[cfg(all(target_arch = "x86_64", unix))]
#[unsafe(naked)]
unsafe extern "C" fn fiber_trampoline() {
    naked_asm!(
        "mov rdi, r12", // entry argument
        "push rbp",     // realign for the call below
        "call r13",     // entry function, diverges
        "ud2",
    );
}

#[cfg(all(target_arch = "x86_64", unix))]
impl ExecutionContext {
    /// Primes this context so that the next switch into it begins executing
    /// `entry(arg)` on the given stack.
    ///
    /// # Safety
    ///
    /// `stack_top` must be the one-past-the-end address of a live allocation
    /// large enough for `entry` to run on.
    pub(crate) unsafe fn prime(&mut self, stack_top: *mut u8, entry: RawFiberEntry, arg: *mut ()) {
        let top = (stack_top as usize) & !15;
        // One slot below keeps the popped-RSP at the conventional entry
        // misalignment while the slot itself stays 16-aligned.
        let sp = top - 16;
        let tramp: unsafe extern "C" fn() = fiber_trampoline;
        unsafe { *(sp as *mut u64) = tramp as usize as u64 };
        self.rsp = sp as u64;
        self.rbp = 0;
        self.r12 = arg as u64;
        self.r13 = entry as usize as u64;
    }
}

// ---------------------------------------------------------------------------
// aarch64 AAPCS64
// ---------------------------------------------------------------------------

/// Callee-saved register set for aarch64: sp, frame pointer, link register,
/// x19–x28 and the callee-saved halves of v8–v15.
#[cfg(target_arch = "aarch64")]
#[repr(C)]
#[derive(Clone, Debug, Default)]
pub struct ExecutionContext {
    sp: u64,
    fp: u64, // x29
    lr: u64, // x30
    x19_x28: [u64; 10],
    d8_d15: [u64; 8],
}

/// See the x86_64 variant for the contract.
///
/// # Safety
///
/// Both pointers must be valid and distinct; `load` must refer to a live,
/// primed or previously saved context.
#[cfg(target_arch = "aarch64")]
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn switch_execution_context(
    _save: *mut ExecutionContext,
    _load: *const ExecutionContext,
) {
    naked_asm!(
        // save into x0
        "mov x9, sp",
        "str x9, [x0, #0]",
        "stp x29, x30, [x0, #8]",
        "stp x19, x20, [x0, #24]",
        "stp x21, x22, [x0, #40]",
        "stp x23, x24, [x0, #56]",
        "stp x25, x26, [x0, #72]",
        "stp x27, x28, [x0, #88]",
        "stp d8, d9, [x0, #104]",
        "stp d10, d11, [x0, #120]",
        "stp d12, d13, [x0, #136]",
        "stp d14, d15, [x0, #152]",
        // load from x1
        "ldr x9, [x1, #0]",
        "mov sp, x9",
        "ldp x29, x30, [x1, #8]",
        "ldp x19, x20, [x1, #24]",
        "ldp x21, x22, [x1, #40]",
        "ldp x23, x24, [x1, #56]",
        "ldp x25, x26, [x1, #72]",
        "ldp x27, x28, [x1, #88]",
        "ldp d8, d9, [x1, #104]",
        "ldp d10, d11, [x1, #120]",
        "ldp d12, d13, [x1, #136]",
        "ldp d14, d15, [x1, #152]",
        // jumps to the restored x30
        "ret",
    );
}

#[cfg(target_arch = "aarch64")]
#[unsafe(naked)]
unsafe extern "C" fn fiber_trampoline() {
    naked_asm!(
        "mov x0, x19", // entry argument
        "blr x20",     // entry function, diverges
        "brk #0",
    );
}

#[cfg(target_arch = "aarch64")]
impl ExecutionContext {
    /// Primes this context so that the next switch into it begins executing
    /// `entry(arg)` on the given stack.
    ///
    /// # Safety
    ///
    /// `stack_top` must be the one-past-the-end address of a live allocation
    /// large enough for `entry` to run on.
    pub(crate) unsafe fn prime(&mut self, stack_top: *mut u8, entry: RawFiberEntry, arg: *mut ()) {
        let top = (stack_top as usize) & !15;
        self.sp = top as u64;
        self.fp = 0;
        let tramp: unsafe extern "C" fn() = fiber_trampoline;
        self.lr = tramp as usize as u64;
        self.x19_x28[0] = arg as u64; // x19
        self.x19_x28[1] = entry as usize as u64; // x20
    }
}

#[cfg(not(any(all(target_arch = "x86_64", unix), target_arch = "aarch64")))]
compile_error!("no fiber context-switch implementation for this target architecture/ABI");

impl ExecutionContext {
    pub(crate) fn new() -> Self {
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Sanitizer interop
// ---------------------------------------------------------------------------

#[cfg(feature = "asan")]
unsafe extern "C" {
    fn __sanitizer_start_switch_fiber(
        fake_stack_save: *mut *mut c_void,
        bottom: *const c_void,
        size: usize,
    );
    fn __sanitizer_finish_switch_fiber(
        fake_stack_save: *mut c_void,
        bottom_old: *mut *const c_void,
        size_old: *mut usize,
    );
}

#[cfg(feature = "tsan")]
unsafe extern "C" {
    fn __tsan_get_current_fiber() -> *mut c_void;
    fn __tsan_create_fiber(flags: u32) -> *mut c_void;
    fn __tsan_destroy_fiber(fiber: *mut c_void);
    fn __tsan_switch_to_fiber(fiber: *mut c_void, flags: u32);
}

/// Per-execution-context sanitizer bookkeeping. Zero-sized when no sanitizer
/// feature is enabled.
///
/// ASAN keeps a fake-stack save slot per context so the tool can track the
/// shadow stack each switch leaves behind. TSAN keeps one fiber object per
/// context so races are attributed to the logical fiber, not the carrying
/// OS thread.
#[derive(Debug)]
pub(crate) struct SanitizerState {
    #[cfg(feature = "asan")]
    fake_stack: std::cell::Cell<*mut c_void>,
    #[cfg(feature = "tsan")]
    tsan_fiber: std::cell::Cell<*mut c_void>,
    #[cfg(feature = "tsan")]
    tsan_owned: bool,
}

impl Default for SanitizerState {
    fn default() -> Self {
        SanitizerState {
            #[cfg(feature = "asan")]
            fake_stack: std::cell::Cell::new(std::ptr::null_mut()),
            #[cfg(feature = "tsan")]
            tsan_fiber: std::cell::Cell::new(std::ptr::null_mut()),
            #[cfg(feature = "tsan")]
            tsan_owned: false,
        }
    }
}

// Cells are only touched by the OS thread currently carrying the context.
unsafe impl Sync for SanitizerState {}
unsafe impl Send for SanitizerState {}

impl SanitizerState {
    /// State for a fiber with its own stack.
    pub(crate) fn for_fiber() -> Self {
        #[cfg(feature = "tsan")]
        {
            let mut state = Self::default();
            state.tsan_fiber.set(unsafe { __tsan_create_fiber(0) });
            state.tsan_owned = true;
            return state;
        }
        #[cfg(not(feature = "tsan"))]
        Self::default()
    }

    /// State for an OS thread converted into a worker fiber.
    pub(crate) fn for_thread() -> Self {
        #[cfg(feature = "tsan")]
        {
            let state = Self::default();
            state.tsan_fiber.set(unsafe { __tsan_get_current_fiber() });
            return state;
        }
        #[cfg(not(feature = "tsan"))]
        Self::default()
    }

    /// Announces the upcoming switch to the sanitizers. `from` is the context
    /// being suspended (the caller's), `to` the one being resumed.
    #[allow(unused_variables)]
    pub(crate) fn before_switch(
        from: &Self,
        to: &Self,
        to_stack_bottom: *const u8,
        to_stack_len: usize,
    ) {
        #[cfg(feature = "asan")]
        unsafe {
            let mut save = from.fake_stack.get();
            __sanitizer_start_switch_fiber(
                &mut save,
                to_stack_bottom as *const c_void,
                to_stack_len,
            );
            from.fake_stack.set(save);
        }
        #[cfg(feature = "tsan")]
        unsafe {
            __tsan_switch_to_fiber(to.tsan_fiber.get(), 0);
        }
    }

    /// Completes the switch on the destination stack. `landed` is the context
    /// now executing.
    #[allow(unused_variables)]
    pub(crate) fn after_switch(landed: &Self) {
        #[cfg(feature = "asan")]
        unsafe {
            __sanitizer_finish_switch_fiber(
                landed.fake_stack.get(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            );
        }
    }
}

#[cfg(feature = "tsan")]
impl Drop for SanitizerState {
    fn drop(&mut self) {
        if self.tsan_owned {
            let fiber = self.tsan_fiber.get();
            if !fiber.is_null() {
                unsafe { __tsan_destroy_fiber(fiber) };
            }
        }
    }
}
