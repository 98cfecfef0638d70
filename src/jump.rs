//! The point of no return.
//!
//! Interrupts off, a DSB so every loaded byte is committed, an ISB so the
//! pipeline refetches, the handoff pointer in r0, Thumb bit set, branch.
//! Only real on ARM; elsewhere this is an unreachable stub so the rest of
//! the crate stays host-testable.

use crate::handoff::Handoff;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "arm")] {
        /// Branches to `entry` with `handoff` in the first argument
        /// register. Optionally loads the main stack pointer first, for
        /// payloads that expect MSP at a known value instead of setting
        /// it up themselves.
        ///
        /// # Safety
        ///
        /// `entry` must be the validated entry point of an image placed by
        /// the loader, and `handoff` must point at a built descriptor that
        /// does not overlap any loaded segment. Does not return.
        pub unsafe fn transfer(handoff: *const Handoff, entry: u32, msp: Option<u32>) -> ! {
            cortex_m::interrupt::disable();

            match msp {
                Some(sp) => core::arch::asm!(
                    "msr msp, {sp}",
                    "dsb",
                    "isb",
                    "orr {entry}, {entry}, #1",
                    "bx {entry}",
                    sp = in(reg) sp,
                    entry = in(reg) entry,
                    in("r0") handoff as u32,
                    options(noreturn),
                ),
                None => core::arch::asm!(
                    "dsb",
                    "isb",
                    "orr {entry}, {entry}, #1",
                    "bx {entry}",
                    entry = in(reg) entry,
                    in("r0") handoff as u32,
                    options(noreturn),
                ),
            }
        }
    } else {
        /// Host stand-in; the real transfer only exists on ARM.
        ///
        /// # Safety
        ///
        /// Never actually transfers; panics.
        pub unsafe fn transfer(_handoff: *const Handoff, _entry: u32, _msp: Option<u32>) -> ! {
            unimplemented!("execution transfer requires an ARM target")
        }
    }
}
