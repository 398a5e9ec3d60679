// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Support for recording kernel deaths such that they can be found by
//! tooling.
//!
//! This module defines the following binary interface to debuggers:
//!
//! - `fail::KERNEL_HAS_FAILED` is a flag, cleared before entry to kernel
//!   init and set if the kernel reaches [`die`] (explicitly or through an
//!   invariant violation).
//!
//! - `fail::KERNEL_EPITAPH` is a byte array. [`die`] writes as much of the
//!   failure reason into it (as UTF-8) as fits, truncating if the buffer
//!   fills. The number of bytes written isn't recorded anywhere; for
//!   printing, trim trailing NUL bytes.
//!
//! A CPU exception taken in supervisor state, a second kernel on one
//! core, a reentered kernel borrow -- anything that means kernel state
//! itself can no longer be trusted -- ends up here. User-task misbehavior
//! never does; that is counted and survived.

use core::fmt::{Display, Write};
use core::sync::atomic::{AtomicBool, Ordering};

/// Flag set by all failure reporting, giving tools a one-stop shop for
/// kernel triage.
static KERNEL_HAS_FAILED: AtomicBool = AtomicBool::new(false);

const EPITAPH_LEN: usize = 128;

/// The "epitaph" records up to `EPITAPH_LEN` bytes of description of the
/// event that killed the kernel, padded with NULs.
static mut KERNEL_EPITAPH: [u8; EPITAPH_LEN] = [0; EPITAPH_LEN];

fn begin_epitaph() -> Option<&'static mut [u8; EPITAPH_LEN]> {
    if KERNEL_HAS_FAILED.swap(true, Ordering::SeqCst) {
        // A second failure while the first is being recorded -- keep the
        // first story rather than scribbling over it.
        return None;
    }
    // Safety: the swap above admits exactly one caller, ever, to this
    // branch; nothing else touches the buffer until the machine is dead.
    Some(unsafe { &mut *core::ptr::addr_of_mut!(KERNEL_EPITAPH) })
}

/// Records `msg` as the kernel's last words and halts the machine.
#[inline(always)]
pub fn die(msg: impl Display) -> ! {
    die_impl(&msg)
}

#[inline(never)]
fn die_impl(msg: &dyn Display) -> ! {
    if let Some(buf) = begin_epitaph() {
        let mut writer = Eulogist { dest: buf };
        write!(writer, "{msg}").ok();
    }
    crate::arch::halt()
}

/// Whether the kernel has reached [`die`] this boot.
pub fn has_failed() -> bool {
    KERNEL_HAS_FAILED.load(Ordering::SeqCst)
}

/// The recorded last words, NUL padding trimmed. Hosted triage surface.
#[cfg(not(target_os = "none"))]
pub fn epitaph() -> String {
    // Safety: by the time anyone asks for an epitaph the sole writer has
    // finished (it halted); reads of stale bytes are still initialized
    // memory.
    let buf = unsafe { &*core::ptr::addr_of!(KERNEL_EPITAPH) };
    let end = buf.iter().position(|&b| b == 0).unwrap_or(EPITAPH_LEN);
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

struct Eulogist<'a> {
    dest: &'a mut [u8],
}

impl Write for Eulogist<'_> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let n = s.len().min(self.dest.len());
        let (dest, leftovers) = core::mem::take(&mut self.dest).split_at_mut(n);
        dest.copy_from_slice(&s.as_bytes()[..n]);
        self.dest = leftovers;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn die_records_an_epitaph_and_unwinds() {
        let death = std::panic::catch_unwind(|| die("tick source wedged"));
        let payload = death.unwrap_err();
        assert!(payload.is::<crate::arch::KernelFatal>());
        assert!(has_failed());
        assert_eq!(epitaph(), "tick source wedged");
    }
}
