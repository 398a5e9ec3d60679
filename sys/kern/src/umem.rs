// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Validation of user-supplied memory references.
//!
//! An address handed to the kernel by a task is an *allegation*: the task
//! claims the span is its own. Nothing about receiving it proves the task
//! may read or write it -- it could point into the kernel, another
//! process, or nowhere. Every handler that takes a pointer argument runs
//! it through one of the predicates here before the first dereference;
//! the predicates answer from the per-process grant tables that also feed
//! the MPU.

use abi::Pid;

use crate::descs::RegionAttributes;
use crate::state::Kernel;

/// A base/length pair as alleged by user code.
#[derive(Copy, Clone, Debug)]
pub(crate) struct Span {
    pub base: usize,
    pub len: usize,
}

impl kerncore::UserSlice for Span {
    fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn base_addr(&self) -> usize {
        self.base
    }

    fn end_addr(&self) -> usize {
        self.base + self.len
    }
}

/// Checks that `[addr, addr+len)` does not wrap the address space.
fn span_ok(addr: usize, len: usize) -> Option<Span> {
    addr.checked_add(len)?;
    Some(Span { base: addr, len })
}

fn check_access(
    k: &Kernel,
    pid: Pid,
    addr: usize,
    len: usize,
    needed: RegionAttributes,
) -> bool {
    if !pid.is_user() || !pid.is_valid() {
        return false;
    }
    let Some(span) = span_ok(addr, len) else {
        return false;
    };
    // DEVICE grants exist for the MPU's benefit; they confer no authority
    // for kernel-side dereferences.
    kerncore::covers(span, k.procs.region_table(pid), |r| {
        r.attributes.contains(needed)
            && !r.attributes.contains(RegionAttributes::DEVICE)
    })
}

/// May process `pid` read `[addr, addr+len)`?
pub fn check_user_read(k: &Kernel, pid: Pid, addr: usize, len: usize) -> bool {
    check_access(k, pid, addr, len, RegionAttributes::READ)
}

/// May process `pid` write `[addr, addr+len)`?
pub fn check_user_write(k: &Kernel, pid: Pid, addr: usize, len: usize) -> bool {
    check_access(k, pid, addr, len, RegionAttributes::WRITE)
}

/// Checks that `addr` could hold a `T` readable by `pid`: aligned, sized,
/// and covered by readable grants. The gate in front of the kernel's only
/// typed dereference of user memory (the `run_task` descriptor).
pub(crate) fn user_ref_ok<T>(k: &Kernel, pid: Pid, addr: usize) -> bool {
    addr % core::mem::align_of::<T>() == 0
        && check_user_read(k, pid, addr, core::mem::size_of::<T>())
}
