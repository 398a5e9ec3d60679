// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Platform support.
//!
//! Everything the kernel knows about the machine funnels through this
//! module: the interrupt controller's current-priority register, the
//! software-interrupt pending bits, the periodic timer, the free-running
//! timebase, the external-interrupt-enable critical section, and the
//! anchor cell through which trap handlers reach kernel state.
//!
//! In practice, this works by
//!
//! - Conditionally defining a nested module (below).
//! - `pub use`-ing its contents
//!
//! Thus, all platform-specific types and functions show up right here in
//! the `arch` module, magically tailored for the current target. For this
//! to work, each port must define the same set of names.

cfg_if::cfg_if! {
    // Note: cfg_if! is slightly touchy about ordering and expression
    // complexity; this chain seems to be the best compromise.

    if #[cfg(target_os = "none")] {
        compile_error!("no bare-metal port in this tree; a port must supply the arch surface for its interrupt controller and timebase");
    } else {
        #[macro_use]
        pub mod hosted;
        pub use hosted::*;
    }
}
