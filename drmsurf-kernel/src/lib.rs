// SPDX-FileCopyrightText: 2025 drmsurf contributors
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod abi;
pub mod driver;
pub mod fence;
pub mod gtt;
pub mod handle_table;
#[cfg(target_os = "linux")]
pub mod i915;
pub mod soft;

pub use driver::{Aperture, ExecRequest, GemDriver, GemError, GemResult, Mapping};
pub use fence::{FenceTimeline, Seqno};
#[cfg(target_os = "linux")]
pub use i915::I915Gem;
pub use soft::{RetireMode, SoftGem};
