// SPDX-FileCopyrightText: 2025 drmsurf contributors
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod error;
pub mod settings;
pub mod types;

pub use error::Status;
pub use types::*;
