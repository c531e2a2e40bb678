// SPDX-FileCopyrightText: 2025 drmsurf contributors
// SPDX-License-Identifier: GPL-3.0-or-later

/// Surface/device status code, numbered like the cairo status enum.
/// Value 0 = success.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(pub u32);

impl Status {
    pub const SUCCESS: Self = Self(0);

    /// Check if this is a success status.
    #[inline]
    pub const fn is_success(self) -> bool {
        self.0 == 0
    }

    /// Check if this is an error status.
    #[inline]
    pub const fn is_error(self) -> bool {
        self.0 != 0
    }

    /// Raw u32 value.
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Short uppercase name of the status, e.g. `"NO_MEMORY"`.
    pub fn text(self) -> &'static str {
        match self {
            SUCCESS => "SUCCESS",
            NO_MEMORY => "NO_MEMORY",
            NULL_POINTER => "NULL_POINTER",
            READ_ERROR => "READ_ERROR",
            WRITE_ERROR => "WRITE_ERROR",
            SURFACE_FINISHED => "SURFACE_FINISHED",
            SURFACE_TYPE_MISMATCH => "SURFACE_TYPE_MISMATCH",
            PATTERN_TYPE_MISMATCH => "PATTERN_TYPE_MISMATCH",
            INVALID_CONTENT => "INVALID_CONTENT",
            INVALID_FORMAT => "INVALID_FORMAT",
            INVALID_INDEX => "INVALID_INDEX",
            INVALID_STRIDE => "INVALID_STRIDE",
            INVALID_SIZE => "INVALID_SIZE",
            DEVICE_TYPE_MISMATCH => "DEVICE_TYPE_MISMATCH",
            DEVICE_ERROR => "DEVICE_ERROR",
            DEVICE_FINISHED => "DEVICE_FINISHED",
            NOTHING_TO_DO => "NOTHING_TO_DO",
            UNSUPPORTED => "UNSUPPORTED",
            _ => "UNKNOWN",
        }
    }
}

impl std::fmt::Debug for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Status::{}({})", self.text(), self.0)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.text())
    }
}

impl std::error::Error for Status {}

// Public status codes (flat at module level for easy import).
pub const SUCCESS: Status = Status::SUCCESS;
pub const NO_MEMORY: Status = Status(1);
pub const NULL_POINTER: Status = Status(7);
pub const READ_ERROR: Status = Status(10);
pub const WRITE_ERROR: Status = Status(11);
pub const SURFACE_FINISHED: Status = Status(12);
pub const SURFACE_TYPE_MISMATCH: Status = Status(13);
pub const PATTERN_TYPE_MISMATCH: Status = Status(14);
pub const INVALID_CONTENT: Status = Status(15);
pub const INVALID_FORMAT: Status = Status(16);
pub const INVALID_INDEX: Status = Status(21);
pub const INVALID_STRIDE: Status = Status(24);
pub const INVALID_SIZE: Status = Status(32);
pub const DEVICE_TYPE_MISMATCH: Status = Status(34);
pub const DEVICE_ERROR: Status = Status(35);
pub const DEVICE_FINISHED: Status = Status(37);

// Internal codes, never handed to the drawing layer.
pub const UNSUPPORTED: Status = Status(100);
pub const NOTHING_TO_DO: Status = Status(101);
