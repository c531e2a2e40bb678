// SPDX-FileCopyrightText: 2025 drmsurf contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! PCI chip identification for Intel integrated graphics.

use drmsurf_common::Tiling;

pub const VENDOR_INTEL: u32 = 0x8086;
pub const VENDOR_AMD: u32 = 0x1002;

pub const PCI_CHIP_I810: u32 = 0x7121;
pub const PCI_CHIP_I810_DC100: u32 = 0x7123;
pub const PCI_CHIP_I810_E: u32 = 0x7125;
pub const PCI_CHIP_I815: u32 = 0x1132;

pub const PCI_CHIP_I830_M: u32 = 0x3577;
pub const PCI_CHIP_845_G: u32 = 0x2562;
pub const PCI_CHIP_I855_GM: u32 = 0x3582;
pub const PCI_CHIP_I865_G: u32 = 0x2572;

pub const PCI_CHIP_I915_G: u32 = 0x2582;
pub const PCI_CHIP_E7221_G: u32 = 0x258A;
pub const PCI_CHIP_I915_GM: u32 = 0x2592;
pub const PCI_CHIP_I945_G: u32 = 0x2772;
pub const PCI_CHIP_I945_GM: u32 = 0x27A2;
pub const PCI_CHIP_I945_GME: u32 = 0x27AE;

pub const PCI_CHIP_Q35_G: u32 = 0x29B2;
pub const PCI_CHIP_G33_G: u32 = 0x29C2;
pub const PCI_CHIP_Q33_G: u32 = 0x29D2;

pub const PCI_CHIP_IGD_GM: u32 = 0xA011;
pub const PCI_CHIP_IGD_G: u32 = 0xA001;

pub const PCI_CHIP_I965_G: u32 = 0x29A2;
pub const PCI_CHIP_I965_Q: u32 = 0x2992;
pub const PCI_CHIP_I965_G_1: u32 = 0x2982;
pub const PCI_CHIP_I946_GZ: u32 = 0x2972;
pub const PCI_CHIP_I965_GM: u32 = 0x2A02;
pub const PCI_CHIP_I965_GME: u32 = 0x2A12;

pub const PCI_CHIP_GM45_GM: u32 = 0x2A42;

pub const PCI_CHIP_IGD_E_G: u32 = 0x2E02;
pub const PCI_CHIP_Q45_G: u32 = 0x2E12;
pub const PCI_CHIP_G45_G: u32 = 0x2E22;
pub const PCI_CHIP_G41_G: u32 = 0x2E32;

pub const PCI_CHIP_ILD_G: u32 = 0x0042;
pub const PCI_CHIP_ILM_G: u32 = 0x0046;

/// Hardware generation, coarse enough to pick defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipFamily {
    Gen2,
    I915,
    I945,
    I965,
    G4x,
    Ironlake,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChipInfo {
    pub chip_id: u32,
    pub family: ChipFamily,
    pub mobile: bool,
}

pub fn is_igd(id: u32) -> bool {
    id == PCI_CHIP_IGD_G || id == PCI_CHIP_IGD_GM
}

pub fn is_mobile(id: u32) -> bool {
    matches!(
        id,
        PCI_CHIP_I855_GM
            | PCI_CHIP_I915_GM
            | PCI_CHIP_I945_GM
            | PCI_CHIP_I945_GME
            | PCI_CHIP_I965_GM
            | PCI_CHIP_I965_GME
            | PCI_CHIP_GM45_GM
    ) || is_igd(id)
}

pub fn is_g45(id: u32) -> bool {
    matches!(
        id,
        PCI_CHIP_IGD_E_G | PCI_CHIP_Q45_G | PCI_CHIP_G45_G | PCI_CHIP_G41_G
    )
}

pub fn is_g4x(id: u32) -> bool {
    is_g45(id) || id == PCI_CHIP_GM45_GM
}

pub fn is_ironlake(id: u32) -> bool {
    id == PCI_CHIP_ILD_G || id == PCI_CHIP_ILM_G
}

pub fn is_915(id: u32) -> bool {
    matches!(id, PCI_CHIP_I915_G | PCI_CHIP_E7221_G | PCI_CHIP_I915_GM)
}

pub fn is_945(id: u32) -> bool {
    matches!(
        id,
        PCI_CHIP_I945_G
            | PCI_CHIP_I945_GM
            | PCI_CHIP_I945_GME
            | PCI_CHIP_G33_G
            | PCI_CHIP_Q33_G
            | PCI_CHIP_Q35_G
    ) || is_igd(id)
}

pub fn is_965(id: u32) -> bool {
    matches!(
        id,
        PCI_CHIP_I965_G
            | PCI_CHIP_I965_Q
            | PCI_CHIP_I965_G_1
            | PCI_CHIP_I965_GM
            | PCI_CHIP_I965_GME
            | PCI_CHIP_I946_GZ
    ) || is_g4x(id)
        || is_ironlake(id)
}

pub fn is_9xx(id: u32) -> bool {
    is_915(id) || is_945(id) || is_965(id)
}

impl ChipInfo {
    pub fn identify(chip_id: u32) -> Self {
        let family = if is_ironlake(chip_id) {
            ChipFamily::Ironlake
        } else if is_g4x(chip_id) {
            ChipFamily::G4x
        } else if is_965(chip_id) {
            ChipFamily::I965
        } else if is_945(chip_id) {
            ChipFamily::I945
        } else if is_915(chip_id) {
            ChipFamily::I915
        } else if matches!(
            chip_id,
            PCI_CHIP_I810
                | PCI_CHIP_I810_DC100
                | PCI_CHIP_I810_E
                | PCI_CHIP_I815
                | PCI_CHIP_I830_M
                | PCI_CHIP_845_G
                | PCI_CHIP_I855_GM
                | PCI_CHIP_I865_G
        ) {
            ChipFamily::Gen2
        } else {
            ChipFamily::Unknown
        };
        Self {
            chip_id,
            family,
            mobile: is_mobile(chip_id),
        }
    }

    /// Tiling picked for new render targets on this chip.
    ///
    /// Y tiling is the default on 9xx parts; older parts and unknown chips
    /// stay linear.
    pub fn default_tiling(&self) -> Tiling {
        if is_9xx(self.chip_id) {
            Tiling::Y
        } else {
            Tiling::None
        }
    }

    pub fn name(&self) -> &'static str {
        match self.family {
            ChipFamily::Gen2 => "gen2",
            ChipFamily::I915 => "i915",
            ChipFamily::I945 => "i945",
            ChipFamily::I965 => "i965",
            ChipFamily::G4x => "g4x",
            ChipFamily::Ironlake => "ironlake",
            ChipFamily::Unknown => "unknown",
        }
    }
}
