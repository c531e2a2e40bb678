// SPDX-FileCopyrightText: 2025 drmsurf contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! i915 command stream encoding.
//!
//! ## Command header (32 bits)
//!
//! | Bits    | Field                                   |
//! |---------|-----------------------------------------|
//! | 31:29   | Client (0 = MI, 2 = 2D blitter, 3 = 3D) |
//! | 28:23   | MI opcode                               |
//! | 28:24   | 3D opcode                               |
//! | 23:16   | 3D sub-opcode (for opcode `0x1d`)       |
//! | 7:0     | Dword count minus two                   |

use half::f16;

use drmsurf_common::Tiling;

pub const CLIENT_MI: u32 = 0;
pub const CLIENT_2D: u32 = 2;
pub const CLIENT_3D: u32 = 3;

pub const MI_NOOP: u32 = 0;
pub const MI_FLUSH: u32 = 0x04 << 23;
pub const MI_BATCH_BUFFER_END: u32 = 0x0A << 23;

pub const MI_OPCODE_FLUSH: u32 = 0x04;
pub const MI_OPCODE_BATCH_BUFFER_END: u32 = 0x0A;

/// 3D opcode for multi-dword state packets.
pub const OPCODE_3DSTATE: u32 = 0x1d;
/// 3D opcode for primitives.
pub const OPCODE_PRIM3D: u32 = 0x1f;

pub const SUBOP_LOAD_STATE_IMMEDIATE_1: u32 = 0x04;
pub const SUBOP_BUF_INFO: u32 = 0x8e;

pub const _3DSTATE_LOAD_STATE_IMMEDIATE_1: u32 =
    (CLIENT_3D << 29) | (OPCODE_3DSTATE << 24) | (SUBOP_LOAD_STATE_IMMEDIATE_1 << 16);

/// Selects immediate state dword `n` in a `LOAD_STATE_IMMEDIATE_1` packet.
pub const fn i1_load_s(n: u32) -> u32 {
    1 << (4 + n)
}

pub const S1_VERTEX_WIDTH_SHIFT: u32 = 24;
pub const S1_VERTEX_PITCH_SHIFT: u32 = 16;

/// S1 state dword: vertex size in dwords, used for both width and pitch.
pub const fn s1_vertex_format(floats_per_vertex: u32) -> u32 {
    (floats_per_vertex << S1_VERTEX_WIDTH_SHIFT) | (floats_per_vertex << S1_VERTEX_PITCH_SHIFT)
}

pub const PRIM3D: u32 = (CLIENT_3D << 29) | (OPCODE_PRIM3D << 24);
pub const PRIM3D_INDIRECT_SEQUENTIAL: u32 = 1 << 23;
pub const PRIM3D_RECTLIST: u32 = 0x7 << 18;
pub const PRIM3D_MASK: u32 = 0x1f << 18;

pub const _3DSTATE_BUF_INFO_CMD: u32 = (CLIENT_3D << 29) | (OPCODE_3DSTATE << 24) | (SUBOP_BUF_INFO << 16) | 1;
pub const BUF_3D_ID_COLOR_BACK: u32 = 0x3 << 24;
pub const BUF_3D_TILED_SURFACE: u32 = 1 << 22;
pub const BUF_3D_TILE_WALK_Y: u32 = 1 << 21;
pub const BUF_3D_PITCH_MASK: u32 = 0x3fff;

/// Second dword of `_3DSTATE_BUF_INFO` for the color buffer.
pub fn buf_info_color(tiling: Tiling, stride: u32) -> u32 {
    let tiling_bits = match tiling {
        Tiling::None => 0,
        Tiling::X => BUF_3D_TILED_SURFACE,
        Tiling::Y => BUF_3D_TILED_SURFACE | BUF_3D_TILE_WALK_Y,
    };
    BUF_3D_ID_COLOR_BACK | tiling_bits | (stride & BUF_3D_PITCH_MASK)
}

/// Pack a texture coordinate pair into one dword of half floats, `y` high.
pub fn texcoord_2d_16(x: f32, y: f32) -> u32 {
    ((f16::from_f32(y).to_bits() as u32) << 16) | f16::from_f32(x).to_bits() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headers() {
        assert_eq!(MI_BATCH_BUFFER_END, 0x0500_0000);
        assert_eq!(_3DSTATE_LOAD_STATE_IMMEDIATE_1, 0x7d04_0000);
        assert_eq!(_3DSTATE_BUF_INFO_CMD, 0x7d8e_0001);
        assert_eq!(PRIM3D | PRIM3D_RECTLIST, 0x7f1c_0000);
    }

    #[test]
    fn test_texcoord_packing() {
        assert_eq!(texcoord_2d_16(0.0, 0.0), 0);
        assert_eq!(texcoord_2d_16(1.0, 0.0), 0x3C00);
        assert_eq!(texcoord_2d_16(0.0, 1.0), 0x3C00_0000);
        assert_eq!(texcoord_2d_16(0.5, 2.0), 0x4000_3800);
    }

    #[test]
    fn test_buf_info() {
        assert_eq!(buf_info_color(Tiling::None, 400), BUF_3D_ID_COLOR_BACK | 400);
        assert_eq!(
            buf_info_color(Tiling::Y, 512),
            BUF_3D_ID_COLOR_BACK | BUF_3D_TILED_SURFACE | BUF_3D_TILE_WALK_Y | 512
        );
    }
}
