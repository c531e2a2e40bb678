// SPDX-FileCopyrightText: 2025 drmsurf contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Command stream decoder, used to dump batches for debugging.

use std::fmt::Write;

use crate::commands::{
    CLIENT_2D, CLIENT_3D, CLIENT_MI, MI_OPCODE_BATCH_BUFFER_END, MI_OPCODE_FLUSH, OPCODE_3DSTATE,
    OPCODE_PRIM3D, PRIM3D_INDIRECT_SEQUENTIAL, PRIM3D_MASK, PRIM3D_RECTLIST,
    SUBOP_BUF_INFO, SUBOP_LOAD_STATE_IMMEDIATE_1,
};

/// A command header dword.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHeader(u32);

impl CommandHeader {
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u32 {
        self.0
    }

    /// Command client (bits [31:29]).
    pub fn client(&self) -> u32 {
        self.0 >> 29
    }

    /// MI opcode (bits [28:23]).
    pub fn mi_opcode(&self) -> u32 {
        (self.0 >> 23) & 0x3f
    }

    /// 2D opcode (bits [28:22]).
    pub fn blt_opcode(&self) -> u32 {
        (self.0 >> 22) & 0x7f
    }

    /// 3D opcode (bits [28:24]).
    pub fn opcode_3d(&self) -> u32 {
        (self.0 >> 24) & 0x1f
    }

    /// 3D sub-opcode (bits [23:16]).
    pub fn subopcode_3d(&self) -> u32 {
        (self.0 >> 16) & 0xff
    }

    /// Total length of the command in dwords, header included.
    pub fn dword_count(&self) -> usize {
        match self.client() {
            CLIENT_MI => {
                if self.mi_opcode() < 0x10 {
                    1
                } else {
                    (self.0 & 0x3f) as usize + 2
                }
            }
            CLIENT_2D => (self.0 & 0xff) as usize + 2,
            CLIENT_3D => match self.opcode_3d() {
                OPCODE_3DSTATE if self.subopcode_3d() == SUBOP_LOAD_STATE_IMMEDIATE_1 => {
                    (self.0 & 0xf) as usize + 2
                }
                OPCODE_3DSTATE => (self.0 & 0xffff) as usize + 2,
                OPCODE_PRIM3D if self.0 & PRIM3D_INDIRECT_SEQUENTIAL != 0 => 2,
                OPCODE_PRIM3D => (self.0 & 0xffff) as usize + 2,
                _ => 1,
            },
            _ => 1,
        }
    }

    pub fn name(&self) -> Option<&'static str> {
        let name = match self.client() {
            CLIENT_MI => match self.mi_opcode() {
                0 => "MI_NOOP",
                MI_OPCODE_FLUSH => "MI_FLUSH",
                MI_OPCODE_BATCH_BUFFER_END => "MI_BATCH_BUFFER_END",
                _ => return None,
            },
            CLIENT_2D => match self.blt_opcode() {
                0x43 => "XY_SRC_COPY_BLT",
                0x50 => "XY_COLOR_BLT",
                _ => return None,
            },
            CLIENT_3D => match (self.opcode_3d(), self.subopcode_3d()) {
                (OPCODE_3DSTATE, SUBOP_LOAD_STATE_IMMEDIATE_1) => "3DSTATE_LOAD_STATE_IMMEDIATE_1",
                (OPCODE_3DSTATE, SUBOP_BUF_INFO) => "3DSTATE_BUF_INFO",
                (OPCODE_3DSTATE, _) => "3DSTATE",
                (OPCODE_PRIM3D, _) if self.0 & PRIM3D_MASK == PRIM3D_RECTLIST => "PRIM3D_RECTLIST",
                (OPCODE_PRIM3D, _) => "PRIM3D",
                _ => "3DSTATE_INLINE",
            },
            _ => return None,
        };
        Some(name)
    }
}

/// One decoded command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedCommand {
    /// Dword offset into the batch.
    pub offset: usize,
    pub name: &'static str,
    pub len: usize,
}

/// Split a command stream into commands. Unknown headers decode as a single
/// dword named `UNKNOWN`.
pub fn decode(words: &[u32]) -> Vec<DecodedCommand> {
    let mut out = Vec::new();
    let mut offset = 0;
    while offset < words.len() {
        let header = CommandHeader::new(words[offset]);
        let (name, len) = match header.name() {
            Some(name) => (name, header.dword_count()),
            None => {
                log::warn!("decoder: unknown command 0x{:08X} at dword {}", header.raw(), offset);
                ("UNKNOWN", 1)
            }
        };
        let len = len.min(words.len() - offset);
        out.push(DecodedCommand { offset, name, len });
        offset += len;
    }
    out
}

/// Human-readable listing of a command stream.
pub fn dump(words: &[u32]) -> String {
    let mut text = String::new();
    for cmd in decode(words) {
        let _ = write!(text, "0x{:04X}: {}", cmd.offset * 4, cmd.name);
        for word in &words[cmd.offset..cmd.offset + cmd.len] {
            let _ = write!(text, " {:08X}", word);
        }
        text.push('\n');
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::*;

    #[test]
    fn test_decode_rectangle_run() {
        let words = [
            _3DSTATE_LOAD_STATE_IMMEDIATE_1 | i1_load_s(0) | i1_load_s(1) | 1,
            0x1000,
            s1_vertex_format(4),
            PRIM3D | PRIM3D_RECTLIST | PRIM3D_INDIRECT_SEQUENTIAL | 3,
            0,
            MI_BATCH_BUFFER_END,
        ];
        let cmds = decode(&words);
        let names: Vec<_> = cmds.iter().map(|c| c.name).collect();
        assert_eq!(
            names,
            ["3DSTATE_LOAD_STATE_IMMEDIATE_1", "PRIM3D_RECTLIST", "MI_BATCH_BUFFER_END"]
        );
        assert_eq!(cmds[0].len, 3);
        assert_eq!(cmds[1].offset, 3);
        assert_eq!(cmds[1].len, 2);
    }

    #[test]
    fn test_decode_buf_info_and_noop() {
        let words = [_3DSTATE_BUF_INFO_CMD, buf_info_color(drmsurf_common::Tiling::X, 512), 0, MI_NOOP];
        let cmds = decode(&words);
        assert_eq!(cmds.len(), 2);
        assert_eq!(cmds[0].name, "3DSTATE_BUF_INFO");
        assert_eq!(cmds[0].len, 3);
        assert_eq!(cmds[1].name, "MI_NOOP");
    }

    #[test]
    fn test_unknown_and_truncated() {
        // Client 7 is unused; a 3DSTATE header claiming more dwords than remain.
        let words = [0xE000_0000, _3DSTATE_BUF_INFO_CMD];
        let cmds = decode(&words);
        assert_eq!(cmds[0].name, "UNKNOWN");
        assert_eq!(cmds[1].len, 1);
        assert!(dump(&words).contains("0x0004: 3DSTATE_BUF_INFO 7D8E0001"));
    }
}
