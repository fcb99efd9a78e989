//! Text-mode video memory and BIOS data area helpers.
//!
//! Each screen cell is two bytes: the character code followed by its
//! attribute. Decoding is pure; only the `read_*` helpers touch the target.
use crate::gdb_client::GdbClient;
use crate::interfaces::{GdbError, MemoryReader};
use crate::protocol::Address;
use serde::Serialize;

pub const VIDEO_MEM_ADDR: u32 = 0xB8000;
pub const SCREEN_WIDTH: usize = 80;
pub const SCREEN_HEIGHT: usize = 25;
/// 80x25 cells, two bytes each.
pub const VIDEO_MEM_SIZE: usize = SCREEN_WIDTH * SCREEN_HEIGHT * 2;
/// 32-bit tick counter incremented at 18.2 Hz.
pub const BIOS_TIMER_TICKS: u32 = 0x46C;
pub const BIOS_VIDEO_MODE: u32 = 0x449;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VgaColor {
    Black,
    Blue,
    Green,
    Cyan,
    Red,
    Magenta,
    Brown,
    White,
}

impl VgaColor {
    pub const PALETTE: [VgaColor; 8] = [
        VgaColor::Black,
        VgaColor::Blue,
        VgaColor::Green,
        VgaColor::Cyan,
        VgaColor::Red,
        VgaColor::Magenta,
        VgaColor::Brown,
        VgaColor::White,
    ];

    pub fn from_index(index: u8) -> Self {
        Self::PALETTE[usize::from(index & 0x07)]
    }

    pub fn name(self) -> &'static str {
        match self {
            VgaColor::Black => "black",
            VgaColor::Blue => "blue",
            VgaColor::Green => "green",
            VgaColor::Cyan => "cyan",
            VgaColor::Red => "red",
            VgaColor::Magenta => "magenta",
            VgaColor::Brown => "brown",
            VgaColor::White => "white",
        }
    }
}

/// Decoded attribute byte.
#[derive(Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VgaAttribute {
    /// Palette index, bits 0-2.
    pub foreground: u8,
    /// Palette index, bits 4-6.
    pub background: u8,
    pub bright: bool,
    pub blink: bool,
}

impl VgaAttribute {
    pub fn fg_color(&self) -> VgaColor {
        VgaColor::from_index(self.foreground)
    }

    pub fn bg_color(&self) -> VgaColor {
        VgaColor::from_index(self.background)
    }
}

pub fn decode_vga_attribute(attr: u8) -> VgaAttribute {
    VgaAttribute {
        foreground: attr & 0x07,
        background: (attr >> 4) & 0x07,
        bright: attr & 0x08 != 0,
        blink: attr & 0x80 != 0,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScreenCell {
    /// Printable form of `code`, `.` for anything outside 0x20..0x7F.
    pub ch: char,
    pub code: u8,
    pub attr: u8,
    pub attr_info: VgaAttribute,
}

fn printable(code: u8) -> Option<char> {
    (0x20..0x7F).contains(&code).then(|| char::from(code))
}

/// Text lines of a `width`x`height` dump. Missing bytes yield short lines.
pub fn decode_text(raw: &[u8], width: usize, height: usize) -> Vec<String> {
    (0..height)
        .map(|row| {
            let line: String = (0..width)
                .filter_map(|col| raw.get((row * width + col) * 2))
                .map(|&code| printable(code).unwrap_or(' '))
                .collect();
            line.trim_end_matches(' ').to_string()
        })
        .collect()
}

/// Per-cell character and attribute data. Cells without both bytes present
/// are omitted.
pub fn decode_cells(raw: &[u8], width: usize, height: usize) -> Vec<Vec<ScreenCell>> {
    (0..height)
        .map(|row| {
            (0..width)
                .filter_map(|col| {
                    let offset = (row * width + col) * 2;
                    let code = *raw.get(offset)?;
                    let attr = *raw.get(offset + 1)?;
                    Some(ScreenCell {
                        ch: printable(code).unwrap_or('.'),
                        code,
                        attr,
                        attr_info: decode_vga_attribute(attr),
                    })
                })
                .collect()
        })
        .collect()
}

pub fn read_screen_raw<R: MemoryReader + ?Sized>(reader: &mut R) -> Result<Vec<u8>, GdbError> {
    reader.read_memory_at(Address::Linear(VIDEO_MEM_ADDR), VIDEO_MEM_SIZE)
}

pub fn read_timer_ticks<R: MemoryReader + ?Sized>(reader: &mut R) -> Result<u32, GdbError> {
    let data = reader.read_memory_at(Address::Linear(BIOS_TIMER_TICKS), 4)?;
    Ok(match <[u8; 4]>::try_from(data.as_slice()) {
        Ok(bytes) => u32::from_le_bytes(bytes),
        Err(_) => 0,
    })
}

pub fn read_video_mode<R: MemoryReader + ?Sized>(reader: &mut R) -> Result<u8, GdbError> {
    let data = reader.read_memory_at(Address::Linear(BIOS_VIDEO_MODE), 1)?;
    Ok(data.first().copied().unwrap_or(0))
}

impl GdbClient {
    pub fn screen_raw(&mut self) -> Result<Vec<u8>, GdbError> {
        read_screen_raw(self)
    }

    pub fn screen_dump(&mut self, width: usize, height: usize) -> Result<Vec<String>, GdbError> {
        let raw = self.screen_raw()?;
        Ok(decode_text(&raw, width, height))
    }

    /// One row of the screen; empty if `row` is past the dump.
    pub fn screen_line(&mut self, row: usize, width: usize) -> Result<String, GdbError> {
        let mut lines = self.screen_dump(width, row + 1)?;
        Ok(if row < lines.len() { lines.swap_remove(row) } else { String::new() })
    }

    /// Screen text followed by the tick counter, read back to back.
    pub fn screen_dump_with_ticks(&mut self, width: usize, height: usize) -> Result<(Vec<String>, u32), GdbError> {
        let lines = self.screen_dump(width, height)?;
        let ticks = self.read_timer_ticks()?;
        Ok((lines, ticks))
    }

    pub fn screen_debug(&mut self, width: usize, height: usize) -> Result<Vec<Vec<ScreenCell>>, GdbError> {
        let raw = self.screen_raw()?;
        Ok(decode_cells(&raw, width, height))
    }

    pub fn read_timer_ticks(&mut self) -> Result<u32, GdbError> {
        read_timer_ticks(self)
    }

    pub fn read_video_mode(&mut self) -> Result<u8, GdbError> {
        read_video_mode(self)
    }
}
