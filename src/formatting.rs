use crate::protocol::*;
use crate::video::{decode_vga_attribute, VgaAttribute};

impl std::fmt::Debug for RegisterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ds = f.debug_struct("RegisterSet");
        for (name, value) in self.iter() {
            ds.field(name, &format_args!("0x{:08X}", value));
        }
        ds.finish()
    }
}

impl std::fmt::Display for RegisterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f,
            "EAX={:08X} EBX={:08X} ECX={:08X} EDX={:08X} ESI={:08X} EDI={:08X} EBP={:08X} ESP={:08X}\n\
             DS={:04X} ES={:04X} FS={:04X} GS={:04X} SS={:04X} CS={:04X} EIP={:08X} EFLAGS={:08X}",
            self.eax, self.ebx, self.ecx, self.edx, self.esi, self.edi, self.ebp, self.esp,
            self.ds, self.es, self.fs, self.gs, self.ss, self.cs, self.eip, self.eflags,
        )
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Linear(addr) => write!(f, "0x{:05X}", addr),
            Address::SegOff { segment, offset } => write!(f, "{:04X}:{:04X}", segment, offset),
        }
    }
}

impl std::fmt::Display for StopReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReply::Signal(sig) => write!(f, "stopped (signal {})", sig),
            StopReply::Exited(code) => write!(f, "exited (code {})", code),
            StopReply::Terminated(sig) => write!(f, "terminated (signal {})", sig),
            StopReply::Output(text) => write!(f, "output: {}", text),
            StopReply::Other(raw) => write!(f, "{}", raw),
        }
    }
}

impl std::fmt::Debug for VgaAttribute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VgaAttribute")
            .field("foreground", &format_args!("{} ({})", self.foreground, self.fg_color().name()))
            .field("background", &format_args!("{} ({})", self.background, self.bg_color().name()))
            .field("bright", &self.bright)
            .field("blink", &self.blink)
            .finish()
    }
}

impl std::fmt::Display for VgaAttribute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fg={}", self.fg_color().name())?;
        if self.bright {
            write!(f, " bright")?;
        }
        write!(f, " bg={}", self.bg_color().name())?;
        if self.blink {
            write!(f, " blink")?;
        }
        Ok(())
    }
}

/// e.g. `fg=brown bright bg=blue` for 0x1E.
pub fn format_attribute_info(attr: u8) -> String {
    decode_vga_attribute(attr).to_string()
}
