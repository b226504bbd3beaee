//! Memory subsystem
//!
//! Memory layout (GameCube-style):
//! 0x00000000 - RAM size:   physical main RAM
//! 0x80000000 - 0x8FFFFFFF: cached mirror of physical memory (translation on)
//! 0xC0000000 - 0xCFFFFFFF: uncached mirror of physical memory (translation on)
//!
//! With MSR[IR] / MSR[DR] clear, effective addresses are physical. The
//! guest is big-endian; all multi-byte accessors return host values.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cpu::{MSR_DR, MSR_IR};

/// Cached / uncached mirror bases
pub const CACHED_BASE: u32 = 0x8000_0000;
pub const UNCACHED_BASE: u32 = 0xC000_0000;
const MIRROR_SIZE: u32 = 0x1000_0000;

/// Default RAM size (24 MiB, as on the console)
pub const DEFAULT_RAM_SIZE: usize = 24 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessKind {
    Fetch,
    Read,
    Write,
}

/// Guest address-translation fault. This is guest-visible state, not a host
/// error; callers turn it into ISI/DSI.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("{kind:?} translation fault at {addr:#010x}")]
pub struct MemFault {
    pub addr: u32,
    pub kind: AccessKind,
}

/// Bus interface for CPU memory access.
///
/// `translate` maps an effective address to a physical one under the given
/// MSR; the accessors take physical addresses.
pub trait Bus {
    fn translate(&mut self, addr: u32, kind: AccessKind, msr: u32) -> Result<u32, MemFault>;

    fn read8(&mut self, paddr: u32) -> u8;
    fn write8(&mut self, paddr: u32, value: u8);

    fn read16(&mut self, paddr: u32) -> u16 {
        ((self.read8(paddr) as u16) << 8) | self.read8(paddr.wrapping_add(1)) as u16
    }

    fn write16(&mut self, paddr: u32, value: u16) {
        self.write8(paddr, (value >> 8) as u8);
        self.write8(paddr.wrapping_add(1), value as u8);
    }

    fn read32(&mut self, paddr: u32) -> u32 {
        ((self.read16(paddr) as u32) << 16) | self.read16(paddr.wrapping_add(2)) as u32
    }

    fn write32(&mut self, paddr: u32, value: u32) {
        self.write16(paddr, (value >> 16) as u16);
        self.write16(paddr.wrapping_add(2), value as u16);
    }

    fn read64(&mut self, paddr: u32) -> u64 {
        ((self.read32(paddr) as u64) << 32) | self.read32(paddr.wrapping_add(4)) as u64
    }

    fn write64(&mut self, paddr: u32, value: u64) {
        self.write32(paddr, (value >> 32) as u32);
        self.write32(paddr.wrapping_add(4), value as u32);
    }
}

/// Main RAM with the fixed mirror translation
#[derive(Clone, Serialize, Deserialize)]
pub struct Memory {
    ram: Vec<u8>,
}

impl Memory {
    pub fn new(size: usize) -> Self {
        Memory { ram: vec![0; size] }
    }

    pub fn size(&self) -> usize {
        self.ram.len()
    }

    pub fn ram(&self) -> &[u8] {
        &self.ram
    }

    /// Replace RAM contents (save-state restore); sizes must match
    pub fn restore(&mut self, data: &[u8]) -> bool {
        if data.len() != self.ram.len() {
            return false;
        }
        self.ram.copy_from_slice(data);
        true
    }

    pub fn clear(&mut self) {
        self.ram.fill(0);
    }

    /// Copy a binary image into physical memory
    pub fn load(&mut self, paddr: u32, data: &[u8]) -> Result<(), MemFault> {
        let start = paddr as usize;
        let end = start.checked_add(data.len()).filter(|&end| end <= self.ram.len());
        match end {
            Some(end) => {
                self.ram[start..end].copy_from_slice(data);
                Ok(())
            }
            None => Err(MemFault { addr: paddr, kind: AccessKind::Write }),
        }
    }

    #[inline(always)]
    fn in_range(&self, paddr: u32) -> bool {
        (paddr as usize) < self.ram.len()
    }
}

impl Bus for Memory {
    fn translate(&mut self, addr: u32, kind: AccessKind, msr: u32) -> Result<u32, MemFault> {
        let enabled = match kind {
            AccessKind::Fetch => msr & MSR_IR != 0,
            AccessKind::Read | AccessKind::Write => msr & MSR_DR != 0,
        };
        let paddr = if !enabled {
            addr
        } else if (CACHED_BASE..CACHED_BASE + MIRROR_SIZE).contains(&addr) {
            addr - CACHED_BASE
        } else if (UNCACHED_BASE..UNCACHED_BASE + MIRROR_SIZE).contains(&addr) {
            addr - UNCACHED_BASE
        } else {
            return Err(MemFault { addr, kind });
        };
        if self.in_range(paddr) {
            Ok(paddr)
        } else {
            Err(MemFault { addr, kind })
        }
    }

    #[inline(always)]
    fn read8(&mut self, paddr: u32) -> u8 {
        self.ram.get(paddr as usize).copied().unwrap_or(0)
    }

    #[inline(always)]
    fn write8(&mut self, paddr: u32, value: u8) {
        if let Some(b) = self.ram.get_mut(paddr as usize) {
            *b = value;
        }
    }

    #[inline(always)]
    fn read32(&mut self, paddr: u32) -> u32 {
        let a = paddr as usize;
        match self.ram.get(a..a + 4) {
            Some(bytes) => u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            None => 0,
        }
    }

    #[inline(always)]
    fn write32(&mut self, paddr: u32, value: u32) {
        let a = paddr as usize;
        if let Some(bytes) = self.ram.get_mut(a..a + 4) {
            bytes.copy_from_slice(&value.to_be_bytes());
        }
    }
}
