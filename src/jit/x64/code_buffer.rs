//! Executable memory for generated code
//!
//! One fixed mapping, toggled between writable and executable. The address
//! never changes, so code can embed absolute and rel32 references into it.

use dynasmrt::mmap::{ExecutableBuffer, MutableBuffer};

use crate::jit::JitError;

/// Alignment of block starts
pub const BLOCK_ALIGN: usize = 16;

enum Mapping {
    Writable(MutableBuffer),
    Executable(ExecutableBuffer),
    /// A protection change failed; the memory is gone
    Lost,
}

pub struct CodeBuffer {
    mapping: Mapping,
    base: usize,
    size: usize,
    /// End of emitted code
    pos: usize,
}

impl CodeBuffer {
    pub fn new(size: usize) -> Result<Self, JitError> {
        let mut buf = MutableBuffer::new(size)?;
        buf.set_len(size);
        buf.fill(0xCC);
        let base = buf.as_ptr() as usize;
        log::debug!("[JIT] code buffer: {} KiB at {:#x}", size / 1024, base);
        Ok(CodeBuffer { mapping: Mapping::Writable(buf), base, size, pos: 0 })
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Where the next block would start
    pub fn next_block_address(&self) -> usize {
        self.base + align_up(self.pos, BLOCK_ALIGN)
    }

    pub fn space_remaining(&self) -> usize {
        self.size.saturating_sub(align_up(self.pos, BLOCK_ALIGN))
    }

    fn writable(&mut self) -> Result<&mut MutableBuffer, JitError> {
        if let Mapping::Executable(_) = self.mapping {
            let Mapping::Executable(exec) = std::mem::replace(&mut self.mapping, Mapping::Lost) else {
                return Err(JitError::BufferLost);
            };
            self.mapping = Mapping::Writable(exec.make_mut()?);
        }
        match &mut self.mapping {
            Mapping::Writable(buf) => Ok(buf),
            _ => Err(JitError::BufferLost),
        }
    }

    /// Flip to executable before jumping into the buffer
    pub fn make_executable(&mut self) -> Result<(), JitError> {
        match self.mapping {
            Mapping::Executable(_) => Ok(()),
            Mapping::Lost => Err(JitError::BufferLost),
            Mapping::Writable(_) => {
                let Mapping::Writable(buf) = std::mem::replace(&mut self.mapping, Mapping::Lost) else {
                    return Err(JitError::BufferLost);
                };
                self.mapping = Mapping::Executable(buf.make_exec()?);
                Ok(())
            }
        }
    }

    /// Overwrite code at an absolute address (link patching)
    pub fn patch(&mut self, address: usize, bytes: &[u8]) -> Result<(), JitError> {
        let offset = address.wrapping_sub(self.base);
        if offset.checked_add(bytes.len()).map_or(true, |end| end > self.pos) {
            return Err(JitError::BadPatch(address));
        }
        let buf = self.writable()?;
        buf[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Place `bytes` at `address`, which must be at or after the end of
    /// emitted code
    pub fn append(&mut self, address: usize, bytes: &[u8]) -> Result<(), JitError> {
        let offset = address.wrapping_sub(self.base);
        let end = offset.checked_add(bytes.len()).unwrap_or(usize::MAX);
        if offset < self.pos || end > self.size {
            return Err(JitError::CodeBufferFull { needed: bytes.len(), available: self.space_remaining() });
        }
        let buf = self.writable()?;
        buf[offset..end].copy_from_slice(bytes);
        self.pos = end;
        Ok(())
    }

    /// Drop everything after `keep` bytes and refill it with `int3`
    pub fn truncate(&mut self, keep: usize) -> Result<(), JitError> {
        if keep >= self.pos {
            return Ok(());
        }
        let pos = self.pos;
        let buf = self.writable()?;
        buf[keep..pos].fill(0xCC);
        self.pos = keep;
        Ok(())
    }
}

pub fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_patch() {
        let mut cb = CodeBuffer::new(64 * 1024).unwrap();
        let base = cb.base();
        cb.append(base, &[0x90; 5]).unwrap();
        assert_eq!(cb.pos(), 5);
        assert_eq!(cb.next_block_address(), base + 16);
        cb.make_executable().unwrap();
        cb.patch(base + 1, &[0xC3]).unwrap();
        assert!(cb.patch(base + 5, &[0xC3]).is_err());
        // Going backwards is refused
        assert!(cb.append(base + 2, &[0x90]).is_err());
    }

    #[test]
    fn test_truncate_keeps_address() {
        let mut cb = CodeBuffer::new(64 * 1024).unwrap();
        let base = cb.base();
        cb.append(base, &[0x90; 64]).unwrap();
        cb.make_executable().unwrap();
        cb.truncate(16).unwrap();
        assert_eq!(cb.base(), base);
        assert_eq!(cb.space_remaining(), 64 * 1024 - 16);
    }

    #[test]
    fn test_full_buffer_reports_space() {
        let mut cb = CodeBuffer::new(4096).unwrap();
        let base = cb.base();
        let err = cb.append(base, &vec![0x90; 8192]).unwrap_err();
        assert!(matches!(err, JitError::CodeBufferFull { needed: 8192, .. }));
    }
}
