//! Block assembler
//!
//! Code is assembled with `dynasm!` into a `VecAssembler` whose base address
//! is where the bytes will land in the `CodeBuffer`. Jumps to code already in
//! the buffer (routines, other blocks) go through labels defined at that
//! absolute address, so they come out as plain rel32 branches. Guest state
//! operands are always `[rbp + disp32]`; exit stubs and entry checks then
//! have a fixed size and can be patched in place.

use dynasm::dynasm;
use dynasmrt::x64::X64Relocation;
use dynasmrt::{AssemblyOffset, DynamicLabel, DynasmApi, DynasmError, DynasmLabelApi, VecAssembler};

pub type Ops = VecAssembler<X64Relocation>;

/// Host register number, as used with `Rd(..)`/`Rx(..)`
pub type Reg = u8;

pub const RAX: Reg = 0;
pub const RBX: Reg = 3;
pub const RSI: Reg = 6;
pub const RDI: Reg = 7;
pub const R8: Reg = 8;
pub const R9: Reg = 9;
pub const R10: Reg = 10;
pub const R11: Reg = 11;
pub const R12: Reg = 12;
pub const R13: Reg = 13;
pub const R14: Reg = 14;

pub const XMM0: Reg = 0;

/// Size of `mov dword [rbp+disp32], imm32` + `jmp rel32`
pub const EXIT_STUB_SIZE: usize = 15;

pub struct XEmitter {
    pub ops: Ops,
    origin: usize,
    /// First label error, reported by `finish`
    error: Option<DynasmError>,
}

impl XEmitter {
    pub fn new(origin: usize) -> Self {
        XEmitter { ops: VecAssembler::new(origin), origin, error: None }
    }

    /// Start over at a new landing address
    pub fn reset(&mut self, origin: usize) {
        *self = XEmitter::new(origin);
    }

    pub fn len(&self) -> usize {
        self.ops.offset().0
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn origin(&self) -> usize {
        self.origin
    }

    /// Absolute address of the next byte
    pub fn current_address(&self) -> usize {
        self.origin + self.len()
    }

    /// Label for a forward branch inside the block, placed with `bind`
    pub fn new_label(&mut self) -> DynamicLabel {
        self.ops.new_dynamic_label()
    }

    pub fn bind(&mut self, label: DynamicLabel) {
        dynasm!(self.ops ; =>label);
    }

    /// Label standing for code already placed at `address`
    pub fn label_at(&mut self, address: usize) -> DynamicLabel {
        let label = self.ops.new_dynamic_label();
        // relocations wrap, so addresses before `origin` resolve as well
        let offset = AssemblyOffset(address.wrapping_sub(self.origin));
        if let Err(e) = self.ops.labels_mut().define_dynamic(label, offset) {
            self.error.get_or_insert(e);
        }
        label
    }

    /// `jmp rel32` to an absolute address
    pub fn jmp_abs(&mut self, target: usize) {
        let label = self.label_at(target);
        dynasm!(self.ops ; jmp =>label);
    }

    /// `mov rax, target; call rax`
    pub fn call_abs(&mut self, target: usize) {
        dynasm!(self.ops
            ; mov rax, QWORD target as i64
            ; call rax
        );
    }

    /// `mov dword [rbp+pc_disp], target; jmp exit`, always `EXIT_STUB_SIZE` bytes
    pub fn exit_stub(&mut self, pc_disp: i32, target: u32, exit: usize) {
        dynasm!(self.ops ; mov DWORD [rbp + pc_disp], target as i32);
        self.jmp_abs(exit);
    }

    /// Pad with `int3` until the code is `len` bytes long
    pub fn pad_to(&mut self, len: usize) {
        while self.len() < len {
            dynasm!(self.ops ; int3);
        }
    }

    /// Resolve every label and hand out the assembled bytes
    pub fn finish(&mut self) -> Result<Vec<u8>, DynasmError> {
        if let Some(e) = self.error.take() {
            return Err(e);
        }
        self.ops.take()
    }
}
