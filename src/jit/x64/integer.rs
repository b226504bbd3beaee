//! Integer arithmetic, logical, rotate and compare instructions
//!
//! Results are computed in eax and then moved into the destination's host
//! register, so a destination aliasing a source needs no special casing.

use dynasm::dynasm;
use dynasmrt::DynasmApi;

use crate::cpu::decode::{rotation_mask, OpKind};
use crate::cpu::{CR_EQ, CR_GT, CR_LT, SPR_LR};

use super::emitter::{Reg, XEmitter};
use super::runtime::offsets;
use super::Jit64Backend;
use crate::jit::analyzer::CodeOp;
use crate::jit::regcache::BindMode;

impl Jit64Backend {
    /// Store eax to guest `d`, then update cr0 from it when recording
    fn write_result(&mut self, d: usize, record: bool) {
        let host = self.bind_gpr(d, BindMode::Write);
        dynasm!(self.emit.ops ; mov Rd(host), eax);
        if record {
            dynasm!(self.emit.ops ; test eax, eax);
            self.emit_set_cr_field(0, true);
        }
    }

    /// cr[field] = LT/GT/EQ from the flags of the last compare, plus XER[SO]
    fn emit_set_cr_field(&mut self, field: u32, signed: bool) {
        dynasm!(self.emit.ops
            ; mov ecx, CR_EQ as i32
            ; mov edx, CR_LT as i32
        );
        if signed {
            dynasm!(self.emit.ops ; cmovl ecx, edx);
        } else {
            dynasm!(self.emit.ops ; cmovb ecx, edx);
        }
        dynasm!(self.emit.ops ; mov edx, CR_GT as i32);
        if signed {
            dynasm!(self.emit.ops ; cmovg ecx, edx);
        } else {
            dynasm!(self.emit.ops ; cmova ecx, edx);
        }

        let shift = 28 - 4 * field;
        let keep = !(0xFu32 << shift) as i32;
        dynasm!(self.emit.ops
            ; mov edx, [rbp + offsets::XER]
            ; shr edx, 31
            ; or ecx, edx
            ; and DWORD [rbp + offsets::CR], keep
        );
        if shift != 0 {
            let shift = shift as i8;
            dynasm!(self.emit.ops ; shl ecx, shift);
        }
        dynasm!(self.emit.ops ; or [rbp + offsets::CR], ecx);
    }

    fn emit_unary(&mut self, d: usize, s: usize, record: bool, body: impl FnOnce(&mut XEmitter, Reg)) {
        let hs = self.read_gpr(s);
        body(&mut self.emit, hs);
        self.write_result(d, record);
    }

    fn emit_binary(&mut self, d: usize, a: usize, b: usize, record: bool, body: impl FnOnce(&mut XEmitter, Reg, Reg)) {
        let ha = self.read_gpr(a);
        let hb = self.read_gpr(b);
        body(&mut self.emit, ha, hb);
        self.write_result(d, record);
    }

    pub(super) fn emit_integer(&mut self, op: &CodeOp) {
        use OpKind::*;
        let inst = op.inst;
        let record = op.kind.records(inst);
        let (rd, ra, rb, rs) = (inst.rd(), inst.ra(), inst.rb(), inst.rs());

        match op.kind {
            Addi | Addis => {
                let imm = if op.kind == Addis { inst.simm() << 16 } else { inst.simm() };
                if ra == 0 {
                    dynasm!(self.emit.ops ; mov eax, imm);
                } else {
                    let ha = self.read_gpr(ra);
                    dynasm!(self.emit.ops
                        ; mov eax, Rd(ha)
                        ; add eax, imm
                    );
                }
                self.write_result(rd, false);
            }
            Add => self.emit_binary(rd, ra, rb, record, |e, a, b| {
                dynasm!(e.ops
                    ; mov eax, Rd(a)
                    ; add eax, Rd(b)
                );
            }),
            Subf => self.emit_binary(rd, ra, rb, record, |e, a, b| {
                dynasm!(e.ops
                    ; mov eax, Rd(b)
                    ; sub eax, Rd(a)
                );
            }),
            Mullw => self.emit_binary(rd, ra, rb, record, |e, a, b| {
                dynasm!(e.ops
                    ; mov eax, Rd(a)
                    ; imul eax, Rd(b)
                );
            }),
            Neg => self.emit_unary(rd, ra, record, |e, a| {
                dynasm!(e.ops
                    ; mov eax, Rd(a)
                    ; neg eax
                );
            }),

            And => self.emit_binary(ra, rs, rb, record, |e, s, b| {
                dynasm!(e.ops
                    ; mov eax, Rd(s)
                    ; and eax, Rd(b)
                );
            }),
            Or => self.emit_binary(ra, rs, rb, record, |e, s, b| {
                dynasm!(e.ops
                    ; mov eax, Rd(s)
                    ; or eax, Rd(b)
                );
            }),
            Xor => self.emit_binary(ra, rs, rb, record, |e, s, b| {
                dynasm!(e.ops
                    ; mov eax, Rd(s)
                    ; xor eax, Rd(b)
                );
            }),
            Nor => self.emit_binary(ra, rs, rb, record, |e, s, b| {
                dynasm!(e.ops
                    ; mov eax, Rd(s)
                    ; or eax, Rd(b)
                    ; not eax
                );
            }),
            Andc => self.emit_binary(ra, rs, rb, record, |e, s, b| {
                dynasm!(e.ops
                    ; mov eax, Rd(b)
                    ; not eax
                    ; and eax, Rd(s)
                );
            }),
            Andi | Andis | Ori | Oris | Xori | Xoris => {
                let imm = if matches!(op.kind, Andis | Oris | Xoris) { inst.uimm() << 16 } else { inst.uimm() };
                let imm = imm as i32;
                let kind = op.kind;
                // only the and forms record
                let record = matches!(kind, Andi | Andis);
                self.emit_unary(ra, rs, record, |e, s| {
                    dynasm!(e.ops ; mov eax, Rd(s));
                    match kind {
                        Andi | Andis => {
                            dynasm!(e.ops ; and eax, imm);
                        }
                        Ori | Oris => {
                            dynasm!(e.ops ; or eax, imm);
                        }
                        _ => {
                            dynasm!(e.ops ; xor eax, imm);
                        }
                    }
                });
            }
            Extsb => self.emit_unary(ra, rs, record, |e, s| {
                dynasm!(e.ops
                    ; mov eax, Rd(s)
                    ; movsx eax, al
                );
            }),
            Extsh => self.emit_unary(ra, rs, record, |e, s| {
                dynasm!(e.ops
                    ; mov eax, Rd(s)
                    ; movsx eax, ax
                );
            }),
            Rlwinm => {
                let (sh, mask) = (inst.sh() as i8, rotation_mask(inst.mb(), inst.me()) as i32);
                self.emit_unary(ra, rs, record, |e, s| {
                    dynasm!(e.ops ; mov eax, Rd(s));
                    if sh != 0 {
                        dynasm!(e.ops ; rol eax, sh);
                    }
                    dynasm!(e.ops ; and eax, mask);
                });
            }

            Cmp | Cmpl => {
                let ha = self.read_gpr(ra);
                let hb = self.read_gpr(rb);
                dynasm!(self.emit.ops ; cmp Rd(ha), Rd(hb));
                self.emit_set_cr_field(inst.crfd(), op.kind == Cmp);
            }
            Cmpi | Cmpli => {
                let imm = if op.kind == Cmpi { inst.simm() } else { inst.uimm() as i32 };
                let ha = self.read_gpr(ra);
                dynasm!(self.emit.ops ; cmp Rd(ha), imm);
                self.emit_set_cr_field(inst.crfd(), op.kind == Cmpi);
            }

            Mfspr => {
                let spr = if inst.spr() == SPR_LR { offsets::LR } else { offsets::CTR };
                let host = self.bind_gpr(rd, BindMode::Write);
                dynasm!(self.emit.ops ; mov Rd(host), [rbp + spr]);
            }
            Mtspr => {
                let spr = if inst.spr() == SPR_LR { offsets::LR } else { offsets::CTR };
                let host = self.read_gpr(rs);
                dynasm!(self.emit.ops ; mov [rbp + spr], Rd(host));
            }
            _ => {
                log::error!("[JIT64] no native translation for {} at {:#010x}", op.info.name, op.address);
                self.emit_fallback(op);
            }
        }
        self.gpr.unlock_all();
    }
}
