//! Double-precision arithmetic and fmr. Record forms and single-precision
//! variants go through the interpreter.

use dynasm::dynasm;
use dynasmrt::DynasmApi;

use crate::cpu::decode::OpKind;

use super::Jit64Backend;
use crate::jit::analyzer::CodeOp;
use crate::jit::regcache::BindMode;

impl Jit64Backend {
    pub(super) fn emit_float(&mut self, op: &CodeOp) {
        let inst = op.inst;
        let (rd, ra, rb) = (inst.rd(), inst.ra(), inst.rb());
        match op.kind {
            OpKind::Fadd | OpKind::Fsub | OpKind::Fmul | OpKind::Fdiv => {
                let b = if op.kind == OpKind::Fmul { inst.rc_reg() } else { rb };
                let xa = self.read_fpr(ra);
                let xb = self.read_fpr(b);
                dynasm!(self.emit.ops ; movapd xmm0, Rx(xa));
                match op.kind {
                    OpKind::Fadd => {
                        dynasm!(self.emit.ops ; addsd xmm0, Rx(xb));
                    }
                    OpKind::Fsub => {
                        dynasm!(self.emit.ops ; subsd xmm0, Rx(xb));
                    }
                    OpKind::Fmul => {
                        dynasm!(self.emit.ops ; mulsd xmm0, Rx(xb));
                    }
                    _ => {
                        dynasm!(self.emit.ops ; divsd xmm0, Rx(xb));
                    }
                }
                let xd = self.bind_fpr(rd, BindMode::Write);
                dynasm!(self.emit.ops ; movapd Rx(xd), xmm0);
            }
            OpKind::Fmr => {
                let xb = self.read_fpr(rb);
                let xd = self.bind_fpr(rd, BindMode::Write);
                if xd != xb {
                    dynasm!(self.emit.ops ; movapd Rx(xd), Rx(xb));
                }
            }
            _ => {
                log::error!("[JIT64] no native translation for {} at {:#010x}", op.info.name, op.address);
                self.emit_fallback(op);
            }
        }
        self.fpr.unlock_all();
    }
}
