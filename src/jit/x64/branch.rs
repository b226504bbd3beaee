//! b, bc, bclr, bcctr
//!
//! LR, CTR and CR are never cached in host registers, so conditions are
//! tested directly on guest state.

use dynasm::dynasm;
use dynasmrt::{DynamicLabel, DynasmApi, DynasmLabelApi};

use crate::cpu::decode::{Inst, OpKind};

use super::runtime::{self, offsets};
use super::Jit64Backend;
use crate::jit::analyzer::{is_unconditional, CodeOp};
use crate::jit::compiler::{BlockCounters, OpChecks};
use crate::jit::regcache::FlushMode;

#[derive(Clone, Copy)]
enum Target {
    Static(u32),
    /// Computed into eax
    Eax,
}

impl Jit64Backend {
    /// Jumps that skip the taken path when the BO/BI condition fails
    fn emit_branch_condition(&mut self, inst: Inst, allow_ctr: bool) -> Vec<DynamicLabel> {
        let bo = inst.bo();
        let mut not_taken = Vec::new();
        if allow_ctr && bo & 0x04 == 0 {
            let skip = self.emit.new_label();
            dynasm!(self.emit.ops ; dec DWORD [rbp + offsets::CTR]);
            // taken when (ctr != 0) ^ BO[2]
            if bo & 0x02 != 0 {
                dynasm!(self.emit.ops ; jne =>skip);
            } else {
                dynasm!(self.emit.ops ; je =>skip);
            }
            not_taken.push(skip);
        }
        if bo & 0x10 == 0 {
            let skip = self.emit.new_label();
            let bit = (1u32 << (31 - inst.bi())) as i32;
            dynasm!(self.emit.ops ; test DWORD [rbp + offsets::CR], bit);
            // taken when the bit equals BO[3]
            if bo & 0x08 != 0 {
                dynasm!(self.emit.ops ; je =>skip);
            } else {
                dynasm!(self.emit.ops ; jne =>skip);
            }
            not_taken.push(skip);
        }
        not_taken
    }

    /// Leave the block along the taken path. Guest registers are already
    /// written back.
    fn emit_taken(&mut self, start: u32, target: Target, after: BlockCounters, idle: bool, flushed: bool) {
        self.emit_commit(after);
        match target {
            Target::Static(address) if idle && address == start => {
                dynasm!(self.emit.ops ; mov DWORD [rbp + offsets::PC], address as i32);
                if flushed {
                    self.emit_call(runtime::rt_idle, 0);
                } else {
                    self.emit_call_unchecked(runtime::rt_idle, 0);
                }
                self.emit.jmp_abs(self.routines.exit);
            }
            Target::Static(address) => self.emit_exit_to(address),
            Target::Eax => self.emit_exit_eax(),
        }
    }

    pub(super) fn emit_branch(&mut self, op: &CodeOp, checks: &OpChecks, after: BlockCounters) -> Option<DynamicLabel> {
        let inst = op.inst;
        let target = match op.kind {
            OpKind::Bclr | OpKind::Bcctr => {
                let reg = if op.kind == OpKind::Bclr { offsets::LR } else { offsets::CTR };
                let align = !3i32;
                dynasm!(self.emit.ops
                    ; mov eax, [rbp + reg]
                    ; and eax, align
                );
                Target::Eax
            }
            _ => match op.branch_target {
                Some(address) => Target::Static(address),
                None => {
                    log::error!("[JIT64] {} at {:#010x} has no static target", op.info.name, op.address);
                    self.emit_fallback(op);
                    return None;
                }
            },
        };
        if inst.lk() {
            let link = op.address.wrapping_add(4) as i32;
            dynasm!(self.emit.ops ; mov DWORD [rbp + offsets::LR], link);
        }
        let allow_ctr = op.kind != OpKind::Bcctr;
        let start = self.block_start;

        if checks.jump_in_block {
            self.flush(FlushMode::Full);
            let not_taken = self.emit_branch_condition(inst, allow_ctr);
            let taken = self.emit.new_label();
            dynasm!(self.emit.ops ; jmp =>taken);
            for label in not_taken {
                self.emit.bind(label);
            }
            return Some(taken);
        }

        if is_unconditional(op.kind, inst) {
            self.flush(FlushMode::Full);
            self.emit_taken(start, target, after, checks.idle_loop, true);
            self.terminated = true;
            return None;
        }

        let not_taken = self.emit_branch_condition(inst, allow_ctr);
        self.flush(FlushMode::MaintainState);
        self.emit_taken(start, target, after, checks.idle_loop, false);
        for label in not_taken {
            self.emit.bind(label);
        }
        None
    }
}
