//! Cached interpreter backend
//!
//! Blocks become short lists of `Op`s stored in one flat vector. Each
//! instruction still goes through `interpreter::execute`; what is cached
//! is the decode and every decision the compiler made about checkpoints,
//! so the loop below does no per-instruction bookkeeping beyond them.

use std::mem::size_of;

use crate::cpu::decode::{Inst, OpKind};
use crate::cpu::exception;
use crate::cpu::interpreter;
use crate::cpu::{Machine, EXCEPTION_DSI, EXCEPTION_FPU_UNAVAILABLE, EXCEPTION_PROGRAM, MSR_FP};
use crate::hle::{HookHandle, HookKind};

use super::analyzer::{CodeBlock, CodeOp};
use super::block_cache::{BlockLinker, JitBlock, LinkExit};
use super::compiler::{BlockBackend, BlockCounters, BlockExit, InBlockJump, OpChecks, OpCounters};
use super::JitError;

#[derive(Clone, Copy, Debug, PartialEq)]
enum Op {
    /// pc = `pc`, npc = `pc + 4`
    SyncPc { pc: u32 },
    CheckBreakpoint { before: BlockCounters },
    CheckFpu { after: BlockCounters },
    Interpret { inst: Inst, kind: OpKind },
    CheckDsi { after: BlockCounters },
    CheckProgram { after: BlockCounters },
    /// Taken branch back to `start`: give the rest of the slice away
    CheckIdle { start: u32, after: BlockCounters },
    ExitIfTaken { after: BlockCounters },
    /// Continue at op `to` (relative to the block) when the branch to
    /// `target` was taken, after taking back `comp`
    BranchInBlock { target: u32, to: u32, comp: BlockCounters },
    Hle { index: u32, replace: bool, after: BlockCounters },
    /// pc = npc
    EndBlock { after: BlockCounters },
    /// pc = `target`
    Exit { target: u32, after: BlockCounters },
    /// Left behind by a destroyed block
    Poison,
}

/// A block's slice of the op storage
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CachedBlock {
    offset: usize,
    len: usize,
}

pub struct CachedInterpBackend {
    ops: Vec<Op>,
    capacity: usize,
    /// Ops of the block being compiled
    staging: Vec<Op>,
    block_start: u32,
}

impl CachedInterpBackend {
    /// `buffer_size` bytes of op storage
    pub fn new(buffer_size: usize) -> Self {
        let capacity = (buffer_size / size_of::<Op>()).max(1);
        CachedInterpBackend { ops: Vec::with_capacity(capacity), capacity, staging: Vec::with_capacity(256), block_start: 0 }
    }

    /// Ops in use across all blocks
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

impl BlockLinker<CachedBlock> for CachedInterpBackend {
    // Every block returns to the dispatcher; there is nothing to patch.
    fn write_link(&mut self, _exit: &LinkExit, _dest: Option<&CachedBlock>) -> Result<(), JitError> {
        Ok(())
    }

    fn write_destroy(&mut self, block: &JitBlock<CachedBlock>) -> Result<(), JitError> {
        let CachedBlock { offset, len } = block.code;
        if let Some(ops) = self.ops.get_mut(offset..offset + len) {
            ops.fill(Op::Poison);
        }
        Ok(())
    }
}

impl BlockBackend for CachedInterpBackend {
    type Code = CachedBlock;
    type Fixup = usize;

    fn name(&self) -> &'static str {
        "cached interpreter"
    }

    fn linker(&mut self) -> &mut dyn BlockLinker<CachedBlock> {
        self
    }

    fn space_remaining(&self) -> usize {
        (self.capacity - self.ops.len()) * size_of::<Op>()
    }

    fn clear_code(&mut self) {
        self.ops.clear();
    }

    fn begin_block(&mut self, block: &CodeBlock) -> Result<(), JitError> {
        self.staging.clear();
        self.block_start = block.start;
        Ok(())
    }

    fn emit_hle(&mut self, op: &CodeOp, hook: HookHandle, counters: OpCounters) {
        self.staging.push(Op::SyncPc { pc: op.address });
        self.staging.push(Op::Hle { index: hook.index, replace: hook.kind == HookKind::Replace, after: counters.after });
    }

    fn emit_op(&mut self, op: &CodeOp, checks: &OpChecks, counters: OpCounters) -> Option<usize> {
        let OpCounters { before, after } = counters;
        if checks.sync_pc {
            self.staging.push(Op::SyncPc { pc: op.address });
        }
        if checks.breakpoint {
            self.staging.push(Op::CheckBreakpoint { before });
        }
        if checks.check_fpu {
            self.staging.push(Op::CheckFpu { after });
        }
        self.staging.push(Op::Interpret { inst: op.inst, kind: op.kind });
        if checks.memcheck {
            self.staging.push(Op::CheckDsi { after });
        }
        if checks.check_program_exception {
            self.staging.push(Op::CheckProgram { after });
        }
        if checks.idle_loop {
            self.staging.push(Op::CheckIdle { start: self.block_start, after });
        }
        if checks.exit_if_taken {
            self.staging.push(Op::ExitIfTaken { after });
        }
        match (checks.jump_in_block, op.branch_target) {
            (true, Some(target)) => {
                self.staging.push(Op::BranchInBlock { target, to: 0, comp: BlockCounters::default() });
                Some(self.staging.len() - 1)
            }
            _ => None,
        }
    }

    fn bind_in_block(&mut self, _target: u32, jumps: Vec<InBlockJump<usize>>, counters: BlockCounters) {
        let to = self.staging.len() as u32;
        for jump in jumps {
            if let Some(Op::BranchInBlock { to: slot, comp, .. }) = self.staging.get_mut(jump.fixup) {
                *slot = to;
                *comp = counters.since(&jump.counters);
            }
        }
    }

    fn emit_dangling(&mut self, target: u32, jump: InBlockJump<usize>) {
        let to = self.staging.len() as u32;
        self.staging.push(Op::Exit { target, after: jump.counters });
        if let Some(Op::BranchInBlock { to: slot, .. }) = self.staging.get_mut(jump.fixup) {
            *slot = to;
        }
    }

    fn emit_exit(&mut self, exit: BlockExit, counters: BlockCounters) {
        let op = match exit {
            BlockExit::Branched | BlockExit::Dynamic => Op::EndBlock { after: counters },
            BlockExit::Constant(target) => Op::Exit { target, after: counters },
        };
        self.staging.push(op);
    }

    fn end_block(&mut self) -> Result<(CachedBlock, Vec<LinkExit>), JitError> {
        let needed = self.staging.len();
        let available = self.capacity - self.ops.len();
        if needed > available {
            self.staging.clear();
            return Err(JitError::CodeBufferFull { needed: needed * size_of::<Op>(), available: available * size_of::<Op>() });
        }
        let offset = self.ops.len();
        self.ops.extend_from_slice(&self.staging);
        self.staging.clear();
        Ok((CachedBlock { offset, len: needed }, Vec::new()))
    }

    fn execute(&mut self, code: &CachedBlock, m: &mut Machine<'_>) -> Result<(), JitError> {
        let base = code.offset;
        let mut i = base;
        loop {
            let Some(&op) = self.ops.get(i) else {
                log::error!("[CachedInterp] ran off the end of the block at {:#010x}", m.state.pc);
                return Ok(());
            };
            i += 1;
            match op {
                Op::SyncPc { pc } => {
                    m.state.pc = pc;
                    m.state.npc = pc.wrapping_add(4);
                }
                Op::CheckBreakpoint { before } => {
                    if m.check_breakpoint() {
                        before.commit(m.state);
                        return Ok(());
                    }
                }
                Op::CheckFpu { after } => {
                    if m.state.msr & MSR_FP == 0 {
                        after.commit(m.state);
                        m.state.exceptions |= EXCEPTION_FPU_UNAVAILABLE;
                        exception::check_exceptions(m.state);
                        return Ok(());
                    }
                }
                Op::Interpret { inst, kind } => interpreter::execute(m, inst, kind),
                Op::CheckDsi { after } => {
                    if m.state.exceptions & EXCEPTION_DSI != 0 {
                        after.commit(m.state);
                        exception::check_exceptions(m.state);
                        return Ok(());
                    }
                }
                Op::CheckProgram { after } => {
                    if m.state.exceptions & EXCEPTION_PROGRAM != 0 {
                        after.commit(m.state);
                        exception::check_exceptions(m.state);
                        return Ok(());
                    }
                }
                Op::CheckIdle { start, after } => {
                    if m.state.npc == start {
                        after.commit(m.state);
                        m.state.pc = start;
                        m.timing.idle(m.state);
                        return Ok(());
                    }
                }
                Op::ExitIfTaken { after } => {
                    if m.state.npc != m.state.pc.wrapping_add(4) {
                        after.commit(m.state);
                        m.state.pc = m.state.npc;
                        return Ok(());
                    }
                }
                Op::BranchInBlock { target, to, comp } => {
                    if m.state.npc == target {
                        comp.uncommit(m.state);
                        i = base + to as usize;
                    }
                }
                Op::Hle { index, replace, after } => {
                    m.hooks.execute(index, m.state, m.bus);
                    if replace {
                        after.commit(m.state);
                        m.state.pc = m.state.npc;
                        return Ok(());
                    }
                }
                Op::EndBlock { after } => {
                    after.commit(m.state);
                    m.state.pc = m.state.npc;
                    return Ok(());
                }
                Op::Exit { target, after } => {
                    after.commit(m.state);
                    m.state.pc = target;
                    return Ok(());
                }
                Op::Poison => return Ok(()),
            }
        }
    }
}
