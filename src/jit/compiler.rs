//! Block Compiler
//!
//! `compile` walks an analyzed `CodeBlock` and decides, per instruction,
//! which checkpoints are needed (PC sync, breakpoint, FPU availability,
//! DSI, program exception, idle loop, exits). The backend only knows how to
//! emit each of those; it never looks at the block as a whole.
//!
//! Cycle and performance-monitor counts are accumulated at compile time and
//! committed to guest state only where control leaves the block.

use crate::cpu::decode::{OpInfo, OpKind, FL_LOADSTORE, FL_PROGRAM_EXCEPTION, FL_USE_FPU};
use crate::cpu::{GuestState, Machine};
use crate::debug::BreakPoints;
use crate::hle::{HookHandle, HookKind, HookRegistry};

use super::analyzer::{is_unconditional, CodeBlock, CodeOp};
use super::block_cache::{BlockLinker, LinkExit};
use super::{JitConfig, JitError};

/// Cycles and performance-monitor events accumulated since block entry
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockCounters {
    pub cycles: u32,
    pub load_store: u32,
    pub fp: u32,
}

impl BlockCounters {
    pub fn add(&mut self, info: &OpInfo) {
        self.cycles += info.cycles;
        self.load_store += info.has(FL_LOADSTORE) as u32;
        self.fp += info.has(FL_USE_FPU) as u32;
    }

    /// `self - earlier`
    pub fn since(&self, earlier: &BlockCounters) -> BlockCounters {
        BlockCounters {
            cycles: self.cycles - earlier.cycles,
            load_store: self.load_store - earlier.load_store,
            fp: self.fp - earlier.fp,
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == BlockCounters::default()
    }

    /// Charge these counts to the guest
    #[inline(always)]
    pub fn commit(&self, state: &mut GuestState) {
        state.charge(self.cycles, self.load_store, self.fp);
    }

    /// Take back counts that a later `commit` will charge again
    #[inline(always)]
    pub fn uncommit(&self, state: &mut GuestState) {
        state.downcount = state.downcount.wrapping_add(self.cycles as i32);
        state.perf.cycles = state.perf.cycles.wrapping_sub(self.cycles);
        state.perf.load_store = state.perf.load_store.wrapping_sub(self.load_store);
        state.perf.fp = state.perf.fp.wrapping_sub(self.fp);
    }
}

/// Counters before and after the instruction being emitted. Aborting on a
/// breakpoint commits `before`; everything else commits `after`.
#[derive(Clone, Copy, Debug, Default)]
pub struct OpCounters {
    pub before: BlockCounters,
    pub after: BlockCounters,
}

/// Checkpoints required around one instruction
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OpChecks {
    /// Write pc/npc before the instruction
    pub sync_pc: bool,
    pub breakpoint: bool,
    /// First FPU instruction on this path
    pub check_fpu: bool,
    /// Last instruction; the block exits after it
    pub endblock: bool,
    /// Check for DSI after the instruction
    pub memcheck: bool,
    pub check_program_exception: bool,
    /// Taken branch back to the block start idles the scheduler
    pub idle_loop: bool,
    /// Conditional branch: leave the block through `npc` when taken
    pub exit_if_taken: bool,
    /// Forward branch to an instruction later in this block
    pub jump_in_block: bool,
}

/// How the block leaves after its last instruction
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockExit {
    /// The last instruction branched unconditionally; continue at its
    /// target (guest `npc` when not statically known)
    Branched,
    /// Continue at a fixed address
    Constant(u32),
    /// Continue at guest `npc`
    Dynamic,
}

/// A pending in-block jump, resolved when its target is reached
pub struct InBlockJump<F> {
    pub fixup: F,
    /// Counters on the jumping path
    pub counters: BlockCounters,
}

/// Code generator interface used by `compile`.
///
/// Emission methods cannot fail: backends record overflow internally and
/// report it from `end_block`, which must leave no trace of the block.
pub trait BlockBackend {
    /// Handle stored in the block cache
    type Code;
    /// Unresolved in-block jump
    type Fixup;

    fn name(&self) -> &'static str;

    /// Code patching used by the block cache
    fn linker(&mut self) -> &mut dyn BlockLinker<Self::Code>;

    /// Bytes left for new blocks
    fn space_remaining(&self) -> usize;

    /// Drop all generated code (the block cache is cleared alongside)
    fn clear_code(&mut self);

    fn begin_block(&mut self, block: &CodeBlock) -> Result<(), JitError>;

    /// Call a hook at `op`; a `Replace` hook also leaves the block
    fn emit_hle(&mut self, op: &CodeOp, hook: HookHandle, counters: OpCounters);

    /// Emit one instruction with its checkpoints. A jump inside the block
    /// returns its fixup.
    fn emit_op(&mut self, op: &CodeOp, checks: &OpChecks, counters: OpCounters) -> Option<Self::Fixup>;

    /// `target` is reached: resolve the jumps into it. The fallthrough path
    /// arrives with `counters`; each jump must be compensated so both paths
    /// continue with the same uncommitted count.
    fn bind_in_block(&mut self, target: u32, jumps: Vec<InBlockJump<Self::Fixup>>, counters: BlockCounters);

    /// Turn a jump whose target was never compiled into an exit
    fn emit_dangling(&mut self, target: u32, jump: InBlockJump<Self::Fixup>);

    fn emit_exit(&mut self, exit: BlockExit, counters: BlockCounters);

    /// Finish the block; returns its handle and linkable exits
    fn end_block(&mut self) -> Result<(Self::Code, Vec<LinkExit>), JitError>;

    /// Run a block until it (or a linked successor) exits
    fn execute(&mut self, code: &Self::Code, m: &mut Machine<'_>) -> Result<(), JitError>;
}

/// Compile-time context
pub struct CompileEnv<'a> {
    pub config: &'a JitConfig,
    pub breakpoints: &'a BreakPoints,
    pub hooks: &'a HookRegistry,
}

/// How the block leaves after its last op
fn final_exit(block: &CodeBlock, last: Option<&CodeOp>) -> BlockExit {
    match last {
        Some(op) if op.ends_block && op.is_branch() => {
            if is_unconditional(op.kind, op.inst) {
                BlockExit::Branched
            } else {
                BlockExit::Constant(op.address.wrapping_add(4))
            }
        }
        Some(op) if op.ends_block => BlockExit::Dynamic,
        _ => BlockExit::Constant(block.next_pc),
    }
}

/// Translate `block` with `backend`. On error the backend has discarded
/// everything emitted for it.
pub fn compile<B: BlockBackend>(
    backend: &mut B,
    block: &CodeBlock,
    env: &CompileEnv<'_>,
) -> Result<(B::Code, Vec<LinkExit>), JitError> {
    backend.begin_block(block)?;

    let mut counters = BlockCounters::default();
    let mut fp_checked = false;
    let mut pending: Vec<(u32, InBlockJump<B::Fixup>, bool)> = Vec::new();
    let mut last_emitted: Option<&CodeOp> = None;
    let mut replaced = false;

    for op in &block.ops {
        if pending.iter().any(|(target, _, _)| *target == op.address) {
            let mut joins = Vec::new();
            let mut rest = Vec::new();
            for entry in pending.drain(..) {
                if entry.0 == op.address {
                    joins.push(entry);
                } else {
                    rest.push(entry);
                }
            }
            pending = rest;
            fp_checked = fp_checked && joins.iter().all(|(_, _, checked)| *checked);
            let jumps = joins.into_iter().map(|(_, jump, _)| jump).collect();
            backend.bind_in_block(op.address, jumps, counters);
        }

        let before = counters;
        counters.add(&op.info);
        let op_counters = OpCounters { before, after: counters };
        last_emitted = Some(op);

        if let Some(hook) = env.hooks.try_replace(op.address) {
            backend.emit_hle(op, hook, op_counters);
            if hook.kind == HookKind::Replace {
                replaced = true;
                break;
            }
        }

        let checks = op_checks(op, env, fp_checked);
        fp_checked |= checks.check_fpu;

        if let Some(fixup) = backend.emit_op(op, &checks, op_counters) {
            if let Some(target) = op.branch_target {
                pending.push((target, InBlockJump { fixup, counters }, fp_checked));
            }
        }

        if op.ends_block {
            break;
        }
    }

    if !replaced {
        backend.emit_exit(final_exit(block, last_emitted), counters);
    }
    for (target, jump, _) in pending {
        backend.emit_dangling(target, jump);
    }

    backend.end_block()
}

fn op_checks(op: &CodeOp, env: &CompileEnv<'_>, fp_checked: bool) -> OpChecks {
    let config = env.config;
    let breakpoint = config.enable_debugging && env.breakpoints.is_address_breakpoint(op.address);
    let check_fpu = op.info.has(FL_USE_FPU) && !fp_checked;
    let endblock = op.ends_block;
    let memcheck = config.memcheck && op.info.has(FL_LOADSTORE);
    let check_program_exception = op.info.has(FL_PROGRAM_EXCEPTION);
    let branch = op.is_branch() || op.kind == OpKind::Sc;
    OpChecks {
        sync_pc: breakpoint || check_fpu || endblock || memcheck || check_program_exception || branch,
        breakpoint,
        check_fpu,
        endblock,
        memcheck,
        check_program_exception,
        idle_loop: config.idle_skip && op.branch_is_idle_loop,
        exit_if_taken: op.conditional_exit || (endblock && op.is_branch() && !is_unconditional(op.kind, op.inst)),
        jump_in_block: op.jump_in_block,
    }
}
