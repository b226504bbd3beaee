//! Block analysis
//!
//! Decodes guest instructions from a start address into a `CodeBlock`
//! without touching guest state or emitting code. The result tells the
//! compiler where the block ends, which instruction first needs the FPU,
//! which conditional branches can stay inside the block, and whether the
//! block is a busy-wait loop.

use std::collections::BTreeSet;

use crate::cpu::decode::{self, Inst, OpInfo, OpKind, FL_BRANCH, FL_ENDBLOCK, FL_LOADSTORE, FL_USE_FPU};
use crate::memory::{AccessKind, Bus};

use super::JitConfig;

/// Size of the physical granule blocks are tracked by for invalidation
pub const CACHE_LINE: u32 = 32;

/// One analyzed guest instruction
#[derive(Clone, Debug)]
pub struct CodeOp {
    pub address: u32,
    pub inst: Inst,
    pub kind: OpKind,
    pub info: OpInfo,
    /// First instruction in the block that needs MSR[FP]
    pub first_fp_in_block: bool,
    /// Last instruction of a block that ends on its own
    pub ends_block: bool,
    /// Conditional branch in the middle of the block: exits only when taken
    pub conditional_exit: bool,
    /// Statically known branch target (b, bc)
    pub branch_target: Option<u32>,
    /// Forward conditional branch whose target is compiled in this block
    pub jump_in_block: bool,
    /// Taken branch back to the start of a busy-wait loop
    pub branch_is_idle_loop: bool,
}

impl CodeOp {
    pub fn is_branch(&self) -> bool {
        self.info.has(FL_BRANCH)
    }
}

/// Output of `Analyzer::analyze`, reused across compilations
#[derive(Clone, Debug, Default)]
pub struct CodeBlock {
    pub start: u32,
    pub msr: u32,
    pub ops: Vec<CodeOp>,
    /// Fallthrough address after the last instruction
    pub next_pc: u32,
    /// Analysis stopped early (decode failure, fetch fault mid-block, size cap)
    pub broken: bool,
    /// The very first fetch failed; nothing to compile
    pub memory_exception: bool,
    /// 32-byte physical lines the block was decoded from
    pub physical_addresses: BTreeSet<u32>,
    pub uses_fp: bool,
    pub num_load_store: u32,
    pub is_idle_loop: bool,
    pub has_in_block_jumps: bool,
}

impl CodeBlock {
    fn reset(&mut self, start: u32, msr: u32) {
        self.start = start;
        self.msr = msr;
        self.ops.clear();
        self.next_pc = start;
        self.broken = false;
        self.memory_exception = false;
        self.physical_addresses.clear();
        self.uses_fp = false;
        self.num_load_store = 0;
        self.is_idle_loop = false;
        self.has_in_block_jumps = false;
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Whether a branch is taken regardless of CR and CTR
pub fn is_unconditional(kind: OpKind, inst: Inst) -> bool {
    match kind {
        OpKind::B => true,
        OpKind::Bc | OpKind::Bclr | OpKind::Bcctr => inst.bo() & 0x14 == 0x14,
        _ => false,
    }
}

/// Static target of b/bc at `address`
pub fn static_target(kind: OpKind, inst: Inst, address: u32) -> Option<u32> {
    let offset = match kind {
        OpKind::B => inst.li(),
        OpKind::Bc => inst.bd(),
        _ => return None,
    };
    Some(if inst.aa() { offset as u32 } else { address.wrapping_add(offset as u32) })
}

pub struct Analyzer {
    max_block_size: usize,
    conditional_continue: bool,
}

impl Analyzer {
    pub fn new(config: &JitConfig) -> Self {
        Analyzer { max_block_size: config.max_block_size.max(1) as usize, conditional_continue: config.conditional_continue }
    }

    /// Decode the block starting at effective address `address` under `msr`.
    /// Returns the fallthrough address (the faulting address when the first
    /// fetch fails).
    pub fn analyze(&self, address: u32, msr: u32, bus: &mut dyn Bus, block: &mut CodeBlock) -> u32 {
        block.reset(address, msr);
        let mut pc = address;
        let mut first_fp_found = false;

        loop {
            if block.ops.len() >= self.max_block_size {
                block.broken = true;
                break;
            }

            let paddr = match bus.translate(pc, AccessKind::Fetch, msr) {
                Ok(paddr) => paddr,
                Err(fault) => {
                    if block.ops.is_empty() {
                        block.memory_exception = true;
                    } else {
                        log::debug!("[Analyzer] {} ends block at {:#010x}", fault, pc);
                        block.broken = true;
                    }
                    break;
                }
            };
            let inst = Inst(bus.read32(paddr));
            let kind = match decode::decode(inst.0) {
                Some(kind) => kind,
                None if block.ops.is_empty() => {
                    log::debug!("[Analyzer] undefined instruction {:#010x} at {:#010x}", inst.0, pc);
                    OpKind::Invalid
                }
                None => {
                    log::debug!("[Analyzer] undefined instruction {:#010x} at {:#010x}, block broken", inst.0, pc);
                    block.broken = true;
                    break;
                }
            };
            block.physical_addresses.insert(paddr & !(CACHE_LINE - 1));

            let info = kind.info();
            let first_fp_in_block = info.has(FL_USE_FPU) && !first_fp_found;
            first_fp_found |= info.has(FL_USE_FPU);
            block.uses_fp |= info.has(FL_USE_FPU);
            block.num_load_store += info.has(FL_LOADSTORE) as u32;

            let mut op = CodeOp {
                address: pc,
                inst,
                kind,
                info,
                first_fp_in_block,
                ends_block: false,
                conditional_exit: false,
                branch_target: static_target(kind, inst, pc),
                jump_in_block: false,
                branch_is_idle_loop: false,
            };

            pc = pc.wrapping_add(4);
            if info.has(FL_ENDBLOCK) {
                if self.conditional_continue && op.is_branch() && !is_unconditional(kind, inst) {
                    op.conditional_exit = true;
                } else {
                    op.ends_block = true;
                }
            }
            let ends = op.ends_block;
            block.ops.push(op);
            if ends {
                break;
            }
        }

        block.next_pc = pc;
        if !block.memory_exception {
            self.find_in_block_jumps(block);
            self.detect_idle_loop(block);
        }
        pc
    }

    /// Forward conditional branches to an address compiled in this block
    /// become in-block jumps.
    fn find_in_block_jumps(&self, block: &mut CodeBlock) {
        let Some(last) = block.ops.last().map(|op| op.address) else {
            return;
        };
        let start = block.start;
        for i in 0..block.ops.len() {
            let op = &block.ops[i];
            if !op.conditional_exit || op.kind != OpKind::Bc || op.inst.lk() {
                continue;
            }
            let Some(target) = op.branch_target else {
                continue;
            };
            if target <= op.address || target > last || (target.wrapping_sub(start)) % 4 != 0 {
                continue;
            }
            let op = &mut block.ops[i];
            op.jump_in_block = true;
            op.conditional_exit = false;
            block.has_in_block_jumps = true;
        }
    }

    /// A busy-wait loop polls memory and branches back to its own start.
    /// Everything before the first branch must be a load, compare or
    /// immediate logical op that does not overwrite a register it or an
    /// earlier op in the iteration read.
    fn detect_idle_loop(&self, block: &mut CodeBlock) {
        if block.has_in_block_jumps {
            return;
        }
        let mut read: u32 = 0;
        for i in 0..block.ops.len() {
            let op = &block.ops[i];
            let inst = op.inst;
            if op.is_branch() {
                let ctr_untouched = op.kind == OpKind::B || inst.bo() & 0x04 != 0;
                let qualifies = matches!(op.kind, OpKind::B | OpKind::Bc)
                    && !inst.lk()
                    && ctr_untouched
                    && op.branch_target == Some(block.start);
                if qualifies {
                    block.ops[i].branch_is_idle_loop = true;
                    block.is_idle_loop = true;
                }
                return;
            }

            let gpr = |r: usize| 1u32 << r;
            let (reads, writes) = match op.kind {
                OpKind::Lwz | OpKind::Lbz | OpKind::Lhz | OpKind::Lha => {
                    (if inst.ra() == 0 { 0 } else { gpr(inst.ra()) }, gpr(inst.rd()))
                }
                OpKind::Lwzx | OpKind::Lbzx | OpKind::Lhzx | OpKind::Lhax => {
                    (if inst.ra() == 0 { 0 } else { gpr(inst.ra()) } | gpr(inst.rb()), gpr(inst.rd()))
                }
                OpKind::Cmpi | OpKind::Cmpli => (gpr(inst.ra()), 0),
                OpKind::Cmp | OpKind::Cmpl => (gpr(inst.ra()) | gpr(inst.rb()), 0),
                OpKind::Ori
                | OpKind::Oris
                | OpKind::Xori
                | OpKind::Xoris
                | OpKind::Andi
                | OpKind::Andis
                | OpKind::Rlwinm => (gpr(inst.rs()), gpr(inst.ra())),
                _ => return,
            };
            read |= reads;
            if writes & read != 0 {
                return;
            }
        }
    }
}
