//! x86-64 backend
//!
//! Blocks are emitted into one `CodeBuffer`. Layout of a block:
//!
//! ```text
//! checked entry:  cmp dword [rbp+downcount], 0
//!                 jg  normal entry
//!                 mov dword [rbp+pc], start
//!                 jmp exit
//! normal entry:   body ...
//!                 exit stubs (mov dword [rbp+pc], target; jmp exit)
//! ```
//!
//! The dispatcher enters at the normal entry. Linked exits are rewritten to
//! `jmp` to the destination's checked entry, so chains of linked blocks
//! still return once the slice is used up.
//!
//! Only a core set of integer, branch and double-precision instructions is
//! translated; everything else calls back into the interpreter.

mod branch;
pub mod code_buffer;
pub mod emitter;
mod float;
mod integer;
pub mod runtime;

use std::ffi::c_void;

use dynasm::dynasm;
use dynasmrt::{DynamicLabel, DynasmApi, DynasmLabelApi};

use crate::cpu::decode::{OpKind, FL_USE_FPU};
use crate::cpu::{GuestState, Machine, EXCEPTION_DSI, EXCEPTION_FPU_UNAVAILABLE, EXCEPTION_PROGRAM, MSR_FP, SPR_CTR, SPR_LR};
use crate::hle::{HookHandle, HookKind};

use super::analyzer::{CodeBlock, CodeOp};
use super::block_cache::{BlockLinker, JitBlock, LinkExit};
use super::compiler::{BlockBackend, BlockCounters, BlockExit, InBlockJump, OpChecks, OpCounters};
use super::regcache::{BindMode, FlushMode, HostReg, RegCache, RegSpiller};
use super::JitError;

use code_buffer::CodeBuffer;
use emitter::{Reg, XEmitter, EXIT_STUB_SIZE, R10, R11, R12, R13, R14, R8, R9, RAX, RBX, RDI, RSI, XMM0};
use runtime::{callback_address, offsets, AsmRoutines, Callback, EnterFn};

const GPR_POOL: [HostReg; 10] = [RBX, RSI, RDI, R8, R9, R10, R11, R12, R13, R14];
const FPR_POOL: [HostReg; 14] = [2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15];

/// Size of the checked entry sequence
const NORMAL_ENTRY: usize = 28;

/// Handle of a block in the code buffer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct X64Block {
    pub checked_entry: usize,
    pub normal_entry: usize,
}

struct GprSpill<'a>(&'a mut XEmitter);

impl RegSpiller for GprSpill<'_> {
    fn load(&mut self, host: HostReg, guest: usize) {
        let disp = offsets::gpr(guest);
        dynasm!(self.0.ops ; mov Rd(host), [rbp + disp]);
    }
    fn store(&mut self, host: HostReg, guest: usize) {
        let disp = offsets::gpr(guest);
        dynasm!(self.0.ops ; mov [rbp + disp], Rd(host));
    }
}

struct FprSpill<'a>(&'a mut XEmitter);

impl RegSpiller for FprSpill<'_> {
    fn load(&mut self, host: HostReg, guest: usize) {
        let disp = offsets::fpr(guest);
        dynasm!(self.0.ops ; movsd Rx(host), QWORD [rbp + disp]);
    }
    fn store(&mut self, host: HostReg, guest: usize) {
        let disp = offsets::fpr(guest);
        dynasm!(self.0.ops ; movsd QWORD [rbp + disp], Rx(host));
    }
}

pub struct Jit64Backend {
    buffer: CodeBuffer,
    routines: AsmRoutines,
    emit: XEmitter,
    gpr: RegCache,
    fpr: RegCache,
    exits: Vec<LinkExit>,
    block_start: u32,
    /// Control cannot fall past the last emitted instruction
    terminated: bool,
    /// First failure while emitting the current block
    error: Option<JitError>,
}

impl Jit64Backend {
    pub fn new(size: usize) -> Result<Self, JitError> {
        let mut buffer = CodeBuffer::new(size)?;
        let routines = AsmRoutines::generate(&mut buffer)?;
        log::info!("[JIT64] routines at {:#x}, {} KiB for blocks", routines.enter, buffer.space_remaining() / 1024);
        Ok(Jit64Backend {
            emit: XEmitter::new(routines.end),
            buffer,
            routines,
            gpr: RegCache::new(&GPR_POOL, 32),
            fpr: RegCache::new(&FPR_POOL, 32),
            exits: Vec::new(),
            block_start: 0,
            terminated: false,
            error: None,
        })
    }

    fn is_native(op: &CodeOp) -> bool {
        use OpKind::*;
        let inst = op.inst;
        match op.kind {
            Addi | Addis | Andi | Andis | Ori | Oris | Xori | Xoris => true,
            And | Andc | Or | Nor | Xor | Extsb | Extsh | Rlwinm => true,
            Cmp | Cmpl | Cmpi | Cmpli => true,
            Add | Subf | Neg | Mullw => !inst.oe(),
            Mfspr | Mtspr => matches!(inst.spr(), SPR_LR | SPR_CTR),
            B | Bc | Bclr | Bcctr => true,
            Fadd | Fsub | Fmul | Fdiv | Fmr => !inst.rc(),
            _ => false,
        }
    }

    /// A failed bind hands out a scratch register; the block is then
    /// rejected by `end_block`
    fn bind_gpr(&mut self, guest: usize, mode: BindMode) -> Reg {
        match self.gpr.bind(guest, mode, &mut GprSpill(&mut self.emit)) {
            Ok(host) => host,
            Err(e) => {
                self.error.get_or_insert(e);
                RAX
            }
        }
    }

    fn bind_fpr(&mut self, guest: usize, mode: BindMode) -> Reg {
        match self.fpr.bind(guest, mode, &mut FprSpill(&mut self.emit)) {
            Ok(host) => host,
            Err(e) => {
                self.error.get_or_insert(e);
                XMM0
            }
        }
    }

    /// Bind a source register and keep it until the instruction is done
    fn read_gpr(&mut self, guest: usize) -> Reg {
        let host = self.bind_gpr(guest, BindMode::Read);
        self.gpr.lock(guest);
        host
    }

    fn read_fpr(&mut self, guest: usize) -> Reg {
        let host = self.bind_fpr(guest, BindMode::Read);
        self.fpr.lock(guest);
        host
    }

    fn flush(&mut self, mode: FlushMode) {
        self.gpr.flush(mode, &mut GprSpill(&mut self.emit));
        self.fpr.flush(mode, &mut FprSpill(&mut self.emit));
    }

    fn emit_sync_pc(&mut self, pc: u32) {
        let next = pc.wrapping_add(4);
        dynasm!(self.emit.ops
            ; mov DWORD [rbp + offsets::PC], pc as i32
            ; mov DWORD [rbp + offsets::NPC], next as i32
        );
    }

    fn emit_commit(&mut self, c: BlockCounters) {
        let (cycles, load_store, fp) = (c.cycles as i32, c.load_store as i32, c.fp as i32);
        if cycles != 0 {
            dynasm!(self.emit.ops
                ; sub DWORD [rbp + offsets::DOWNCOUNT], cycles
                ; add DWORD [rbp + offsets::PERF_CYCLES], cycles
            );
        }
        if load_store != 0 {
            dynasm!(self.emit.ops ; add DWORD [rbp + offsets::PERF_LOAD_STORE], load_store);
        }
        if fp != 0 {
            dynasm!(self.emit.ops ; add DWORD [rbp + offsets::PERF_FP], fp);
        }
    }

    fn emit_uncommit(&mut self, c: BlockCounters) {
        let (cycles, load_store, fp) = (c.cycles as i32, c.load_store as i32, c.fp as i32);
        if cycles != 0 {
            dynasm!(self.emit.ops
                ; add DWORD [rbp + offsets::DOWNCOUNT], cycles
                ; sub DWORD [rbp + offsets::PERF_CYCLES], cycles
            );
        }
        if load_store != 0 {
            dynasm!(self.emit.ops ; sub DWORD [rbp + offsets::PERF_LOAD_STORE], load_store);
        }
        if fp != 0 {
            dynasm!(self.emit.ops ; sub DWORD [rbp + offsets::PERF_FP], fp);
        }
    }

    /// `callback(ctx, arg)`; the register cache must already be flushed
    fn emit_call(&mut self, callback: Callback, arg: u32) {
        debug_assert!(self.gpr.is_clean() && self.fpr.is_clean());
        self.emit_call_unchecked(callback, arg);
    }

    /// Call on a side path after a `MaintainState` flush: the cache still
    /// lists bindings but guest state is current and the path never returns
    fn emit_call_unchecked(&mut self, callback: Callback, arg: u32) {
        dynasm!(self.emit.ops
            ; mov rdi, r15
            ; mov esi, arg as i32
        );
        self.emit.call_abs(callback_address(callback));
    }

    /// Linkable exit to a fixed guest address
    fn emit_exit_to(&mut self, target: u32) {
        let location = self.emit.current_address();
        self.emit.exit_stub(offsets::PC, target, self.routines.exit);
        self.exits.push(LinkExit { target, location, linked: false });
    }

    /// Exit to the address in guest `npc`
    fn emit_exit_dynamic(&mut self) {
        dynasm!(self.emit.ops ; mov eax, [rbp + offsets::NPC]);
        self.emit_exit_eax();
    }

    fn emit_exit_eax(&mut self) {
        dynasm!(self.emit.ops ; mov [rbp + offsets::PC], eax);
        self.emit.jmp_abs(self.routines.exit);
    }

    /// Side path that delivers a pending exception and leaves
    fn emit_exception_exit(&mut self, after: BlockCounters) {
        self.emit_commit(after);
        self.emit_call_unchecked(runtime::rt_check_exceptions, 0);
        self.emit.jmp_abs(self.routines.exit);
    }

    fn emit_exception_check(&mut self, mask: u32, after: BlockCounters) {
        let skip = self.emit.new_label();
        dynasm!(self.emit.ops
            ; test DWORD [rbp + offsets::EXCEPTIONS], mask as i32
            ; je =>skip
        );
        self.flush(FlushMode::MaintainState);
        self.emit_exception_exit(after);
        self.emit.bind(skip);
    }

    fn emit_fallback(&mut self, op: &CodeOp) {
        self.flush(FlushMode::Full);
        self.emit_call(runtime::rt_interpret, op.inst.0);
    }

    fn patch_exit(&mut self, location: usize, target: u32) -> Result<(), JitError> {
        let mut e = XEmitter::new(location);
        e.exit_stub(offsets::PC, target, self.routines.exit);
        let code = e.finish()?;
        self.buffer.patch(location, &code)
    }

    /// Drop the block being emitted
    fn abandon_block(&mut self) {
        let origin = self.emit.origin();
        self.exits.clear();
        self.emit.reset(origin);
    }
}

impl BlockLinker<X64Block> for Jit64Backend {
    fn write_link(&mut self, exit: &LinkExit, dest: Option<&X64Block>) -> Result<(), JitError> {
        match dest {
            Some(block) => {
                let mut e = XEmitter::new(exit.location);
                e.jmp_abs(block.checked_entry);
                let code = e.finish()?;
                self.buffer.patch(exit.location, &code)
            }
            None => self.patch_exit(exit.location, exit.target),
        }
    }

    fn write_destroy(&mut self, block: &JitBlock<X64Block>) -> Result<(), JitError> {
        self.patch_exit(block.code.checked_entry, block.start)?;
        self.patch_exit(block.code.normal_entry, block.start)
    }
}

impl BlockBackend for Jit64Backend {
    type Code = X64Block;
    type Fixup = DynamicLabel;

    fn name(&self) -> &'static str {
        "JIT64"
    }

    fn linker(&mut self) -> &mut dyn BlockLinker<X64Block> {
        self
    }

    fn space_remaining(&self) -> usize {
        self.buffer.space_remaining()
    }

    fn clear_code(&mut self) {
        let keep = self.routines.end - self.buffer.base();
        if let Err(e) = self.buffer.truncate(keep) {
            log::error!("[JIT64] failed to reset code buffer: {}", e);
        }
    }

    fn begin_block(&mut self, block: &CodeBlock) -> Result<(), JitError> {
        let origin = self.buffer.next_block_address();
        self.emit.reset(origin);
        self.exits.clear();
        self.block_start = block.start;
        self.terminated = false;
        self.error = None;
        for guest in 0..32 {
            self.gpr.discard(guest);
            self.fpr.discard(guest);
        }

        let normal = self.emit.new_label();
        dynasm!(self.emit.ops
            ; cmp DWORD [rbp + offsets::DOWNCOUNT], 0
            ; jg =>normal
        );
        self.emit.exit_stub(offsets::PC, block.start, self.routines.exit);
        self.emit.bind(normal);
        debug_assert_eq!(self.emit.len(), NORMAL_ENTRY);
        Ok(())
    }

    fn emit_hle(&mut self, op: &CodeOp, hook: HookHandle, counters: OpCounters) {
        self.flush(FlushMode::Full);
        self.emit_sync_pc(op.address);
        self.emit_call(runtime::rt_hle, hook.index);
        if hook.kind == HookKind::Replace {
            self.emit_commit(counters.after);
            self.emit_exit_dynamic();
            self.terminated = true;
        }
    }

    fn emit_op(&mut self, op: &CodeOp, checks: &OpChecks, counters: OpCounters) -> Option<DynamicLabel> {
        if checks.sync_pc {
            self.emit_sync_pc(op.address);
        }
        if checks.breakpoint {
            self.flush(FlushMode::Full);
            self.emit_call(runtime::rt_check_breakpoint, 0);
            let skip = self.emit.new_label();
            dynasm!(self.emit.ops
                ; test eax, eax
                ; je =>skip
            );
            self.emit_commit(counters.before);
            self.emit.jmp_abs(self.routines.exit);
            self.emit.bind(skip);
        }
        if checks.check_fpu {
            let enabled = self.emit.new_label();
            dynasm!(self.emit.ops
                ; test DWORD [rbp + offsets::MSR], MSR_FP as i32
                ; jne =>enabled
            );
            self.flush(FlushMode::MaintainState);
            dynasm!(self.emit.ops ; or DWORD [rbp + offsets::EXCEPTIONS], EXCEPTION_FPU_UNAVAILABLE as i32);
            self.emit_exception_exit(counters.after);
            self.emit.bind(enabled);
        }

        let fixup = if !Self::is_native(op) {
            self.emit_fallback(op);
            None
        } else if op.is_branch() {
            self.emit_branch(op, checks, counters.after)
        } else if op.info.has(FL_USE_FPU) {
            self.emit_float(op);
            None
        } else {
            self.emit_integer(op);
            None
        };

        if checks.memcheck {
            self.emit_exception_check(EXCEPTION_DSI, counters.after);
        }
        if checks.check_program_exception {
            self.emit_exception_check(EXCEPTION_PROGRAM, counters.after);
        }
        fixup
    }

    fn bind_in_block(&mut self, _target: u32, jumps: Vec<InBlockJump<DynamicLabel>>, counters: BlockCounters) {
        // Both paths reach the join point with an empty cache
        self.flush(FlushMode::Full);
        let join = self.emit.new_label();
        dynasm!(self.emit.ops ; jmp =>join);
        for jump in jumps {
            self.emit.bind(jump.fixup);
            self.emit_uncommit(counters.since(&jump.counters));
            dynasm!(self.emit.ops ; jmp =>join);
        }
        self.emit.bind(join);
    }

    fn emit_dangling(&mut self, target: u32, jump: InBlockJump<DynamicLabel>) {
        self.emit.bind(jump.fixup);
        self.emit_commit(jump.counters);
        self.emit_exit_to(target);
    }

    fn emit_exit(&mut self, exit: BlockExit, counters: BlockCounters) {
        if self.terminated {
            return;
        }
        self.flush(FlushMode::Full);
        self.emit_commit(counters);
        match exit {
            BlockExit::Constant(target) => self.emit_exit_to(target),
            BlockExit::Branched | BlockExit::Dynamic => self.emit_exit_dynamic(),
        }
        self.terminated = true;
    }

    fn end_block(&mut self) -> Result<(X64Block, Vec<LinkExit>), JitError> {
        if let Some(e) = self.error.take() {
            self.abandon_block();
            return Err(e);
        }
        debug_assert!(self.terminated);
        debug_assert!(self.gpr.is_clean() && self.fpr.is_clean());
        // Room for the exit stub `write_destroy` puts at the normal entry
        self.emit.pad_to(NORMAL_ENTRY + EXIT_STUB_SIZE);
        let origin = self.emit.origin();
        log::trace!("[JIT64] block {:#010x}: {} bytes at {:#x}", self.block_start, self.emit.len(), origin);
        let appended = match self.emit.finish() {
            Ok(code) => self.buffer.append(origin, &code),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = appended {
            self.abandon_block();
            return Err(e);
        }
        let block = X64Block { checked_entry: origin, normal_entry: origin + NORMAL_ENTRY };
        Ok((block, std::mem::take(&mut self.exits)))
    }

    fn execute(&mut self, code: &X64Block, m: &mut Machine<'_>) -> Result<(), JitError> {
        self.buffer.make_executable()?;
        // SAFETY: `routines.enter` was generated by `AsmRoutines::generate`
        // with exactly this signature and the buffer is executable.
        let enter: EnterFn = unsafe { std::mem::transmute::<usize, EnterFn>(self.routines.enter) };
        let ctx: *mut Machine<'_> = m;
        // SAFETY: `ctx` comes from a live exclusive borrow. Generated code
        // reaches guest state through `state` and everything else through
        // `ctx`, and both are derived from that one pointer.
        unsafe {
            let state: *mut GuestState = std::ptr::addr_of_mut!(*(*ctx).state);
            enter(state, ctx.cast::<c_void>(), code.normal_entry);
        }
        m.state.npc = m.state.pc;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::{asm, exception, CpuControl, CpuCore};
    use crate::debug::BreakPoints;
    use crate::hle::HookRegistry;
    use crate::jit::analyzer::Analyzer;
    use crate::jit::compiler::{compile, CompileEnv};
    use crate::jit::{Jit64, JitConfig};
    use crate::memory::{Bus, Memory};
    use crate::timing::CoreTiming;

    struct Rig {
        state: GuestState,
        mem: Memory,
        timing: CoreTiming,
        bps: BreakPoints,
        hooks: HookRegistry,
        control: CpuControl,
        config: JitConfig,
    }

    impl Rig {
        fn new(code: &[u32]) -> Self {
            let mut mem = Memory::new(0x10000);
            for (i, w) in code.iter().enumerate() {
                mem.write32(0x100 + 4 * i as u32, *w);
            }
            let mut state = GuestState::new();
            state.reset(0x100);
            state.msr = MSR_FP;
            state.downcount = 1000;
            Rig {
                state,
                mem,
                timing: CoreTiming::new(1000),
                bps: BreakPoints::new(),
                hooks: HookRegistry::new(),
                control: CpuControl::new(),
                config: JitConfig { code_buffer_size: 1 << 20, ..JitConfig::default() },
            }
        }

        /// Compile and run the block at the current pc once
        fn run_block(&mut self, backend: &mut Jit64Backend) {
            let mut block = CodeBlock::default();
            Analyzer::new(&self.config).analyze(self.state.pc, self.state.msr, &mut self.mem, &mut block);
            let env = CompileEnv { config: &self.config, breakpoints: &self.bps, hooks: &self.hooks };
            let (code, _) = compile(backend, &block, &env).unwrap();
            let mut m = Machine::new(&mut self.state, &mut self.mem, &mut self.timing, &mut self.bps, &self.hooks, &self.control);
            backend.execute(&code, &mut m).unwrap();
        }

        fn run(&mut self, core: &mut dyn CpuCore) {
            self.control.resume();
            let mut m = Machine::new(&mut self.state, &mut self.mem, &mut self.timing, &mut self.bps, &self.hooks, &self.control);
            core.run(&mut m);
        }
    }

    fn backend() -> Jit64Backend {
        Jit64Backend::new(1 << 20).unwrap()
    }

    #[test]
    fn test_straight_line_integer_block() {
        let mut r = Rig::new(&[
            asm::li(3, 5),
            asm::addi(4, 3, 10),
            asm::subf(5, 3, 4),
            asm::mullw(6, 4, 5),
            asm::rlwinm(7, 6, 4, 24, 31),
            asm::extsb(8, 6),
            asm::nor(9, 3, 3),
            asm::blr(),
        ]);
        r.state.lr = 0x400;
        let mut jit = backend();
        r.run_block(&mut jit);
        assert_eq!(r.state.gpr[4], 15);
        assert_eq!(r.state.gpr[5], 10);
        assert_eq!(r.state.gpr[6], 150);
        assert_eq!(r.state.gpr[7], (150u32.rotate_left(4)) & 0xFF);
        assert_eq!(r.state.gpr[8], 150u8 as i8 as i32 as u32);
        assert_eq!(r.state.gpr[9], !5);
        assert_eq!(r.state.pc, 0x400);
        assert_eq!(r.state.perf.cycles, r.state.downcount.abs_diff(1000));
    }

    #[test]
    fn test_record_and_compare_set_cr() {
        let mut r = Rig::new(&[
            asm::li(3, -1),
            asm::add_rc(4, 3, 3),
            asm::cmplwi(1, 3, 1),
            asm::cmpwi(2, 3, 0),
            asm::blr(),
        ]);
        r.state.xer = crate::cpu::XER_SO;
        r.state.lr = 0x400;
        let mut jit = backend();
        r.run_block(&mut jit);
        assert_eq!(r.state.gpr[4], (-2i32) as u32);
        assert_eq!(r.state.cr_field(0), crate::cpu::CR_LT | crate::cpu::CR_SO);
        assert_eq!(r.state.cr_field(1), crate::cpu::CR_GT | crate::cpu::CR_SO);
        assert_eq!(r.state.cr_field(2), crate::cpu::CR_LT | crate::cpu::CR_SO);
    }

    #[test]
    fn test_register_pressure_spills() {
        // More live guest registers than host registers in the pool
        let mut code: Vec<u32> = (3..24).map(|r| asm::li(r, r as i16)).collect();
        code.push(asm::li(30, 0));
        for r in 3..24 {
            code.push(asm::add(30, 30, r));
        }
        code.push(asm::blr());
        let mut r = Rig::new(&code);
        r.state.lr = 0x400;
        let mut jit = backend();
        r.run_block(&mut jit);
        for g in 3..24 {
            assert_eq!(r.state.gpr[g], g as u32);
        }
        assert_eq!(r.state.gpr[30], (3..24).sum::<u32>());
    }

    #[test]
    fn test_float_arithmetic() {
        let mut r = Rig::new(&[asm::fadd(1, 2, 3), asm::fmul(4, 1, 2), asm::fdiv(5, 4, 3), asm::fmr(6, 5), asm::blr()]);
        r.state.fpr[2] = 1.5;
        r.state.fpr[3] = 0.25;
        r.state.lr = 0x400;
        let mut jit = backend();
        r.run_block(&mut jit);
        assert_eq!(r.state.fpr[1], 1.75);
        assert_eq!(r.state.fpr[4], 1.75 * 1.5);
        assert_eq!(r.state.fpr[5], 1.75 * 1.5 / 0.25);
        assert_eq!(r.state.fpr[6], r.state.fpr[5]);
        assert_eq!(r.state.perf.fp, 4);
    }

    #[test]
    fn test_fpu_unavailable_at_first_fp_op() {
        let mut r = Rig::new(&[asm::li(3, 1), asm::fadd(1, 2, 3), asm::fadd(1, 1, 1), asm::blr()]);
        r.state.msr = 0;
        let mut jit = backend();
        r.run_block(&mut jit);
        assert_eq!(r.state.pc, exception::VECTOR_FPU_UNAVAILABLE);
        assert_eq!(r.state.srr0, 0x104);
        assert_eq!(r.state.gpr[3], 1);
        assert_eq!(r.state.perf.cycles, 2);
    }

    #[test]
    fn test_dsi_exits_at_faulting_instruction() {
        let mut r = Rig::new(&[asm::li(4, 7), asm::lis(3, 0x7000), asm::lwz(4, 3, 0), asm::li(5, 1), asm::blr()]);
        r.state.msr = MSR_FP | crate::cpu::MSR_DR;
        let mut jit = backend();
        r.run_block(&mut jit);
        assert_eq!(r.state.pc, exception::VECTOR_DSI);
        assert_eq!(r.state.srr0, 0x108);
        assert_eq!(r.state.gpr[4], 7);
        assert_eq!(r.state.gpr[5], 0);
        assert_eq!(r.state.perf.cycles, 3);
    }

    #[test]
    fn test_idle_loop_gives_up_slice() {
        let mut r = Rig::new(&[asm::lwz(0, 0, 0x800), asm::cmpwi(0, 0, 0), asm::beq(-8), asm::blr()]);
        let mut jit = backend();
        r.run_block(&mut jit);
        assert_eq!(r.state.pc, 0x100);
        assert_eq!(r.state.downcount, 0);
        assert_eq!(r.timing.idled_cycles(), 997);
    }

    #[test]
    fn test_conditional_exit_not_taken_keeps_cached_values() {
        let mut r = Rig::new(&[asm::li(3, 1), asm::cmpwi(0, 3, 1), asm::bne(0x40), asm::addi(3, 3, 1), asm::blr()]);
        r.state.lr = 0x400;
        let mut jit = backend();
        r.run_block(&mut jit);
        assert_eq!(r.state.gpr[3], 2);
        assert_eq!(r.state.pc, 0x400);
    }

    #[test]
    fn test_loop_links_to_itself() {
        let mut r = Rig::new(&[asm::addic_rc(3, 3, -1), asm::bne(-4), asm::b(0)]);
        r.state.gpr[3] = 1_000_000;
        r.bps.add(0x108);
        let mut jit = Jit64::new(JitConfig { enable_debugging: true, ..r.config.clone() }).unwrap();
        r.run(&mut jit);
        assert_eq!(r.state.gpr[3], 0);
        assert_eq!(r.state.pc, 0x108);
        assert_eq!(jit.stats().compiles, 1);
        let block = jit.cache().find(0x100, r.state.msr).unwrap();
        assert!(block.exits.iter().any(|e| e.target == 0x100 && e.linked));
    }

    #[test]
    fn test_destroyed_block_exits_immediately() {
        let mut r = Rig::new(&[asm::li(3, 1), asm::blr()]);
        let mut jit = backend();
        let mut block = CodeBlock::default();
        Analyzer::new(&r.config).analyze(0x100, 0, &mut r.mem, &mut block);
        let env = CompileEnv { config: &r.config, breakpoints: &r.bps, hooks: &r.hooks };
        let (code, _) = compile(&mut jit, &block, &env).unwrap();
        let jit_block = JitBlock {
            start: 0x100,
            msr_key: 0,
            num_instructions: 2,
            physical_lines: Default::default(),
            exits: Vec::new(),
            code,
        };
        jit.write_destroy(&jit_block).unwrap();
        let mut m = Machine::new(&mut r.state, &mut r.mem, &mut r.timing, &mut r.bps, &r.hooks, &r.control);
        jit.execute(&code, &mut m).unwrap();
        assert_eq!(r.state.gpr[3], 0);
        assert_eq!(r.state.pc, 0x100);
    }

    #[test]
    fn test_clear_code_keeps_routines() {
        let mut r = Rig::new(&[asm::li(3, 9), asm::blr()]);
        r.state.lr = 0x400;
        let mut jit = backend();
        let empty = jit.space_remaining();
        r.run_block(&mut jit);
        assert!(jit.space_remaining() < empty);
        jit.clear_code();
        assert_eq!(jit.space_remaining(), empty);
        r.state.pc = 0x100;
        r.state.gpr[3] = 0;
        r.run_block(&mut jit);
        assert_eq!(r.state.gpr[3], 9);
    }

    #[test]
    fn test_single_step_leaves_at_linked_exit() {
        let mut r = Rig::new(&[asm::addi(3, 3, 1), asm::b(-4)]);
        let mut jit = Jit64::new(r.config.clone()).unwrap();
        let mut m = Machine::new(&mut r.state, &mut r.mem, &mut r.timing, &mut r.bps, &r.hooks, &r.control);
        let mut last = m.timing.ticks(m.state);
        let mut per_step = None;
        for i in 1..=4 {
            jit.single_step(&mut m);
            assert_eq!(m.state.gpr[3], i);
            assert_eq!(m.state.pc, 0x100);
            let ticks = m.timing.ticks(m.state);
            assert_eq!(*per_step.get_or_insert(ticks - last), ticks - last);
            last = ticks;
        }
        drop(m);
        assert_eq!(per_step, Some(r.state.perf.cycles as u64 / 4));
        let block = jit.cache().find(0x100, r.state.msr).unwrap();
        assert!(block.exits.iter().any(|e| e.target == 0x100 && e.linked));
    }

    #[test]
    fn test_locked_out_register_cache_rejects_block() {
        let mut r = Rig::new(&[asm::li(3, 1), asm::blr()]);
        let mut jit = backend();
        let mut block = CodeBlock::default();
        Analyzer::new(&r.config).analyze(0x100, 0, &mut r.mem, &mut block);
        jit.begin_block(&block).unwrap();
        for guest in 0..GPR_POOL.len() {
            jit.read_gpr(guest);
        }
        jit.read_gpr(GPR_POOL.len());
        assert!(matches!(jit.end_block(), Err(JitError::RegistersExhausted(10))));
        // The next block starts clean
        let env = CompileEnv { config: &r.config, breakpoints: &r.bps, hooks: &r.hooks };
        assert!(compile(&mut jit, &block, &env).is_ok());
    }
}
