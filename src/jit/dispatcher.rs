//! Dispatcher
//!
//! The run loop shared by every backend: advance the scheduler, then look
//! up (or compile) and execute the block at `pc` until the slice is used up
//! or the CPU leaves `Running`.

use crate::cpu::{exception, interpreter, CpuCore, Machine, EXCEPTION_ISI, MSR_TRANSLATION_MASK};

use super::block_cache::JitBlock;
use super::compiler::{compile, BlockBackend, CompileEnv};
use super::{Jit, JitConfig, JitError, JitStats};

impl<B: BlockBackend> Jit<B> {
    /// Apply `icbi` invalidations queued by the last block
    fn apply_invalidations(&mut self, m: &mut Machine<'_>) {
        if m.invalidations.is_empty() {
            return;
        }
        for (address, length) in std::mem::take(&mut m.invalidations) {
            self.invalidate_range(address, length);
        }
    }

    fn invalidate_range(&mut self, address: u32, length: u32) {
        match self.cache.invalidate(address, length, self.backend.linker()) {
            Ok(count) => self.stats.invalidated_blocks += count as u64,
            Err(e) => {
                log::error!("[JIT] invalidation of {:#010x}+{:#x} failed: {}; clearing cache", address, length, e);
                self.clear_all();
            }
        }
    }

    /// Translate the block at the current pc and add it to the cache.
    /// `None` when nothing can run: the fetch faulted (ISI delivered) or
    /// the backend failed (CPU powered down).
    fn compile_block(&mut self, m: &mut Machine<'_>) -> Option<usize> {
        let (pc, msr) = (m.state.pc, m.state.msr);
        if self.backend.space_remaining() < self.config.clear_margin {
            log::info!("[JIT] code space low ({} bytes left), clearing cache", self.backend.space_remaining());
            self.clear_all();
        }

        self.analyzer.analyze(pc, msr, &mut *m.bus, &mut self.code_block);
        if self.code_block.memory_exception {
            log::warn!("[JIT] ISI fetching block at {:#010x}", pc);
            m.state.npc = pc;
            m.state.exceptions |= EXCEPTION_ISI;
            exception::check_exceptions(m.state);
            return None;
        }

        let env = CompileEnv { config: &self.config, breakpoints: &*m.breakpoints, hooks: m.hooks };
        let result = match compile(&mut self.backend, &self.code_block, &env) {
            Err(JitError::CodeBufferFull { needed, available }) => {
                log::info!("[JIT] code buffer full ({} needed, {} left), clearing cache", needed, available);
                self.cache.clear();
                self.backend.clear_code();
                self.stats.clears += 1;
                compile(&mut self.backend, &self.code_block, &env)
            }
            other => other,
        };
        let (code, exits) = match result {
            Ok(compiled) => compiled,
            Err(e) => {
                log::error!("[JIT] {} failed to compile block at {:#010x}: {}", self.backend.name(), pc, e);
                m.control.power_down();
                return None;
            }
        };
        self.stats.compiles += 1;

        let block = JitBlock {
            start: pc,
            msr_key: msr & MSR_TRANSLATION_MASK,
            num_instructions: self.code_block.len() as u32,
            physical_lines: self.code_block.physical_addresses.clone(),
            exits,
            code,
        };
        match self.cache.insert(block, self.config.enable_block_link, self.backend.linker()) {
            Ok(index) => Some(index),
            Err(e) => {
                log::error!("[JIT] failed to insert block at {:#010x}: {}", pc, e);
                self.clear_all();
                None
            }
        }
    }

    /// Look up or compile the block at `pc` and run it once
    fn execute_one_block(&mut self, m: &mut Machine<'_>) {
        self.apply_invalidations(m);
        if self.config.no_block_cache {
            self.cache.clear();
            self.backend.clear_code();
        }

        let index = match self.cache.lookup(m.state.pc, m.state.msr) {
            Some(index) => index,
            None => match self.compile_block(m) {
                Some(index) => index,
                None => return,
            },
        };
        let Some(block) = self.cache.get(index) else {
            return;
        };
        self.stats.executed_blocks += 1;
        if let Err(e) = self.backend.execute(&block.code, m) {
            log::error!("[JIT] block at {:#010x} could not run: {}", block.start, e);
            m.control.power_down();
        }
    }
}

impl<B: BlockBackend> CpuCore for Jit<B> {
    fn name(&self) -> &'static str {
        self.backend.name()
    }

    fn run(&mut self, m: &mut Machine<'_>) {
        // Resuming on a breakpoint steps over it
        if m.control.is_running() && m.breakpoints.is_address_breakpoint(m.state.pc) {
            m.advance();
            interpreter::step(m);
            self.apply_invalidations(m);
        }
        while m.control.is_running() {
            m.advance();
            if m.timing.deadline_reached(m.state) {
                break;
            }
            while m.state.downcount > 0 && m.control.is_running() {
                self.execute_one_block(m);
            }
        }
        self.apply_invalidations(m);
    }

    fn single_step(&mut self, m: &mut Machine<'_>) {
        m.advance();
        // Linked exits re-enter through checked entries, which leave once the
        // downcount is spent: with none left, exactly one block runs
        let budget = m.state.downcount;
        m.state.downcount = 0;
        self.execute_one_block(m);
        m.state.downcount = m.state.downcount.wrapping_add(budget);
        self.apply_invalidations(m);
    }

    fn clear_cache(&mut self) {
        self.clear_all();
    }

    fn invalidate(&mut self, address: u32, length: u32) {
        self.invalidate_range(address, length);
    }

    fn stats(&self) -> JitStats {
        JitStats { hits: self.cache.hits, misses: self.cache.misses, ..self.stats }
    }

    fn configure(&mut self, config: &JitConfig) -> Result<(), JitError> {
        self.set_config(config.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::{asm, CpuControl, GuestState, MSR_FP};
    use crate::debug::BreakPoints;
    use crate::hle::HookRegistry;
    use crate::jit::{CachedInterpreter, JitConfig};
    use crate::memory::{Bus, Memory};
    use crate::timing::CoreTiming;

    struct Rig {
        state: GuestState,
        mem: Memory,
        timing: CoreTiming,
        bps: BreakPoints,
        hooks: HookRegistry,
        control: CpuControl,
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
            Rig { state, mem, timing: CoreTiming::new(10_000), bps: BreakPoints::new(), hooks: HookRegistry::new(), control: CpuControl::new() }
        }

        fn run(&mut self, core: &mut dyn CpuCore) {
            self.control.resume();
            let mut m = Machine::new(&mut self.state, &mut self.mem, &mut self.timing, &mut self.bps, &self.hooks, &self.control);
            core.run(&mut m);
        }
    }

    fn debug_config() -> JitConfig {
        JitConfig { enable_debugging: true, ..JitConfig::default() }
    }

    #[test]
    fn test_runs_to_breakpoint() {
        let mut r = Rig::new(&[asm::li(3, 0), asm::addi(3, 3, 1), asm::cmpwi(0, 3, 10), asm::bne(-8), asm::nop()]);
        r.bps.add(0x110);
        let mut jit = CachedInterpreter::new(debug_config()).unwrap();
        r.run(&mut jit);
        assert_eq!(r.state.gpr[3], 10);
        assert_eq!(r.state.pc, 0x110);
        assert!(!r.control.is_running());
        let stats = jit.stats();
        assert_eq!(stats.compiles, 2);
        assert_eq!(stats.hits, 8);
    }

    #[test]
    fn test_resume_steps_over_breakpoint() {
        let mut r = Rig::new(&[asm::li(3, 1), asm::li(4, 2), asm::b(0)]);
        r.bps.add(0x100);
        r.bps.add(0x108);
        let mut jit = CachedInterpreter::new(debug_config()).unwrap();
        r.run(&mut jit);
        assert_eq!((r.state.gpr[3], r.state.gpr[4]), (1, 2));
        assert_eq!(r.state.pc, 0x108);
    }

    #[test]
    fn test_isi_on_block_fetch() {
        let mut r = Rig::new(&[]);
        r.state.msr = crate::cpu::MSR_IR;
        r.state.pc = 0x9000_0000;
        r.mem.write32(exception::VECTOR_ISI, asm::b(0));
        r.bps.add(exception::VECTOR_ISI);
        let mut jit = CachedInterpreter::new(debug_config()).unwrap();
        r.run(&mut jit);
        assert_eq!(r.state.pc, exception::VECTOR_ISI);
        assert_eq!(r.state.srr0, 0x9000_0000);
    }

    #[test]
    fn test_icbi_invalidates_at_next_dispatch() {
        // 0x100: store a new instruction over 0x200, icbi it, call it
        let code = [
            asm::lis(5, 0x3860), // li r3, 7
            asm::ori(5, 5, 7),
            asm::li(6, 0x200),
            asm::stw(5, 6, 0),
            asm::icbi(0, 6),
            asm::bl(0x200 - 0x114),
            asm::nop(),
        ];
        let mut r = Rig::new(&code);
        r.mem.write32(0x200, asm::li(3, 1));
        r.mem.write32(0x204, asm::blr());
        r.bps.add(0x118);
        let mut jit = CachedInterpreter::new(debug_config()).unwrap();
        // Compile the old callee first
        let mut m = Machine::new(&mut r.state, &mut r.mem, &mut r.timing, &mut r.bps, &r.hooks, &r.control);
        m.state.pc = 0x200;
        m.state.lr = 0x100;
        jit.single_step(&mut m);
        assert_eq!(m.state.gpr[3], 1);
        m.state.pc = 0x100;
        drop(m);

        r.run(&mut jit);
        assert_eq!(r.state.pc, 0x118);
        assert_eq!(r.state.gpr[3], 7);
        assert_eq!(jit.stats().invalidated_blocks, 1);
    }

    #[test]
    fn test_no_block_cache_recompiles() {
        let mut r = Rig::new(&[asm::li(3, 3), asm::mtctr(3), asm::addi(4, 4, 1), asm::bdnz(-4), asm::nop()]);
        r.bps.add(0x110);
        let mut jit = CachedInterpreter::new(JitConfig { no_block_cache: true, ..debug_config() }).unwrap();
        r.run(&mut jit);
        assert_eq!(r.state.gpr[4], 3);
        let stats = jit.stats();
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.compiles, 3);
    }

    #[test]
    fn test_invalidate_forces_one_recompile() {
        let mut r = Rig::new(&[asm::li(3, 1), asm::blr()]);
        r.state.lr = 0x100;
        let mut jit = CachedInterpreter::new(JitConfig::default()).unwrap();
        let mut m = Machine::new(&mut r.state, &mut r.mem, &mut r.timing, &mut r.bps, &r.hooks, &r.control);
        jit.single_step(&mut m);
        jit.single_step(&mut m);
        assert_eq!(jit.stats().misses, 1);
        jit.invalidate(0x100, 0x1000);
        jit.single_step(&mut m);
        jit.single_step(&mut m);
        let stats = jit.stats();
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.compiles, 2);
        assert_eq!(stats.invalidated_blocks, 1);
    }

    #[test]
    fn test_single_step_runs_one_block() {
        let mut r = Rig::new(&[asm::addi(3, 3, 1), asm::b(-4)]);
        let mut jit = CachedInterpreter::new(JitConfig::default()).unwrap();
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
        assert_eq!(per_step, Some(m.state.perf.cycles as u64 / 4));
        assert_eq!(jit.stats().executed_blocks, 4);
    }
}
