//! Block-cache behavior seen through the system API: invalidation, linking,
//! clearing and save-state restore.

use otogekko::cpu::asm::*;
use otogekko::cpu::MSR_FP;
use otogekko::jit::JitConfig;
use otogekko::{CoreMode, System, SystemConfig};

fn compiled_cores() -> Vec<CoreMode> {
    let mut cores = vec![CoreMode::CachedInterpreter];
    if CoreMode::best_available() == CoreMode::Jit64 {
        cores.push(CoreMode::Jit64);
    }
    cores
}

fn system(core: CoreMode, jit: JitConfig) -> System {
    let config = SystemConfig { ram_size: 1024 * 1024, core, jit, ..SystemConfig::default() };
    System::new(config).unwrap()
}

fn default_jit() -> JitConfig {
    JitConfig { code_buffer_size: 1 << 20, ..JitConfig::default() }
}

fn load(sys: &mut System, address: u32, code: &[u32]) {
    let bytes: Vec<u8> = code.iter().flat_map(|w| w.to_be_bytes()).collect();
    sys.load_image(&bytes, address).unwrap();
}

fn start(sys: &mut System, entry: u32) {
    sys.reset(entry);
    sys.state.msr = MSR_FP;
}

#[test]
fn host_write_causes_exactly_one_recompile() {
    for core in compiled_cores() {
        let mut sys = system(core, default_jit());
        load(&mut sys, 0x100, &[bl(0xF00), nop()]);
        load(&mut sys, 0x1000, &[li(3, 1), blr()]);
        start(&mut sys, 0x100);
        sys.add_breakpoint(0x104);
        sys.run(None);
        assert_eq!((sys.state.pc, sys.state.gpr[3]), (0x104, 1), "{}", sys.core_name());
        let before = sys.stats();

        sys.write32(0x1000, li(3, 2));
        sys.state.pc = 0x100;
        sys.run(None);
        let after = sys.stats();
        assert_eq!((sys.state.pc, sys.state.gpr[3]), (0x104, 2), "{}", sys.core_name());
        assert_eq!(after.misses - before.misses, 1, "{}", sys.core_name());
        assert_eq!(after.compiles - before.compiles, 1, "{}", sys.core_name());
        assert_eq!(after.invalidated_blocks - before.invalidated_blocks, 1, "{}", sys.core_name());
    }
}

#[test]
fn guest_icbi_takes_effect_at_next_dispatch() {
    // Patch the callee to `li r3, 7`, icbi it, then call it
    let code = [
        lis(5, 0x3860),
        ori(5, 5, 7),
        li(6, 0x200),
        stw(5, 6, 0),
        icbi(0, 6),
        bl(0x200 - 0x114),
        nop(),
    ];
    for core in compiled_cores() {
        let mut sys = system(core, default_jit());
        load(&mut sys, 0x100, &code);
        load(&mut sys, 0x200, &[li(3, 1), blr()]);
        sys.add_breakpoint(0x118);
        // Compile the old callee first
        start(&mut sys, 0x200);
        sys.state.lr = 0x100;
        sys.single_step();
        assert_eq!(sys.state.gpr[3], 1);
        assert_eq!(sys.state.pc, 0x100);

        sys.run(None);
        assert_eq!(sys.state.pc, 0x118, "{}", sys.core_name());
        assert_eq!(sys.state.gpr[3], 7, "{}", sys.core_name());
    }
}

#[test]
fn hot_loop_compiles_once() {
    for core in compiled_cores() {
        let mut sys = system(core, default_jit());
        load(&mut sys, 0x100, &[addic_rc(3, 3, -1), bne(-4), nop()]);
        start(&mut sys, 0x100);
        sys.state.gpr[3] = 1_000_000;
        sys.add_breakpoint(0x108);
        sys.run(None);
        assert_eq!(sys.state.gpr[3], 0, "{}", sys.core_name());
        assert_eq!(sys.state.pc, 0x108, "{}", sys.core_name());
        assert_eq!(sys.stats().compiles, 1, "{}", sys.core_name());
    }
}

#[test]
fn unlinked_blocks_give_the_same_result() {
    for core in compiled_cores() {
        let mut results = Vec::new();
        for link in [true, false] {
            let mut sys = system(core, JitConfig { enable_block_link: link, ..default_jit() });
            load(&mut sys, 0x100, &[li(3, 0), li(4, 50), mtctr(4), bl(0x100), bdnz(-4), nop()]);
            load(&mut sys, 0x20C, &[addi(3, 3, 2), blr()]);
            start(&mut sys, 0x100);
            sys.add_breakpoint(0x114);
            sys.run(None);
            assert_eq!(sys.state.pc, 0x114, "{}", sys.core_name());
            results.push(sys.state.gpr[3]);
        }
        assert_eq!(results, vec![100, 100]);
    }
}

#[test]
fn clear_cache_forces_recompile() {
    for core in compiled_cores() {
        let mut sys = system(core, default_jit());
        load(&mut sys, 0x100, &[li(3, 5), blr()]);
        start(&mut sys, 0x100);
        sys.state.lr = 0x100;
        sys.single_step();
        sys.single_step();
        let before = sys.stats();
        assert_eq!(before.compiles, 1);

        sys.clear_cache();
        sys.single_step();
        let after = sys.stats();
        assert_eq!(after.compiles, 2);
        assert_eq!(after.clears, before.clears + 1);
    }
}

#[test]
fn no_block_cache_recompiles_every_dispatch() {
    for core in compiled_cores() {
        let mut sys = system(core, JitConfig { no_block_cache: true, ..default_jit() });
        load(&mut sys, 0x100, &[li(3, 3), mtctr(3), addi(4, 4, 1), bdnz(-4), nop()]);
        start(&mut sys, 0x100);
        sys.add_breakpoint(0x110);
        sys.run(None);
        assert_eq!(sys.state.gpr[4], 3, "{}", sys.core_name());
        assert_eq!(sys.stats().hits, 0, "{}", sys.core_name());
    }
}

#[test]
fn load_state_drops_translated_code() {
    for core in compiled_cores() {
        let mut other = system(core, default_jit());
        load(&mut other, 0x100, &[li(3, 9), nop()]);
        start(&mut other, 0x100);
        let patched = other.save_state().unwrap();

        let mut sys = system(core, default_jit());
        load(&mut sys, 0x100, &[li(3, 1), nop()]);
        sys.add_breakpoint(0x104);
        start(&mut sys, 0x100);
        sys.run(None);
        assert_eq!(sys.state.gpr[3], 1);

        // Same address, different code in the restored RAM
        let clears = sys.stats().clears;
        sys.load_state(&patched).unwrap();
        assert_eq!(sys.stats().clears, clears + 1);
        sys.run(None);
        assert_eq!(sys.state.pc, 0x104, "{}", sys.core_name());
        assert_eq!(sys.state.gpr[3], 9, "{}", sys.core_name());
    }
}

#[test]
fn single_step_runs_one_block_through_links() {
    // 0x100 and 0x200 branch to each other; once linked, a step still stops
    // at the first block boundary
    for core in compiled_cores() {
        let mut sys = system(core, default_jit());
        load(&mut sys, 0x100, &[addi(3, 3, 1), b(0xFC)]);
        load(&mut sys, 0x200, &[addi(4, 4, 1), b(-0x104)]);
        start(&mut sys, 0x100);
        let mut last = sys.ticks();
        let mut per_step = Vec::new();
        for step in 1..=6u32 {
            sys.single_step();
            assert_eq!((sys.state.gpr[3], sys.state.gpr[4]), ((step + 1) / 2, step / 2), "{}", sys.core_name());
            let pc = if step % 2 == 1 { 0x200 } else { 0x100 };
            assert_eq!(sys.state.pc, pc, "{}", sys.core_name());
            per_step.push(sys.ticks() - last);
            last = sys.ticks();
        }
        assert!(per_step[0] > 0);
        assert!(per_step.iter().all(|&t| t == per_step[0]), "{}: {:?}", sys.core_name(), per_step);
        let stats = sys.stats();
        assert_eq!(stats.compiles, 2, "{}", sys.core_name());
        assert_eq!(stats.executed_blocks, 6, "{}", sys.core_name());
    }
}
