//! Exception delivery from compiled code matches the interpreter's.

use otogekko::cpu::asm::*;
use otogekko::cpu::{MSR_FP, MSR_IR, SPR_SRR1};
use otogekko::jit::JitConfig;
use otogekko::{CoreMode, System, SystemConfig};

fn all_cores() -> Vec<CoreMode> {
    let mut cores = vec![CoreMode::Interpreter, CoreMode::CachedInterpreter];
    if CoreMode::best_available() == CoreMode::Jit64 {
        cores.push(CoreMode::Jit64);
    }
    cores
}

fn system(core: CoreMode) -> System {
    let jit = JitConfig { code_buffer_size: 1 << 20, ..JitConfig::default() };
    let config = SystemConfig { ram_size: 1024 * 1024, core, jit, ..SystemConfig::default() };
    System::new(config).unwrap()
}

fn load(sys: &mut System, address: u32, code: &[u32]) {
    let bytes: Vec<u8> = code.iter().flat_map(|w| w.to_be_bytes()).collect();
    sys.load_image(&bytes, address).unwrap();
}

#[test]
fn fpu_unavailable_raised_once_per_block() {
    for core in all_cores() {
        let mut sys = system(core);
        load(
            &mut sys,
            0x100,
            &[li(5, 1), fadd(1, 0, 0), fmr(2, 1), fadd(3, 2, 2), li(6, 2), nop()],
        );
        // Handler: count, enable the FPU, retry
        load(&mut sys, 0x800, &[addi(20, 20, 1), mfspr(21, SPR_SRR1), ori(21, 21, 0x2000), mtspr(SPR_SRR1, 21), rfi()]);
        sys.add_breakpoint(0x114);
        sys.reset(0x100);
        sys.run(None);

        assert_eq!(sys.state.pc, 0x114, "{}", sys.core_name());
        assert_eq!(sys.state.gpr[20], 1, "{}", sys.core_name());
        assert_eq!(sys.state.srr0, 0x104, "{}", sys.core_name());
        assert_eq!((sys.state.gpr[5], sys.state.gpr[6]), (1, 2), "{}", sys.core_name());
        assert_ne!(sys.state.msr & MSR_FP, 0);
    }
}

#[test]
fn instruction_fetch_fault_vectors_to_isi() {
    for core in all_cores() {
        let mut sys = system(core);
        load(&mut sys, 0x400, &[li(7, 1), nop()]);
        sys.add_breakpoint(0x404);
        sys.reset(0x9000_0000);
        sys.state.msr = MSR_IR | MSR_FP;
        sys.run(None);

        assert_eq!(sys.state.pc, 0x404, "{}", sys.core_name());
        assert_eq!(sys.state.gpr[7], 1, "{}", sys.core_name());
        assert_eq!(sys.state.srr0, 0x9000_0000, "{}", sys.core_name());
        assert_eq!(sys.state.msr & MSR_IR, 0);
    }
}

#[test]
fn illegal_instruction_raises_program_exception() {
    for core in all_cores() {
        let mut sys = system(core);
        // 0x104 holds zero, which does not decode
        load(&mut sys, 0x100, &[li(3, 3)]);
        load(&mut sys, 0x700, &[li(8, 8), nop()]);
        sys.add_breakpoint(0x704);
        sys.reset(0x100);
        sys.run(None);

        assert_eq!(sys.state.pc, 0x704, "{}", sys.core_name());
        assert_eq!((sys.state.gpr[3], sys.state.gpr[8]), (3, 8), "{}", sys.core_name());
        assert_eq!(sys.state.srr0, 0x104, "{}", sys.core_name());
    }
}

#[test]
fn powered_down_cpu_does_not_run() {
    for core in all_cores() {
        let mut sys = system(core);
        load(&mut sys, 0x100, &[li(3, 3), nop()]);
        sys.reset(0x100);
        sys.control().power_down();
        sys.run(Some(1000));
        sys.single_step();
        assert_eq!(sys.state.gpr[3], 0, "{}", sys.core_name());
        assert_eq!(sys.state.pc, 0x100);
    }
}
