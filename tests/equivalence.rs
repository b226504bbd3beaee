//! Every core must leave the guest in the same state as the interpreter.
//!
//! Programs stop on a breakpoint. `npc` and `downcount` are bookkeeping that
//! differ legitimately between cores and are not compared. Performance
//! counters and total ticks must match even though compiled cores commit
//! them per block.

use otogekko::cpu::asm::*;
use otogekko::cpu::{GuestState, MSR_DR, MSR_FP, MSR_IR, SPR_SRR0, SPR_SRR1};
use otogekko::jit::JitConfig;
use otogekko::{CoreMode, System, SystemConfig};

const BASE: u32 = 0x100;

fn compiled_cores() -> Vec<CoreMode> {
    let mut cores = vec![CoreMode::CachedInterpreter];
    if CoreMode::best_available() == CoreMode::Jit64 {
        cores.push(CoreMode::Jit64);
    }
    cores
}

struct Program {
    code: Vec<(u32, Vec<u32>)>,
    data: Vec<(u32, u32)>,
    entry: u32,
    msr: u32,
    stop: u32,
}

impl Program {
    fn new(code: Vec<u32>) -> Self {
        let stop = BASE + 4 * (code.len() as u32 - 1);
        Program { code: vec![(BASE, code)], data: Vec::new(), entry: BASE, msr: MSR_FP, stop }
    }

    fn with_code(mut self, address: u32, code: Vec<u32>) -> Self {
        self.code.push((address, code));
        self
    }

    fn with_data(mut self, address: u32, words: &[u32]) -> Self {
        for (i, w) in words.iter().enumerate() {
            self.data.push((address + 4 * i as u32, *w));
        }
        self
    }
}

fn run(core: CoreMode, program: &Program) -> System {
    let config = SystemConfig {
        ram_size: 1024 * 1024,
        core,
        jit: JitConfig { idle_skip: false, code_buffer_size: 1 << 20, ..JitConfig::default() },
        ..SystemConfig::default()
    };
    let mut sys = System::new(config).unwrap();
    for (address, code) in &program.code {
        let bytes: Vec<u8> = code.iter().flat_map(|w| w.to_be_bytes()).collect();
        sys.load_image(&bytes, *address).unwrap();
    }
    for &(address, word) in &program.data {
        sys.write32(address, word);
    }
    sys.reset(program.entry);
    sys.state.msr = program.msr;
    sys.add_breakpoint(program.stop);
    sys.run(Some(50_000_000));
    assert_eq!(sys.state.pc, program.stop, "{} did not reach the stop address", sys.core_name());
    sys
}

fn comparable(state: &GuestState) -> GuestState {
    let mut s = state.clone();
    s.npc = 0;
    s.downcount = 0;
    s
}

/// Run on every core and compare against the interpreter
fn check(program: Program, memory: &[(u32, u32)]) -> GuestState {
    let mut reference = run(CoreMode::Interpreter, &program);
    let expected = comparable(&reference.state);
    let expected_ticks = reference.ticks();
    let expected_mem: Vec<Vec<u8>> = memory.iter().map(|&(a, len)| reference.read_memory(a, len)).collect();

    for core in compiled_cores() {
        let mut sys = run(core, &program);
        assert_eq!(comparable(&sys.state), expected, "{} diverged", sys.core_name());
        assert_eq!(sys.ticks(), expected_ticks, "{} cycle count", sys.core_name());
        for (&(address, len), want) in memory.iter().zip(&expected_mem) {
            assert_eq!(&sys.read_memory(address, len), want, "{} memory at {:#x}", sys.core_name(), address);
        }
    }
    expected
}

#[test]
fn integer_arithmetic_and_logic() {
    let s = check(
        Program::new(vec![
            li(3, 100),
            li(4, -7),
            add(5, 3, 4),
            subf(6, 4, 3),
            neg(7, 4),
            mullw(8, 3, 4),
            and(9, 3, 4),
            or(10, 3, 4),
            xor(11, 3, 4),
            nor(12, 3, 4),
            andc(13, 3, 4),
            andi_rc(14, 4, 0xF0F0),
            ori(15, 3, 0x8000),
            oris(16, 3, 0x1234),
            xori(17, 4, 0xFFFF),
            extsb(18, 8),
            extsh(19, 8),
            rlwinm(20, 4, 8, 4, 27),
            rlwinm_rc(21, 3, 0, 0, 0),
            divw(22, 3, 4),
            srawi(23, 4, 2),
            adde(24, 3, 3),
            cntlzw(25, 3),
            slw(26, 3, 4),
            mtlr(3),
            mflr(27),
            mtctr(4),
            mfctr(28),
            addo(29, 3, 3),
            add_rc(30, 4, 4),
            subf_rc(31, 3, 3),
            mfcr(2),
            nop(),
        ]),
        &[],
    );
    assert_eq!(s.gpr[5], 93);
    assert_eq!(s.gpr[8], (-700i32) as u32);
    assert_eq!(s.gpr[22], (-14i32) as u32);
}

#[test]
fn compares_set_cr_fields() {
    let s = check(
        Program::new(vec![
            li(3, -5),
            li(4, 5),
            cmpw(1, 3, 4),
            cmplw(2, 3, 4),
            cmpwi(3, 3, -5),
            cmplwi(4, 4, 200),
            cmpwi(5, 4, 5),
            cmplw(6, 4, 3),
            nop(),
        ]),
        &[],
    );
    assert_eq!(s.cr, 0x0842_8280);
}

#[test]
fn branches_loops_and_calls() {
    let program = Program::new(vec![
        li(3, 0),       // 0x100
        li(4, 10),      // 0x104
        mtctr(4),       // 0x108
        addi(3, 3, 3),  // 0x10C
        bdnz(-4),       // 0x110
        cmpwi(0, 3, 30), // 0x114
        beq(8),         // 0x118 -> 0x120
        li(5, 1),       // 0x11C
        li(6, 2),       // 0x120
        cmpwi(0, 3, 31), // 0x124
        beq(8),         // 0x128 -> 0x130
        li(7, 3),       // 0x12C
        bl(0xD0),       // 0x130 -> 0x200
        nop(),          // 0x134
    ])
    .with_code(0x200, vec![addi(8, 3, 1), blr()]);
    let s = check(program, &[]);
    assert_eq!((s.gpr[3], s.gpr[5], s.gpr[6], s.gpr[7], s.gpr[8]), (30, 0, 2, 3, 31));
    assert_eq!(s.lr, 0x134);
    assert_eq!(s.ctr, 0);
}

#[test]
fn indirect_branches() {
    let program = Program::new(vec![
        li(3, 0x300),  // 0x100
        mtctr(3),      // 0x104
        bctrl(),       // 0x108 -> 0x300
        li(5, 1),      // 0x10C
        nop(),         // 0x110
    ])
    .with_code(0x300, vec![mflr(4), li(6, 6), blr()]);
    let s = check(program, &[]);
    assert_eq!((s.gpr[4], s.gpr[5], s.gpr[6]), (0x10C, 1, 6));
}

#[test]
fn loads_and_stores() {
    let s = check(
        Program::new(vec![
            li(3, 0x1000),
            lis(4, 0x1234),
            ori(4, 4, 0x5678),
            stw(4, 3, 0),
            lwz(5, 3, 0),
            lbz(6, 3, 1),
            lhz(7, 3, 2),
            li(9, -1),
            stb(9, 3, 4),
            lha(10, 3, 4),
            stwu(4, 3, 8),
            lwzu(11, 3, -8),
            sth(4, 3, 16),
            li(28, 28),
            li(29, 29),
            li(30, 30),
            li(31, 31),
            stmw(28, 3, 32),
            lmw(24, 3, 32),
            li(12, 0x1100),
            stwx(4, 3, 12),
            lwzx(13, 3, 12),
            nop(),
        ]),
        &[(0x1000, 0x40), (0x2100, 4)],
    );
    assert_eq!(s.gpr[5], 0x1234_5678);
    assert_eq!(s.gpr[10], 0xFFFF_FF00);
    assert_eq!(s.gpr[3], 0x1000);
    assert_eq!(s.gpr[13], 0x1234_5678);
}

#[test]
fn floating_point() {
    let program = Program::new(vec![
        li(3, 0x1000),
        lfd(1, 3, 0),
        lfd(2, 3, 8),
        lfs(3, 3, 16),
        fadd(4, 1, 2),
        fsub(5, 1, 2),
        fmul(6, 1, 3),
        fdiv(7, 2, 1),
        fmr(8, 7),
        fneg(9, 4),
        fadds(10, 1, 3),
        fmuls(11, 2, 3),
        fcmpu(1, 1, 2),
        stfd(6, 3, 24),
        stfs(7, 3, 32),
        lwz(4, 3, 24),
        nop(),
    ])
    .with_data(0x1000, &[0x3FF8_0000, 0, 0xC002_0000, 0, 0x4040_0000]);
    let s = check(program, &[(0x1000, 0x28)]);
    assert_eq!(s.fpr[4], -0.75);
    assert_eq!(s.fpr[6], 4.5);
    assert_eq!(s.fpr[7], -1.5);
    assert_eq!(s.fpr[8], -1.5);
}

#[test]
fn exceptions_and_return() {
    let program = Program::new(vec![
        li(3, 0x1000),      // 0x100
        lfd(1, 3, 0),       // 0x104 FPU unavailable, retried
        fadd(2, 1, 1),      // 0x108
        sc(),               // 0x10C
        twi(31, 0, 0),      // 0x110 trap, skipped by the handler
        addi(4, 4, 1),      // 0x114
        nop(),              // 0x118
    ])
    .with_data(0x1000, &[0x4000_0000, 0])
    .with_code(0x700, vec![mfspr(12, SPR_SRR0), addi(12, 12, 4), mtspr(SPR_SRR0, 12), addi(11, 11, 5), rfi()])
    .with_code(0x800, vec![mfspr(21, SPR_SRR1), ori(21, 21, 0x2000), mtspr(SPR_SRR1, 21), addi(20, 20, 1), rfi()])
    .with_code(0xC00, vec![addi(22, 22, 77), rfi()]);
    let program = Program { msr: 0, ..program };
    let s = check(program, &[]);
    assert_eq!((s.gpr[11], s.gpr[20], s.gpr[22], s.gpr[4]), (5, 1, 77, 1));
    assert_eq!(s.fpr[2], 4.0);
    assert_ne!(s.msr & MSR_FP, 0);
}

#[test]
fn data_storage_exception() {
    let entry = 0x8000_0000 | BASE;
    let mut program = Program::new(vec![
        lis(3, 0x9000u16 as i16), // 0x100
        li(4, 0),                 // 0x104
        lwz(4, 3, 0),             // 0x108 DSI
        li(5, 5),                 // 0x10C
        nop(),                    // 0x110
    ])
    .with_code(0x300, vec![mfspr(12, SPR_SRR0), addi(12, 12, 4), mtspr(SPR_SRR0, 12), li(13, 9), rfi()]);
    program.entry = entry;
    program.msr = MSR_FP | MSR_IR | MSR_DR;
    program.stop = entry + 0x10;
    let s = check(program, &[]);
    assert_eq!((s.gpr[4], s.gpr[5], s.gpr[13]), (0, 5, 9));
    assert_eq!(s.dar, 0x9000_0000);
    assert_eq!(s.srr0, entry + 0xC);
}
