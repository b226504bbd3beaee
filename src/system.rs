//! System orchestrator
//!
//! Owns the guest state and every collaborator of the CPU core, and lends
//! them out as a `Machine` for each `run`/`single_step` call.

use std::io::Read;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cpu::interpreter::Interpreter;
use crate::cpu::{CpuControl, CpuCore, CpuState, GuestState, Machine};
use crate::debug::BreakPoints;
use crate::hle::{HleFunction, HookHandle, HookKind, HookRegistry};
use crate::jit::{CachedInterpreter, JitConfig, JitError, JitStats};
use crate::memory::{Bus, Memory, DEFAULT_RAM_SIZE};
use crate::snapshot::{SaveState, SnapshotError};
use crate::timing::{CoreTiming, Scheduler, DEFAULT_SLICE_LENGTH};

/// Largest RAM the physical address map can mirror
const MAX_RAM_SIZE: usize = 256 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum SystemError {
    #[error("invalid RAM size: {0} bytes")]
    InvalidRamSize(usize),

    #[error("image of {len} bytes does not fit at {addr:#010x}")]
    ImageTooLarge { addr: u32, len: usize },

    #[error("image decompression failed: {0}")]
    Decompress(#[from] std::io::Error),

    #[error("{0:?} core is not available in this build")]
    CoreUnavailable(CoreMode),

    #[error(transparent)]
    Jit(#[from] JitError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

/// Execution engine selection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoreMode {
    Interpreter,
    CachedInterpreter,
    Jit64,
}

impl CoreMode {
    /// Fastest core compiled into this build
    pub fn best_available() -> Self {
        if cfg!(all(feature = "jit-x64", target_arch = "x86_64", not(target_arch = "wasm32"))) {
            CoreMode::Jit64
        } else {
            CoreMode::CachedInterpreter
        }
    }
}

impl FromStr for CoreMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "interp" | "interpreter" => Ok(CoreMode::Interpreter),
            "cached" => Ok(CoreMode::CachedInterpreter),
            "jit" | "jit64" => Ok(CoreMode::Jit64),
            _ => Err(format!("unknown core '{}' (expected interp, cached or jit)", s)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemConfig {
    pub ram_size: usize,
    pub core: CoreMode,
    pub jit: JitConfig,
    /// Scheduler slice length in cycles
    pub slice_length: i32,
}

impl Default for SystemConfig {
    fn default() -> Self {
        SystemConfig {
            ram_size: DEFAULT_RAM_SIZE,
            core: CoreMode::best_available(),
            jit: JitConfig::default(),
            slice_length: DEFAULT_SLICE_LENGTH,
        }
    }
}

fn make_core(mode: CoreMode, jit: &JitConfig) -> Result<Box<dyn CpuCore>, SystemError> {
    match mode {
        CoreMode::Interpreter => Ok(Box::new(Interpreter::new())),
        CoreMode::CachedInterpreter => Ok(Box::new(CachedInterpreter::new(jit.clone())?)),
        #[cfg(all(feature = "jit-x64", target_arch = "x86_64", not(target_arch = "wasm32")))]
        CoreMode::Jit64 => Ok(Box::new(crate::jit::Jit64::new(jit.clone())?)),
        #[cfg(not(all(feature = "jit-x64", target_arch = "x86_64", not(target_arch = "wasm32"))))]
        CoreMode::Jit64 => Err(SystemError::CoreUnavailable(mode)),
    }
}

/// Inflate gzip images (magic `1f 8b`); anything else is returned as is
pub fn unpack_image(data: &[u8]) -> Result<Vec<u8>, SystemError> {
    if data.len() >= 2 && data[0] == 0x1f && data[1] == 0x8b {
        let mut decoder = flate2::read::GzDecoder::new(data);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out)?;
        log::info!("[System] inflated gzip image: {} -> {} bytes", data.len(), out.len());
        Ok(out)
    } else {
        Ok(data.to_vec())
    }
}

/// Emulated machine: guest state, RAM, scheduler, debugger and HLE state,
/// and the selected CPU core
pub struct System {
    pub state: GuestState,
    memory: Memory,
    timing: CoreTiming,
    breakpoints: BreakPoints,
    hooks: HookRegistry,
    control: Arc<CpuControl>,
    core: Box<dyn CpuCore>,
    config: SystemConfig,
}

impl System {
    pub fn new(config: SystemConfig) -> Result<Self, SystemError> {
        if config.ram_size == 0 || config.ram_size > MAX_RAM_SIZE || config.ram_size % 4 != 0 {
            return Err(SystemError::InvalidRamSize(config.ram_size));
        }
        config.jit.validate()?;
        let core = make_core(config.core, &config.jit)?;
        log::info!("[System] {} MiB RAM, core {}", config.ram_size / (1024 * 1024), core.name());

        Ok(System {
            state: GuestState::new(),
            memory: Memory::new(config.ram_size),
            timing: CoreTiming::new(config.slice_length),
            breakpoints: BreakPoints::new(),
            hooks: HookRegistry::new(),
            control: Arc::new(CpuControl::new()),
            core,
            config,
        })
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    pub fn core_name(&self) -> &'static str {
        self.core.name()
    }

    /// Switch execution engine; translated code of the old core is dropped
    pub fn set_core(&mut self, mode: CoreMode) -> Result<(), SystemError> {
        self.core = make_core(mode, &self.config.jit)?;
        self.config.core = mode;
        Ok(())
    }

    /// Shared run-state flag, for stopping the CPU from another thread
    pub fn control(&self) -> Arc<CpuControl> {
        Arc::clone(&self.control)
    }

    /// Copy an image (gzip allowed) to physical `paddr`
    pub fn load_image(&mut self, data: &[u8], paddr: u32) -> Result<(), SystemError> {
        let image = unpack_image(data)?;
        self.memory
            .load(paddr, &image)
            .map_err(|_| SystemError::ImageTooLarge { addr: paddr, len: image.len() })?;
        self.core.invalidate(paddr, image.len() as u32);
        log::info!("[System] loaded {} bytes at {:#010x}", image.len(), paddr);
        Ok(())
    }

    /// Power-on reset with execution starting at `entry`
    pub fn reset(&mut self, entry: u32) {
        self.state.reset(entry);
        self.timing.reset();
        self.control.reset();
        self.core.clear_cache();
    }

    /// Run until a breakpoint, a stop request, power-down, or until
    /// `max_cycles` more cycles have elapsed
    pub fn run(&mut self, max_cycles: Option<u64>) -> CpuState {
        let deadline = max_cycles.map(|cycles| self.timing.ticks(&self.state).saturating_add(cycles));
        self.timing.set_deadline(deadline);
        if self.control.resume() {
            let mut m = Machine::new(
                &mut self.state,
                &mut self.memory,
                &mut self.timing,
                &mut self.breakpoints,
                &self.hooks,
                &self.control,
            );
            self.core.run(&mut m);
        }
        self.timing.set_deadline(None);
        // Stopped by the deadline: park the CPU
        self.control.request_step();
        self.control.state()
    }

    /// Execute one block-worth of guest code
    pub fn single_step(&mut self) -> CpuState {
        if self.control.state() != CpuState::PoweredDown {
            let mut m = Machine::new(
                &mut self.state,
                &mut self.memory,
                &mut self.timing,
                &mut self.breakpoints,
                &self.hooks,
                &self.control,
            );
            self.core.single_step(&mut m);
        }
        self.control.state()
    }

    pub fn clear_cache(&mut self) {
        self.core.clear_cache();
    }

    /// Drop translated code for physical `[address, address + length)`,
    /// after the host wrote guest code
    pub fn invalidate(&mut self, address: u32, length: u32) {
        self.core.invalidate(address, length);
    }

    /// Replace the JIT options of the running core
    pub fn set_jit_config(&mut self, jit: JitConfig) -> Result<(), SystemError> {
        self.core.configure(&jit)?;
        self.config.jit = jit;
        Ok(())
    }

    /// Breakpoints are only compiled into blocks in debugging mode, which
    /// the first breakpoint switches on
    pub fn add_breakpoint(&mut self, address: u32) {
        self.breakpoints.add(address);
        if !self.config.jit.enable_debugging {
            let jit = JitConfig { enable_debugging: true, ..self.config.jit.clone() };
            if let Err(e) = self.set_jit_config(jit) {
                log::error!("[System] cannot enable debugging: {}", e);
            }
        }
        // Compiled code only checks addresses known at compile time
        self.core.clear_cache();
    }

    pub fn remove_breakpoint(&mut self, address: u32) -> bool {
        let removed = self.breakpoints.remove(address);
        if removed {
            self.core.clear_cache();
        }
        removed
    }

    pub fn breakpoints(&self) -> &BreakPoints {
        &self.breakpoints
    }

    pub fn register_hook(&mut self, address: u32, name: &'static str, kind: HookKind, function: HleFunction) -> HookHandle {
        let handle = self.hooks.register(address, name, kind, function);
        self.core.clear_cache();
        handle
    }

    pub fn unregister_hook(&mut self, address: u32) -> bool {
        let removed = self.hooks.unregister(address);
        if removed {
            self.core.clear_cache();
        }
        removed
    }

    /// Total emulated cycles
    pub fn ticks(&self) -> u64 {
        self.timing.ticks(&self.state)
    }

    pub fn idled_cycles(&self) -> u64 {
        self.timing.idled_cycles()
    }

    pub fn stats(&self) -> JitStats {
        self.core.stats()
    }

    /// pc, the 32 GPRs, cr, xer, lr, ctr, msr
    pub fn registers(&self) -> Vec<u32> {
        let s = &self.state;
        let mut regs = Vec::with_capacity(38);
        regs.push(s.pc);
        regs.extend_from_slice(&s.gpr);
        regs.extend_from_slice(&[s.cr, s.xer, s.lr, s.ctr, s.msr]);
        regs
    }

    /// Read physical memory for the debugger
    pub fn read_memory(&mut self, paddr: u32, len: u32) -> Vec<u8> {
        (0..len).map(|i| self.memory.read8(paddr.wrapping_add(i))).collect()
    }

    pub fn read32(&mut self, paddr: u32) -> u32 {
        self.memory.read32(paddr)
    }

    /// Host write into guest memory; translated code covering it is dropped
    pub fn write32(&mut self, paddr: u32, value: u32) {
        self.memory.write32(paddr, value);
        self.core.invalidate(paddr, 4);
    }

    pub fn save_state(&self) -> Result<Vec<u8>, SystemError> {
        let save = SaveState::capture(&self.state, self.timing.ticks(&self.state), self.memory.ram());
        Ok(save.to_bytes()?)
    }

    pub fn load_state(&mut self, data: &[u8]) -> Result<(), SystemError> {
        let save = SaveState::from_bytes(data)?;
        if !self.memory.restore(&save.ram) {
            return Err(SnapshotError::RamSize { found: save.ram.len(), expected: self.memory.size() }.into());
        }
        self.state = save.state;
        self.timing.restore(save.ticks, &mut self.state);
        self.control.reset();
        self.core.clear_cache();
        log::info!("[System] restored save-state at tick {}", save.ticks);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::{asm, MSR_FP};

    fn system(core: CoreMode) -> System {
        let config = SystemConfig { ram_size: 0x10000, core, ..SystemConfig::default() };
        System::new(config).unwrap()
    }

    fn load(sys: &mut System, code: &[u32]) {
        let bytes: Vec<u8> = code.iter().flat_map(|w| w.to_be_bytes()).collect();
        sys.load_image(&bytes, 0x100).unwrap();
        sys.reset(0x100);
        sys.state.msr = MSR_FP;
    }

    #[test]
    fn test_rejects_bad_ram_size() {
        let config = SystemConfig { ram_size: 0, ..SystemConfig::default() };
        assert!(matches!(System::new(config), Err(SystemError::InvalidRamSize(0))));
    }

    #[test]
    fn test_core_mode_parse() {
        assert_eq!("cached".parse::<CoreMode>(), Ok(CoreMode::CachedInterpreter));
        assert_eq!("interp".parse::<CoreMode>(), Ok(CoreMode::Interpreter));
        assert!("arm".parse::<CoreMode>().is_err());
    }

    #[test]
    fn test_run_to_breakpoint() {
        let mut sys = system(CoreMode::CachedInterpreter);
        load(&mut sys, &[asm::li(3, 0), asm::addi(3, 3, 1), asm::cmpwi(0, 3, 50), asm::bne(-8), asm::nop()]);
        sys.add_breakpoint(0x110);
        assert_eq!(sys.run(None), CpuState::Stepping);
        assert_eq!(sys.state.gpr[3], 50);
        assert_eq!(sys.state.pc, 0x110);
    }

    #[test]
    fn test_run_stops_at_cycle_budget() {
        let mut sys = system(CoreMode::Interpreter);
        load(&mut sys, &[asm::addi(3, 3, 1), asm::b(-4)]);
        sys.run(Some(5_000));
        assert!(sys.ticks() >= 5_000);
        assert!(sys.ticks() < 5_000 + 100);
        assert!(sys.state.gpr[3] > 0);
    }

    #[test]
    fn test_gzip_image() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let raw: Vec<u8> = [asm::li(3, 9), asm::nop()].iter().flat_map(|w| w.to_be_bytes()).collect();
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&raw).unwrap();
        let packed = encoder.finish().unwrap();

        assert_eq!(unpack_image(&packed).unwrap(), raw);
        let mut sys = system(CoreMode::Interpreter);
        sys.load_image(&packed, 0x200).unwrap();
        assert_eq!(sys.read32(0x200), asm::li(3, 9));
    }

    #[test]
    fn test_image_too_large() {
        let mut sys = system(CoreMode::Interpreter);
        let big = vec![0u8; 0x20000];
        assert!(matches!(sys.load_image(&big, 0), Err(SystemError::ImageTooLarge { .. })));
    }

    #[test]
    fn test_save_and_load_state() {
        let mut sys = system(CoreMode::CachedInterpreter);
        load(&mut sys, &[asm::li(3, 0), asm::addi(3, 3, 1), asm::cmpwi(0, 3, 10), asm::bne(-8), asm::nop()]);
        sys.add_breakpoint(0x110);
        sys.run(None);
        let saved = sys.save_state().unwrap();
        let ticks = sys.ticks();

        sys.reset(0x100);
        sys.write32(0x100, asm::li(3, 99));
        sys.load_state(&saved).unwrap();
        assert_eq!(sys.state.gpr[3], 10);
        assert_eq!(sys.ticks(), ticks);
        assert_eq!(sys.read32(0x100), asm::li(3, 0));
        assert_eq!(sys.state.pc, 0x110);
    }

    #[test]
    fn test_hle_replace_hook() {
        fn answer(state: &mut GuestState, _bus: &mut dyn Bus) {
            state.gpr[3] = 42;
        }
        let mut sys = system(CoreMode::CachedInterpreter);
        load(&mut sys, &[asm::bl(0x100), asm::nop()]);
        sys.write32(0x200, asm::li(3, 1));
        sys.write32(0x204, asm::blr());
        sys.register_hook(0x200, "answer", HookKind::Replace, answer);
        sys.add_breakpoint(0x104);
        sys.run(None);
        assert_eq!(sys.state.pc, 0x104);
        assert_eq!(sys.state.gpr[3], 42);
    }
}
