//! Gekko (PowerPC 750CL) dynamic recompiler
//!
//! A block-translating CPU core with an interpreter, a cached interpreter
//! and a native x86-64 backend, usable natively or from WebAssembly.

use wasm_bindgen::prelude::*;

pub mod cpu;
pub mod debug;
pub mod hle;
pub mod jit;
pub mod memory;
pub mod snapshot;
pub mod system;
pub mod timing;

pub use system::{CoreMode, System, SystemConfig, SystemError};

/// `log` backend writing to the browser console
#[cfg(target_arch = "wasm32")]
struct ConsoleLogger;

#[cfg(target_arch = "wasm32")]
impl log::Log for ConsoleLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = JsValue::from_str(&format!("{} {}", record.level(), record.args()));
        match record.level() {
            log::Level::Error => web_sys::console::error_1(&line),
            log::Level::Warn => web_sys::console::warn_1(&line),
            _ => web_sys::console::log_1(&line),
        }
    }

    fn flush(&self) {}
}

#[cfg(target_arch = "wasm32")]
static LOGGER: ConsoleLogger = ConsoleLogger;

/// Install the console logger and the panic hook
#[wasm_bindgen(start)]
pub fn init() {
    #[cfg(feature = "console_error_panic_hook")]
    console_error_panic_hook::set_once();

    #[cfg(target_arch = "wasm32")]
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(log::LevelFilter::Info);
    }
}

fn js_error(e: impl std::fmt::Display) -> JsValue {
    JsValue::from_str(&e.to_string())
}

/// Main emulator interface exposed to JavaScript
#[wasm_bindgen]
pub struct Emulator {
    system: System,
}

#[wasm_bindgen]
impl Emulator {
    /// Create an emulator with `memory_size_mb` MiB of RAM. `core` is one of
    /// "interp", "cached" or "jit"; empty picks the fastest available.
    #[wasm_bindgen(constructor)]
    pub fn new(memory_size_mb: u32, core: &str) -> Result<Emulator, JsValue> {
        let core = if core.is_empty() { CoreMode::best_available() } else { core.parse().map_err(js_error)? };
        let config = SystemConfig { ram_size: memory_size_mb as usize * 1024 * 1024, core, ..SystemConfig::default() };
        let system = System::new(config).map_err(js_error)?;
        Ok(Emulator { system })
    }

    /// Load an image (raw or gzip) at physical `load_addr`
    pub fn load(&mut self, data: &[u8], load_addr: u32) -> Result<(), JsValue> {
        self.system.load_image(data, load_addr).map_err(js_error)
    }

    /// Power-on reset, execution starting at `entry`
    pub fn reset(&mut self, entry: u32) {
        self.system.reset(entry);
    }

    /// Run for up to `cycles` cycles. Returns the cycles actually executed.
    pub fn run(&mut self, cycles: u32) -> u32 {
        let start = self.system.ticks();
        self.system.run(Some(cycles as u64));
        (self.system.ticks() - start) as u32
    }

    pub fn single_step(&mut self) {
        self.system.single_step();
    }

    pub fn is_powered_down(&self) -> bool {
        self.system.control().state() == cpu::CpuState::PoweredDown
    }

    pub fn clear_cache(&mut self) {
        self.system.clear_cache();
    }

    pub fn invalidate(&mut self, address: u32, length: u32) {
        self.system.invalidate(address, length);
    }

    pub fn add_breakpoint(&mut self, address: u32) {
        self.system.add_breakpoint(address);
    }

    pub fn remove_breakpoint(&mut self, address: u32) -> bool {
        self.system.remove_breakpoint(address)
    }

    pub fn get_pc(&self) -> u32 {
        self.system.state.pc
    }

    pub fn get_ticks(&self) -> f64 {
        self.system.ticks() as f64
    }

    /// pc, r0-r31, cr, xer, lr, ctr, msr
    pub fn get_registers(&self) -> Vec<u32> {
        self.system.registers()
    }

    pub fn get_fprs(&self) -> Vec<f64> {
        self.system.state.fpr.to_vec()
    }

    pub fn read_memory(&mut self, addr: u32, size: u32) -> Vec<u8> {
        self.system.read_memory(addr, size)
    }

    pub fn core_name(&self) -> String {
        self.system.core_name().to_string()
    }

    /// Block-cache counters as a plain JS object
    pub fn get_stats(&self) -> Result<JsValue, JsValue> {
        serde_wasm_bindgen::to_value(&self.system.stats()).map_err(JsValue::from)
    }

    /// Serialize guest state, clock and RAM (compressed with zstd)
    pub fn get_state(&self) -> Result<Vec<u8>, JsValue> {
        self.system.save_state().map_err(js_error)
    }

    /// Restore a blob from `get_state`; translated code is discarded
    pub fn set_state(&mut self, state: &[u8]) -> Result<(), JsValue> {
        self.system.load_state(state).map_err(js_error)
    }
}

/// Decompress zstd-compressed data
/// Useful for loading compressed images in the browser
#[wasm_bindgen]
pub fn decompress_zstd(data: &[u8]) -> Result<Vec<u8>, JsValue> {
    zstd::stream::decode_all(data).map_err(|e| JsValue::from_str(&format!("Zstd decompression error: {}", e)))
}

/// Decompress gzip-compressed data
#[wasm_bindgen]
pub fn decompress_gzip(data: &[u8]) -> Result<Vec<u8>, JsValue> {
    use std::io::Read;

    let mut decoder = flate2::read::GzDecoder::new(data);
    let mut result = Vec::new();
    decoder
        .read_to_end(&mut result)
        .map_err(|e| JsValue::from_str(&format!("Gzip decompression error: {}", e)))?;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::asm;

    fn program(code: &[u32]) -> Vec<u8> {
        code.iter().flat_map(|w| w.to_be_bytes()).collect()
    }

    #[test]
    fn test_emulator_creation() {
        let emu = Emulator::new(1, "cached").unwrap();
        assert_eq!(emu.core_name(), "cached interpreter");
    }

    #[test]
    fn test_run_reports_cycles() {
        let mut emu = Emulator::new(1, "interp").unwrap();
        emu.load(&program(&[asm::addi(3, 3, 1), asm::b(-4)]), 0x100).unwrap();
        emu.reset(0x100);
        let executed = emu.run(1000);
        assert!(executed >= 1000);
        assert!(emu.get_registers()[4] > 0);
    }

    #[test]
    fn test_state_survives_set_state() {
        let mut emu = Emulator::new(1, "cached").unwrap();
        emu.load(&program(&[asm::li(3, 5), asm::li(4, 6), asm::nop()]), 0x100).unwrap();
        emu.reset(0x100);
        emu.add_breakpoint(0x108);
        emu.run(10_000);
        let state = emu.get_state().unwrap();
        assert!(!state.is_empty());

        let mut emu2 = Emulator::new(1, "cached").unwrap();
        emu2.set_state(&state).unwrap();
        assert_eq!(emu.get_registers(), emu2.get_registers());
        assert_eq!(emu2.get_pc(), 0x108);
        assert_eq!(emu.read_memory(0x100, 12), emu2.read_memory(0x100, 12));
    }
}
