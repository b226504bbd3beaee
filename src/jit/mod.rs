//! Block JIT
//!
//! Guest code is translated one block at a time. The pipeline is
//! backend-agnostic up to the point where instructions are emitted:
//!
//! - `analyzer`: decodes a run of guest instructions into a `CodeBlock`
//! - `compiler`: walks the block and decides which checkpoints each
//!   instruction needs, then drives a `BlockBackend` to emit it
//! - `block_cache`: owns compiled blocks, links exits, invalidates by
//!   physical address
//! - `dispatcher`: the run loop (`CpuCore` implementation)
//!
//! Two backends exist: `cached_interp` (a list of tagged operations run by a
//! small dispatch loop, works everywhere) and `x64` (native x86-64 code).

pub mod analyzer;
pub mod block_cache;
pub mod cached_interp;
pub mod compiler;
pub mod dispatcher;
pub mod regcache;
#[cfg(all(feature = "jit-x64", target_arch = "x86_64", not(target_arch = "wasm32")))]
pub mod x64;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use analyzer::{Analyzer, CodeBlock};
use block_cache::BlockCache;
use compiler::BlockBackend;

/// Errors raised by the translation machinery itself (never by guest code)
#[derive(Debug, Error)]
pub enum JitError {
    #[error("code buffer full: block needs {needed} bytes, {available} available")]
    CodeBufferFull { needed: usize, available: usize },

    #[error("executable memory mapping failed: {0}")]
    Mapping(#[from] std::io::Error),

    #[error("code buffer is unusable after a failed protection change")]
    BufferLost,

    #[error("code patch at {0:#x} is outside emitted code")]
    BadPatch(usize),

    #[error("invalid JIT configuration: {0}")]
    InvalidConfig(String),

    #[error("register cache exhausted: all {0} host registers locked")]
    RegistersExhausted(usize),

    #[cfg(all(feature = "jit-x64", target_arch = "x86_64", not(target_arch = "wasm32")))]
    #[error("assembler: {0}")]
    Assembler(#[from] dynasmrt::DynasmError),
}

/// Options affecting how blocks are compiled and cached
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JitConfig {
    /// Instruction cap per block
    pub max_block_size: u32,
    /// Bytes of executable memory (or op storage for the cached interpreter)
    pub code_buffer_size: usize,
    /// Clear the whole cache when less than this much space is left
    pub clear_margin: usize,
    pub enable_block_link: bool,
    /// Conditional branches in the middle of a block only exit when taken
    pub conditional_continue: bool,
    pub idle_skip: bool,
    /// Check for DSI after every load/store
    pub memcheck: bool,
    /// Compile breakpoint checks into blocks
    pub enable_debugging: bool,
    /// Recompile every block on every dispatch (debug aid)
    pub no_block_cache: bool,
}

impl Default for JitConfig {
    fn default() -> Self {
        JitConfig {
            max_block_size: 100,
            code_buffer_size: 32 * 1024 * 1024,
            clear_margin: 64 * 1024,
            enable_block_link: true,
            conditional_continue: true,
            idle_skip: true,
            memcheck: true,
            enable_debugging: false,
            no_block_cache: false,
        }
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name).is_ok()
}

impl JitConfig {
    /// Defaults overlaid with `GEKKO_JIT_*` environment switches
    pub fn from_env() -> Self {
        let mut config = JitConfig::default();
        if let Some(n) = std::env::var("GEKKO_JIT_MAX_BLOCK").ok().and_then(|v| v.parse().ok()) {
            config.max_block_size = n;
        }
        if let Some(mb) = std::env::var("GEKKO_JIT_CODE_SIZE").ok().and_then(|v| v.parse::<usize>().ok()) {
            config.code_buffer_size = mb * 1024 * 1024;
        }
        if env_flag("GEKKO_JIT_NO_LINK") {
            config.enable_block_link = false;
        }
        if env_flag("GEKKO_JIT_NO_IDLE_SKIP") {
            config.idle_skip = false;
        }
        if env_flag("GEKKO_JIT_DEBUG") {
            config.enable_debugging = true;
        }
        if env_flag("GEKKO_JIT_NO_CACHE") {
            config.no_block_cache = true;
        }
        config
    }

    pub fn validate(&self) -> Result<(), JitError> {
        if self.max_block_size == 0 || self.max_block_size > 1024 {
            return Err(JitError::InvalidConfig(format!("max_block_size {} out of range 1..=1024", self.max_block_size)));
        }
        if self.code_buffer_size < 256 * 1024 {
            return Err(JitError::InvalidConfig(format!("code_buffer_size {} below 256 KiB", self.code_buffer_size)));
        }
        if self.clear_margin >= self.code_buffer_size / 2 {
            return Err(JitError::InvalidConfig(format!(
                "clear_margin {} must be less than half the code buffer",
                self.clear_margin
            )));
        }
        Ok(())
    }

    /// Whether switching from `self` to `other` makes compiled code stale
    fn affects_compilation(&self, other: &JitConfig) -> bool {
        self.max_block_size != other.max_block_size
            || self.enable_block_link != other.enable_block_link
            || self.conditional_continue != other.conditional_continue
            || self.idle_skip != other.idle_skip
            || self.memcheck != other.memcheck
            || self.enable_debugging != other.enable_debugging
    }
}

/// Counters reported by `CpuCore::stats`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JitStats {
    pub compiles: u64,
    pub hits: u64,
    pub misses: u64,
    pub clears: u64,
    pub invalidated_blocks: u64,
    /// Blocks entered from the dispatcher (linked blocks are not counted)
    pub executed_blocks: u64,
}

/// JIT context: everything the compiler and dispatcher share, owned by the
/// execution thread.
pub struct Jit<B: BlockBackend> {
    config: JitConfig,
    analyzer: Analyzer,
    code_block: CodeBlock,
    cache: BlockCache<B::Code>,
    backend: B,
    stats: JitStats,
}

impl<B: BlockBackend> Jit<B> {
    pub fn with_backend(config: JitConfig, backend: B) -> Self {
        let analyzer = Analyzer::new(&config);
        Jit { config, analyzer, code_block: CodeBlock::default(), cache: BlockCache::new(), backend, stats: JitStats::default() }
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    /// Replace the configuration. Compiled code is dropped when the new
    /// options change how blocks would be compiled.
    pub fn set_config(&mut self, config: JitConfig) -> Result<(), JitError> {
        config.validate()?;
        let stale = self.config.affects_compilation(&config);
        self.analyzer = Analyzer::new(&config);
        self.config = config;
        if stale {
            log::info!("[JIT] configuration changed, clearing cache");
            self.clear_all();
        }
        Ok(())
    }

    pub fn cache(&self) -> &BlockCache<B::Code> {
        &self.cache
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn clear_all(&mut self) {
        self.cache.clear();
        self.backend.clear_code();
        self.stats.clears += 1;
    }
}

/// Cached interpreter: available on every host
pub type CachedInterpreter = Jit<cached_interp::CachedInterpBackend>;

impl CachedInterpreter {
    pub fn new(config: JitConfig) -> Result<Self, JitError> {
        config.validate()?;
        let backend = cached_interp::CachedInterpBackend::new(config.code_buffer_size);
        Ok(Jit::with_backend(config, backend))
    }
}

#[cfg(all(feature = "jit-x64", target_arch = "x86_64", not(target_arch = "wasm32")))]
pub type Jit64 = Jit<x64::Jit64Backend>;

#[cfg(all(feature = "jit-x64", target_arch = "x86_64", not(target_arch = "wasm32")))]
impl Jit64 {
    pub fn new(config: JitConfig) -> Result<Self, JitError> {
        config.validate()?;
        let backend = x64::Jit64Backend::new(config.code_buffer_size)?;
        Ok(Jit::with_backend(config, backend))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(JitConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = JitConfig { max_block_size: 0, ..JitConfig::default() };
        assert!(matches!(config.validate(), Err(JitError::InvalidConfig(_))));
        let config = JitConfig { clear_margin: 32 * 1024 * 1024, ..JitConfig::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_change_clears_cache() {
        let mut jit = CachedInterpreter::new(JitConfig::default()).unwrap();
        let clears = jit.stats.clears;
        jit.set_config(JitConfig { no_block_cache: true, ..JitConfig::default() }).unwrap();
        assert_eq!(jit.stats.clears, clears);
        jit.set_config(JitConfig { max_block_size: 10, ..JitConfig::default() }).unwrap();
        assert_eq!(jit.stats.clears, clears + 1);
    }
}
