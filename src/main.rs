use std::env;
use std::fs;
use std::process;

use otogekko::cpu::{CpuState, MSR_FP};
use otogekko::{CoreMode, System, SystemConfig};

const USAGE: &str = "<image> [--core interp|cached|jit] [--ram <mb>] [--entry <addr>] [--cycles <n>] [--break <addr>] [--no-link]";

/// Images are loaded at this physical address unless `--entry` says otherwise
const DEFAULT_ENTRY: u32 = 0x3100;

struct Options {
    image_path: String,
    core: CoreMode,
    ram_size_mb: usize,
    entry: u32,
    cycles: Option<u64>,
    breakpoints: Vec<u32>,
    no_link: bool,
}

fn parse_number(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|_| format!("invalid number: {}", s))
}

fn parse_address(s: &str) -> Result<u32, String> {
    let value = parse_number(s)?;
    u32::try_from(value).map_err(|_| format!("address out of range: {}", s))
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let mut options = Options {
        image_path: String::new(),
        core: CoreMode::best_available(),
        ram_size_mb: 24,
        entry: DEFAULT_ENTRY,
        cycles: None,
        breakpoints: Vec::new(),
        no_link: false,
    };

    let mut i = 1;
    while i < args.len() {
        let arg = args[i].clone();
        let mut value = |name: &str| -> Result<String, String> {
            i += 1;
            args.get(i).cloned().ok_or_else(|| format!("{} needs a value", name))
        };
        match arg.as_str() {
            "--core" => options.core = value("--core")?.parse()?,
            "--ram" => options.ram_size_mb = parse_number(&value("--ram")?)? as usize,
            "--entry" => options.entry = parse_address(&value("--entry")?)?,
            "--cycles" => options.cycles = Some(parse_number(&value("--cycles")?)?),
            "--break" => options.breakpoints.push(parse_address(&value("--break")?)?),
            "--no-link" => options.no_link = true,
            arg if !arg.starts_with('-') => options.image_path = arg.to_string(),
            arg => return Err(format!("unknown argument: {}", arg)),
        }
        i += 1;
    }

    if options.image_path.is_empty() {
        return Err("no image given".to_string());
    }
    Ok(options)
}

fn run(options: Options) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = SystemConfig { ram_size: options.ram_size_mb * 1024 * 1024, core: options.core, ..SystemConfig::default() };
    config.jit = otogekko::jit::JitConfig::from_env();
    if options.no_link {
        config.jit.enable_block_link = false;
    }

    let mut system = System::new(config)?;
    let image = fs::read(&options.image_path)?;
    system.load_image(&image, options.entry)?;
    system.reset(options.entry);
    system.state.msr = MSR_FP;
    for &address in &options.breakpoints {
        system.add_breakpoint(address);
    }

    println!("OtoGekko CLI");
    println!("Image: {} at {:#010x}", options.image_path, options.entry);
    println!("Core: {}", system.core_name());
    println!("-------------------------------------");

    let state = system.run(options.cycles);

    let regs = system.registers();
    println!("-------------------------------------");
    println!("Stopped ({:?}) at pc={:#010x} after {} cycles", state, system.state.pc, system.ticks());
    for row in 0..8 {
        let line: Vec<String> = (0..4)
            .map(|col| {
                let r = row * 4 + col;
                format!("r{:<2}={:08x}", r, regs[1 + r])
            })
            .collect();
        println!("{}", line.join("  "));
    }
    println!("cr={:08x} xer={:08x} lr={:08x} ctr={:08x} msr={:08x}", regs[33], regs[34], regs[35], regs[36], regs[37]);

    let stats = system.stats();
    println!(
        "blocks: {} compiled, {} hits, {} misses, {} clears, {} invalidated",
        stats.compiles, stats.hits, stats.misses, stats.clears, stats.invalidated_blocks
    );
    if state == CpuState::PoweredDown {
        return Err("CPU powered down".into());
    }
    Ok(())
}

fn main() {
    #[cfg(not(target_arch = "wasm32"))]
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = env::args().collect();
    let options = match parse_args(&args) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("{}", e);
            eprintln!("Usage: {} {}", args.first().map(String::as_str).unwrap_or("otogekko"), USAGE);
            process::exit(1);
        }
    };

    if let Err(e) = run(options) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}
