use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;

use common::cli::GlobalOpts;
use dsp::regs::Reg;
use dsp::{interpreter, DspContext};
use jit::{Breakpoints, Jit, JitConfig, StopReason};

/// Runs a DSP microcode image through the block translator
#[derive(Debug, Parser)]
#[command(disable_help_flag = true, disable_version_flag = true)]
struct Cli {
    /// Raw big endian microcode image, loaded into IRAM at 0
    image: PathBuf,

    /// Total cycle budget
    #[arg(long, default_value_t = 1_000_000)]
    cycles: i32,

    /// Cycles per dispatcher run
    #[arg(long, default_value_t = 10_000)]
    slice: i32,

    #[arg(long)]
    no_idle_skip: bool,

    #[arg(long)]
    no_link: bool,

    /// Keep accumulators in memory between instructions
    #[arg(long)]
    no_pin: bool,

    /// Run compiled blocks on the portable executor instead of emitting machine code
    #[arg(long)]
    no_native: bool,

    #[arg(long, default_value_t = 250)]
    max_block_size: usize,

    /// Stop when the DSP reaches this address (hex)
    #[arg(long = "break", value_parser = parse_addr)]
    breakpoints: Vec<u16>,

    #[command(flatten)]
    global: GlobalOpts,
}

fn parse_addr(s: &str) -> Result<u16, String> {
    let digits = s.trim_start_matches("0x");
    u16::from_str_radix(digits, 16).map_err(|e| format!("bad address {:?}: {}", s, e))
}

fn init_logging(global: &GlobalOpts) {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(level) = global.log_level {
        builder.parse_filters(level.filter_str());
    }
    builder.init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.global);
    if cli.slice <= 0 {
        bail!("--slice must be positive");
    }

    let bytes = std::fs::read(&cli.image).with_context(|| format!("reading {}", cli.image.display()))?;
    let mut ctx = DspContext::default();
    dsp::load_image(&mut ctx, &bytes).with_context(|| format!("loading {}", cli.image.display()))?;
    log::info!("Loaded {} words from {}", bytes.len() / 2, cli.image.display());

    if cli.global.interpreter {
        let left = interpreter::run_cycles(&mut ctx, cli.cycles);
        log::info!("Interpreter stopped with {} cycles left", left);
        dump(&ctx);
        return Ok(());
    }

    let config = JitConfig {
        max_block_size: cli.max_block_size,
        idle_skip: !cli.no_idle_skip,
        link_blocks: !cli.no_link,
        pin_composites: !cli.no_pin,
        native_code: JitConfig::default().native_code && !cli.no_native,
        ..JitConfig::default()
    };
    let mut jit = Jit::new(config).context("configuring the translator")?;
    let breakpoints: Breakpoints = cli.breakpoints.iter().copied().collect();

    let mut budget = cli.cycles;
    while budget > 0 && !ctx.is_halted() {
        let slice = budget.min(cli.slice);
        let used = if breakpoints.is_empty() {
            slice - jit.run_for_cycles(&mut ctx, slice)
        } else {
            let reason = jit.run_until_breakpoint(&mut ctx, slice, &breakpoints);
            // the whole slice is left over when the DSP was already halted
            let used = slice - ctx.cycles_left;
            if let StopReason::Breakpoint(addr) = reason {
                log::info!("Breakpoint at {:04x}", addr);
                budget = 0;
            }
            used
        };
        if budget > 0 {
            budget -= used.max(1);
        }
    }

    if ctx.is_halted() {
        log::info!("DSP halted at {:04x}", ctx.pc);
    }
    dump(&ctx);
    println!("{:#?}", jit.stats());
    Ok(())
}

fn dump(ctx: &DspContext) {
    println!("pc {:04x}", ctx.pc);
    for row in 0..8u16 {
        let line: Vec<String> = (0..4)
            .map(|col| {
                let reg = Reg::from_index(row * 4 + col);
                format!("{:>5} {:04x}", reg.name(), ctx.regs.get(reg))
            })
            .collect();
        println!("{}", line.join("  "));
    }
}
