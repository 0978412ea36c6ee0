mod common;

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use log::LevelFilter;
use nescore::nes::config::{Config as NesConfig, TvSystem};
use nescore::nes::cpu::CpuRegisters;
use nescore::nes::{
    BUTTON_A, BUTTON_B, BUTTON_DOWN, BUTTON_LEFT, BUTTON_RIGHT, BUTTON_SELECT, BUTTON_START,
    BUTTON_UP, Nes, frame_digest,
};
use serde::Serialize;

#[derive(Debug, Clone)]
struct Config {
    rom: Option<PathBuf>,
    iterations: u32,
    frames_per_iteration: u32,
    input_period: u32,
    seed: u32,
    nes: NesConfig,
    log_level: LevelFilter,
    json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rom: None,
            iterations: 1,
            frames_per_iteration: 600,
            input_period: 15,
            seed: 0xC47D0E8A,
            nes: NesConfig::default(),
            log_level: LevelFilter::Warn,
            json: false,
        }
    }
}

#[derive(Debug, Serialize)]
struct RunSummary {
    iteration: u32,
    tv_system: TvSystem,
    frames: u64,
    cpu_cycles: u64,
    halted: bool,
    registers: CpuRegisters,
    scanline: u16,
    cycle: u16,
    mapper: &'static str,
    digest: String,
}

fn parse_u32(args: &mut impl Iterator<Item = String>, flag: &str, example: &str) -> Result<u32> {
    let value = args
        .next()
        .with_context(|| format!("{flag} requires an integer, e.g. {flag} {example}"))?;
    let parsed = match value.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse::<u32>(),
    };
    parsed.with_context(|| format!("invalid {flag} value: {value}"))
}

fn parse_args() -> Result<Config> {
    let mut cfg = Config::default();
    let mut args = std::env::args().skip(1);
    let mut force_pal = false;
    let mut no_idle_skip = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--rom" => {
                let value = args
                    .next()
                    .context("--rom requires a path, e.g. --rom roms/smb.nes")?;
                cfg.rom = Some(PathBuf::from(value));
            }
            "--iterations" => cfg.iterations = parse_u32(&mut args, "--iterations", "10")?,
            "--frames" => cfg.frames_per_iteration = parse_u32(&mut args, "--frames", "1800")?,
            "--input-period" => cfg.input_period = parse_u32(&mut args, "--input-period", "15")?,
            "--seed" => cfg.seed = parse_u32(&mut args, "--seed", "0xC47D0E8A")?,
            "--config" => {
                let value = args
                    .next()
                    .context("--config requires a path, e.g. --config nes.json")?;
                cfg.nes = NesConfig::from_file(Path::new(&value))?;
            }
            "--pal" => force_pal = true,
            "--no-idle-skip" => no_idle_skip = true,
            "--log-level" => {
                let value = args
                    .next()
                    .context("--log-level requires a level, e.g. --log-level debug")?;
                cfg.log_level = common::parse_log_level(&value)?;
            }
            "--json" => cfg.json = true,
            "--help" | "-h" => {
                println!(
                    "nescore_frames\n\n\
Usage:\n\
  cargo run --release --bin nescore_frames -- --rom <path> [options]\n\n\
Options:\n\
  --rom <path>          iNES image to run (required)\n\
  --iterations <n>      Number of independent runs (default 1)\n\
  --frames <n>          Frames per run (default 600)\n\
  --input-period <n>    Frames between pseudo-random input changes, 0 disables input (default 15)\n\
  --seed <n>            Input generator seed, decimal or 0x-prefixed hex\n\
  --config <path>       JSON session config ({{\"tv_system\": \"pal\", \"idle_loop_skip\": false}})\n\
  --pal                 Force PAL timing\n\
  --no-idle-skip        Disable the idle-loop fast path\n\
  --log-level <level>   off, error, warn, info, debug or trace (default warn)\n\
  --json                Print run summaries as JSON\n\
  -h, --help            Show this help\n"
                );
                std::process::exit(0);
            }
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }

    // Command-line switches win over the config file regardless of order.
    if force_pal {
        cfg.nes.tv_system = TvSystem::Pal;
    }
    if no_idle_skip {
        cfg.nes.idle_loop_skip = false;
    }

    Ok(cfg)
}

fn next_state(seed: &mut u32) -> u8 {
    // Xorshift32
    let mut x = *seed;
    x ^= x << 13;
    x ^= x >> 17;
    x ^= x << 5;
    *seed = x;

    let buttons = [
        BUTTON_UP,
        BUTTON_DOWN,
        BUTTON_LEFT,
        BUTTON_RIGHT,
        BUTTON_A,
        BUTTON_B,
        BUTTON_START,
        BUTTON_SELECT,
    ];
    let mut state = buttons
        .iter()
        .enumerate()
        .filter(|(bit, _)| x & (1 << bit) != 0)
        .fold(0u8, |acc, (_, &button)| acc | button);

    // A real pad can't press opposite directions.
    if state & BUTTON_UP != 0 {
        state &= !BUTTON_DOWN;
    }
    if state & BUTTON_LEFT != 0 {
        state &= !BUTTON_RIGHT;
    }

    state
}

fn run_once(cfg: &Config, rom: &Path, iteration: u32, seed: &mut u32) -> Result<RunSummary> {
    let mut nes = Nes::from_rom_path(rom, cfg.nes.clone())
        .with_context(|| format!("failed to load ROM {}", rom.display()))?;
    let pad = nes.controller_handle();

    for frame in 0..cfg.frames_per_iteration {
        // Bursty input: one state for a frame, then released.
        let state = if cfg.input_period != 0 && frame % cfg.input_period == 0 {
            next_state(seed)
        } else {
            0
        };
        pad.set(state);
        nes.run_frame();
    }

    let (scanline, cycle) = nes.ppu_position();
    Ok(RunSummary {
        iteration: iteration + 1,
        tv_system: nes.config().tv_system,
        frames: nes.frame_count(),
        cpu_cycles: nes.total_cpu_cycles(),
        halted: nes.cpu_halted(),
        registers: nes.cpu_registers(),
        scanline,
        cycle,
        mapper: nes.mapper_name(),
        digest: frame_digest(nes.frame_buffer()),
    })
}

fn main() -> Result<()> {
    let cfg = parse_args()?;
    common::init_logger(cfg.log_level)?;
    let rom = cfg
        .rom
        .clone()
        .context("--rom is required; use --help to view supported options")?;

    let start = Instant::now();
    let mut seed = cfg.seed;
    let mut summaries = Vec::new();
    let mut failures = 0u64;

    for i in 0..cfg.iterations {
        match run_once(&cfg, &rom, i, &mut seed) {
            Ok(summary) => {
                if !cfg.json {
                    let r = &summary.registers;
                    println!(
                        "iter={:03} frames={} cycles={} halted={} pc=${:04X} a=${:02X} x=${:02X} y=${:02X} p=${:02X} sp=${:02X} digest={}",
                        summary.iteration,
                        summary.frames,
                        summary.cpu_cycles,
                        summary.halted,
                        r.pc,
                        r.a,
                        r.x,
                        r.y,
                        r.p,
                        r.sp,
                        summary.digest
                    );
                }
                summaries.push(summary);
            }
            Err(err) => {
                failures += 1;
                eprintln!("iter={:03} ERROR: {err:#}", i + 1);
            }
        }
    }

    if cfg.json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
    } else {
        let halted_runs = summaries.iter().filter(|s| s.halted).count();
        let distinct = {
            let mut digests: Vec<&str> = summaries.iter().map(|s| s.digest.as_str()).collect();
            digests.sort_unstable();
            digests.dedup();
            digests.len()
        };
        println!();
        println!("Run Summary");
        println!("- rom: {}", rom.display());
        println!("- tv system: {:?}", cfg.nes.tv_system);
        println!("- idle-loop skip: {}", cfg.nes.idle_loop_skip);
        println!("- iterations: {}", cfg.iterations);
        println!("- frames/iter: {}", cfg.frames_per_iteration);
        println!("- load failures: {}", failures);
        println!("- halted runs: {}", halted_runs);
        println!("- distinct final frames: {}", distinct);
        println!("- elapsed: {:.2}s", start.elapsed().as_secs_f32());
    }

    if failures > 0 {
        anyhow::bail!("frame runner encountered {failures} failed iteration(s)");
    }
    Ok(())
}
