mod common;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use log::LevelFilter;
use nescore::nes::config::{Config as NesConfig, TvSystem};
use nescore::nes::{Nes, frame_digest};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

// One `<test>` entry of the manifest:
//
// <tests>
//   <test filename="cpu/official.nes" runframes="600" system="ntsc">
//     <framesha1>2jmj7l5rSw0yVb/vlWAYkK/YBwk=</framesha1>
//   </test>
// </tests>
#[derive(Debug, Clone)]
struct ManifestTest {
    filename: String,
    tv_system: TvSystem,
    runframes: u32,
    framesha1: String,
}

#[derive(Debug, Clone)]
struct Config {
    suite: PathBuf,
    rom_root: PathBuf,
    max_tests: usize,
    include_pal: bool,
    contains: Vec<String>,
    idle_loop_skip: bool,
    log_level: LevelFilter,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            suite: PathBuf::from("tests/roms/manifest.xml"),
            rom_root: PathBuf::from("tests/roms"),
            max_tests: usize::MAX,
            include_pal: false,
            contains: Vec::new(),
            idle_loop_skip: true,
            log_level: LevelFilter::Warn,
        }
    }
}

fn parse_args() -> Result<Config> {
    let mut cfg = Config::default();
    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--suite" => {
                let value = args
                    .next()
                    .context("--suite requires a path, e.g. --suite tests/roms/manifest.xml")?;
                cfg.suite = PathBuf::from(value);
            }
            "--rom-root" => {
                let value = args
                    .next()
                    .context("--rom-root requires a path, e.g. --rom-root tests/roms")?;
                cfg.rom_root = PathBuf::from(value);
            }
            "--max-tests" => {
                let value = args
                    .next()
                    .context("--max-tests requires an integer, e.g. --max-tests 120")?;
                cfg.max_tests = value
                    .parse::<usize>()
                    .with_context(|| format!("invalid --max-tests value: {value}"))?;
            }
            "--include-pal" => cfg.include_pal = true,
            "--contains" => {
                let value = args
                    .next()
                    .context("--contains requires a substring, e.g. --contains vbl_nmi")?;
                cfg.contains.push(value.to_lowercase());
            }
            "--no-idle-skip" => cfg.idle_loop_skip = false,
            "--log-level" => {
                let value = args
                    .next()
                    .context("--log-level requires a level, e.g. --log-level info")?;
                cfg.log_level = common::parse_log_level(&value)?;
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => {
                anyhow::bail!("unknown argument: {other}\nUse --help to view supported options.");
            }
        }
    }

    Ok(cfg)
}

fn print_help() {
    println!(
        "Golden-frame ROM runner for nescore\n\n\
Usage:\n\
  cargo run --release --bin rom_test_runner -- [options]\n\n\
Options:\n\
  --suite <path>                 Manifest XML (default tests/roms/manifest.xml)\n\
  --rom-root <path>              Directory ROM filenames are relative to (default tests/roms)\n\
  --max-tests <n>                Maximum number of tests to run\n\
  --include-pal                  Include entries marked system=\"pal\"\n\
  --contains <substr>            Only run tests whose filename contains this text (repeatable)\n\
  --no-idle-skip                 Disable the idle-loop fast path\n\
  --log-level <level>            off, error, warn, info, debug or trace (default warn)\n\
  -h, --help                     Show this help\n"
    );
}

fn parse_test_start(e: &BytesStart, reader: &Reader<&[u8]>) -> Result<ManifestTest> {
    let mut test = ManifestTest {
        filename: String::new(),
        tv_system: TvSystem::Ntsc,
        runframes: 0,
        framesha1: String::new(),
    };

    for attr in e.attributes() {
        let attr = attr.context("malformed <test> attribute")?;
        let value = attr
            .decode_and_unescape_value(reader.decoder())
            .context("undecodable <test> attribute")?;
        match attr.key.as_ref() {
            b"filename" => test.filename = value.to_string(),
            b"runframes" => {
                test.runframes = value
                    .parse::<u32>()
                    .with_context(|| format!("invalid runframes value: {value}"))?;
            }
            b"system" => {
                test.tv_system = if value.eq_ignore_ascii_case("pal") {
                    TvSystem::Pal
                } else {
                    TvSystem::Ntsc
                };
            }
            _ => {}
        }
    }

    if test.filename.is_empty() {
        anyhow::bail!("<test> entry is missing its filename attribute");
    }
    Ok(test)
}

fn parse_manifest(xml: &str) -> Result<Vec<ManifestTest>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut tests = Vec::new();
    let mut current: Option<ManifestTest> = None;
    let mut reading_sha1 = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.name().as_ref() {
                b"test" => current = Some(parse_test_start(&e, &reader)?),
                b"framesha1" => reading_sha1 = true,
                _ => {}
            },
            Ok(Event::Empty(e)) if e.name().as_ref() == b"test" => {
                // No digest recorded; kept so the run still reports it.
                tests.push(parse_test_start(&e, &reader)?);
            }
            Ok(Event::Text(e)) => {
                if let (true, Some(test)) = (reading_sha1, current.as_mut()) {
                    let text = e.decode().context("undecodable <framesha1> text")?;
                    test.framesha1.push_str(&text);
                }
            }
            Ok(Event::End(e)) => match e.name().as_ref() {
                b"framesha1" => reading_sha1 = false,
                b"test" => {
                    if let Some(mut test) = current.take() {
                        test.framesha1 = test.framesha1.trim().to_string();
                        tests.push(test);
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(err) => {
                anyhow::bail!(
                    "failed to parse manifest XML at byte {}: {err}",
                    reader.error_position()
                );
            }
            _ => {}
        }
    }

    Ok(tests)
}

fn load_manifest(path: &Path) -> Result<Vec<ManifestTest>> {
    let xml = fs::read_to_string(path)
        .with_context(|| format!("failed to read manifest XML: {}", path.display()))?;
    parse_manifest(&xml)
}

fn should_run(test: &ManifestTest, cfg: &Config) -> bool {
    if !cfg.include_pal && test.tv_system == TvSystem::Pal {
        return false;
    }

    if !cfg.contains.is_empty() {
        let lower = test.filename.to_lowercase();
        if !cfg.contains.iter().any(|f| lower.contains(f)) {
            return false;
        }
    }

    true
}

fn run_single(test: &ManifestTest, cfg: &Config) -> Result<String> {
    let rom_path = cfg.rom_root.join(&test.filename);
    let config = NesConfig {
        tv_system: test.tv_system,
        idle_loop_skip: cfg.idle_loop_skip,
    };
    let mut nes = Nes::from_rom_path(&rom_path, config)
        .with_context(|| format!("failed to load ROM {}", rom_path.display()))?;

    for _ in 0..test.runframes {
        nes.run_frame();
    }

    Ok(frame_digest(nes.frame_buffer()))
}

fn main() -> Result<()> {
    let cfg = parse_args()?;
    common::init_logger(cfg.log_level)?;

    let start = Instant::now();
    let tests = load_manifest(&cfg.suite)?;

    let selected: Vec<ManifestTest> = tests
        .into_iter()
        .filter(|t| should_run(t, &cfg))
        .take(cfg.max_tests)
        .collect();

    println!(
        "Running {} test(s) from {}",
        selected.len(),
        cfg.suite.display()
    );

    let mut passed = 0usize;
    let mut failed = 0usize;
    let mut skipped = 0usize;

    for (idx, test) in selected.iter().enumerate() {
        let label = format!("[{}/{}] {}", idx + 1, selected.len(), test.filename);
        match run_single(test, &cfg) {
            Ok(digest) if digest == test.framesha1 => {
                passed += 1;
                println!("PASS {label}");
            }
            Ok(digest) => {
                failed += 1;
                println!(
                    "FAIL {label} after {} frame(s)\n  expected: {}\n  got     : {}",
                    test.runframes, test.framesha1, digest
                );
            }
            Err(err) => {
                skipped += 1;
                println!("SKIP {label} -> {err:#}");
            }
        }
    }

    let elapsed = start.elapsed().as_secs_f32();
    println!();
    println!("Summary:");
    println!("- Passed: {passed}");
    println!("- Failed: {failed}");
    println!("- Skipped: {skipped}");
    println!("- Runtime: {:.2}s", elapsed);

    if failed > 0 {
        anyhow::bail!("{failed} test(s) produced an unexpected frame");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_entries_are_parsed() {
        let xml = r#"<?xml version="1.0"?>
<tests>
  <test filename="cpu/nestest.nes" runframes="60" system="ntsc">
    <framesha1> abc= </framesha1>
  </test>
  <test filename="ppu/pal_timing.nes" runframes="120" system="PAL">
    <framesha1>def=</framesha1>
  </test>
  <test filename="blank.nes" runframes="1"/>
</tests>"#;
        let tests = parse_manifest(xml).unwrap();
        assert_eq!(tests.len(), 3);
        assert_eq!(tests[0].filename, "cpu/nestest.nes");
        assert_eq!(tests[0].runframes, 60);
        assert_eq!(tests[0].framesha1, "abc=");
        assert_eq!(tests[0].tv_system, TvSystem::Ntsc);
        assert_eq!(tests[1].tv_system, TvSystem::Pal);
        assert_eq!(tests[2].filename, "blank.nes");
        assert!(tests[2].framesha1.is_empty());
    }

    #[test]
    fn bad_runframes_is_rejected() {
        let xml = r#"<tests><test filename="a.nes" runframes="lots"/></tests>"#;
        assert!(parse_manifest(xml).is_err());
    }

    #[test]
    fn pal_entries_are_filtered_by_default() {
        let xml = r#"<tests>
  <test filename="Cpu/A.nes" runframes="1" system="ntsc"><framesha1>x</framesha1></test>
  <test filename="b.nes" runframes="1" system="pal"><framesha1>y</framesha1></test>
</tests>"#;
        let tests = parse_manifest(xml).unwrap();
        let mut cfg = Config::default();
        assert!(should_run(&tests[0], &cfg));
        assert!(!should_run(&tests[1], &cfg));

        cfg.include_pal = true;
        cfg.contains.push("cpu/".to_string());
        assert!(should_run(&tests[0], &cfg));
        assert!(!should_run(&tests[1], &cfg));
    }
}
