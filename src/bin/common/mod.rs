use anyhow::Result;
use log::{LevelFilter, Log, Metadata, Record};

struct StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{:<5} {}] {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

pub fn parse_log_level(value: &str) -> Result<LevelFilter> {
    value
        .parse::<LevelFilter>()
        .map_err(|_| anyhow::anyhow!("invalid --log-level value: {value}"))
}

pub fn init_logger(level: LevelFilter) -> Result<()> {
    log::set_logger(&LOGGER)
        .map_err(|err| anyhow::anyhow!("failed to install logger: {err}"))?;
    log::set_max_level(level);
    Ok(())
}
