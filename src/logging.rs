//! `log` backend printing `[LEVEL] message` lines on the kernel console.
//!
//! The maximum level comes from the `LOG` environment variable at build time
//! (`ERROR`, `WARN`, `INFO`, `DEBUG` or `TRACE`) and defaults to `INFO`.
use log::{Level, LevelFilter, Log, Metadata, Record};

struct ConsoleLogger;

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        println!("[{:>5}] {}", level_name(record.level()), record.args());
    }

    fn flush(&self) {}
}

fn level_name(level: Level) -> &'static str {
    match level {
        Level::Error => "ERROR",
        Level::Warn => "WARN",
        Level::Info => "INFO",
        Level::Debug => "DEBUG",
        Level::Trace => "TRACE",
    }
}

fn max_level(setting: Option<&str>) -> LevelFilter {
    match setting {
        Some("ERROR") => LevelFilter::Error,
        Some("WARN") => LevelFilter::Warn,
        Some("DEBUG") => LevelFilter::Debug,
        Some("TRACE") => LevelFilter::Trace,
        Some("OFF") => LevelFilter::Off,
        _ => LevelFilter::Info,
    }
}

static LOGGER: ConsoleLogger = ConsoleLogger;

/// Install the console logger. Later calls only reset the level.
pub fn init() {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(max_level(option_env!("LOG")));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_from_build_setting() {
        assert_eq!(max_level(Some("TRACE")), LevelFilter::Trace);
        assert_eq!(max_level(Some("WARN")), LevelFilter::Warn);
        assert_eq!(max_level(Some("verbose")), LevelFilter::Info);
        assert_eq!(max_level(None), LevelFilter::Info);
    }

    #[test]
    fn records_reach_the_console() {
        init();
        log::warn!("logger test {}", 42);
        assert!(crate::arch::transcript().contains("[ WARN] logger test 42"));
    }
}
