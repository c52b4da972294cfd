use lazy_static::lazy_static;
use log::{Level, LevelFilter, Log, Metadata, Record};
use std::io::Write;
use std::time::Instant;

lazy_static! {
    static ref START: Instant = Instant::now();
}

/// Logger backing the `log` facade for every service binary. Each line
/// carries the elapsed time since startup, the level, and the service name.
struct ServiceLogger {
    service: String,
}

impl Log for ServiceLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let elapsed = START.elapsed();
        let stderr = std::io::stderr();
        let mut out = stderr.lock();
        let _ = writeln!(
            out,
            "[{:>8.3}s] [{:<5}] [{}] {}",
            elapsed.as_secs_f64(),
            level_tag(record.level()),
            self.service,
            record.args()
        );
    }

    fn flush(&self) {}
}

fn level_tag(level: Level) -> &'static str {
    match level {
        Level::Error => "ERROR",
        Level::Warn => "WARN",
        Level::Info => "INFO",
        Level::Debug => "DEBUG",
        Level::Trace => "TRACE",
    }
}

/// Parse a `LOG_LEVEL` config value. Unknown strings fall back to `info`.
pub fn parse_level(level: &str) -> LevelFilter {
    match level.to_ascii_lowercase().as_str() {
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    }
}

/// Install the global logger for this process. Calling it twice keeps the
/// first installation and only adjusts the level filter.
pub fn init(level: &str, service: &str) {
    lazy_static::initialize(&START);
    let filter = parse_level(level);
    let logger = ServiceLogger {
        service: service.to_string(),
    };
    let _ = log::set_boxed_logger(Box::new(logger));
    log::set_max_level(filter);
}
