//! Log output.
//!
//! Foreground runs log to stderr through `env_logger`. A daemon has no
//! terminal left, so it logs to the system log under the configured tag.

use super::options::Config;
use anyhow::{anyhow, Result};
use log::{Level, LevelFilter, Log, Metadata, Record};
use parking_lot::Mutex;
use std::io::Write;
use std::process;
use syslog::{Facility, Formatter3164, Logger, LoggerBackend};

/// Most detailed level that is logged for `config`.
///
/// `-d` asks for the engine's request trace, `-v` for debug output.
pub fn level(config: &Config) -> LevelFilter {
    let engine_debug = config
        .engine_args
        .as_slice()
        .iter()
        .skip(2)
        .any(|arg| arg == "-d");
    if engine_debug {
        LevelFilter::Trace
    } else if config.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    }
}

/// Installs the process-wide logger for `config`.
///
/// Falls back to stderr when the system log cannot be reached.
pub fn init(config: &Config) {
    let level = level(config);
    if config.daemonize {
        match SyslogLogger::install(&config.syslog_tag, level) {
            Ok(()) => return,
            Err(e) => eprintln!("{}: {:#}, logging to stderr", config.syslog_tag, e),
        }
    }

    let tag = config.syslog_tag.clone();
    env_logger::Builder::new()
        .filter_level(level)
        .format(move |buf, record| {
            writeln!(
                buf,
                "{}[{}]: {}: {}",
                tag,
                process::id(),
                record.level(),
                record.args()
            )
        })
        .init();
}

fn formatter(tag: &str) -> Formatter3164 {
    Formatter3164 {
        facility: Facility::LOG_USER,
        hostname: None,
        process: tag.to_string(),
        pid: process::id(),
    }
}

/// Sends records to the local syslog daemon.
///
/// The connection is reopened when the process id changes, so records
/// written after daemonizing carry the daemon's pid.
struct SyslogLogger {
    tag: String,
    level: LevelFilter,
    conn: Mutex<Option<(u32, Logger<LoggerBackend, Formatter3164>)>>,
}

impl SyslogLogger {
    fn new(tag: &str, level: LevelFilter) -> Result<Self> {
        let logger = Self {
            tag: tag.to_string(),
            level,
            conn: Mutex::new(None),
        };
        // fail early if there is no syslog to talk to
        let conn = logger.connect()?;
        *logger.conn.lock() = Some((process::id(), conn));
        Ok(logger)
    }

    fn install(tag: &str, level: LevelFilter) -> Result<()> {
        let logger = Self::new(tag, level)?;
        log::set_boxed_logger(Box::new(logger))?;
        log::set_max_level(level);
        Ok(())
    }

    fn connect(&self) -> Result<Logger<LoggerBackend, Formatter3164>> {
        syslog::unix(formatter(&self.tag)).map_err(|e| anyhow!("unable to reach syslog: {}", e))
    }
}

impl Log for SyslogLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let pid = process::id();
        let mut conn = self.conn.lock();
        if conn.as_ref().map_or(true, |(owner, _)| *owner != pid) {
            *conn = self.connect().ok().map(|logger| (pid, logger));
        }
        let Some((_, logger)) = conn.as_mut() else {
            return;
        };

        let message = record.args().to_string();
        let _ = match record.level() {
            Level::Error => logger.err(message),
            Level::Warn => logger.warning(message),
            Level::Info => logger.info(message),
            Level::Debug | Level::Trace => logger.debug(message),
        };
    }

    fn flush(&self) {}
}
