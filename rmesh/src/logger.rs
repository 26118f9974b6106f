use std::fs::{File, OpenOptions};
use std::io::{self, Stdout, Write};

use anyhow::{anyhow, Result};
use slog::{o, Drain};

use crate::conf::logging::{Level, To};
pub use slog::Logger;

/// Routes the `log` macros used across the crate into `logger`.
pub fn logger_init(logger: Logger, level: Level) -> Result<()> {
    log::set_boxed_logger(Box::new(LogBridge(logger)))?;
    log::set_max_level(to_log(level.inner()).to_level_filter());
    Ok(())
}

struct LogBridge(Logger);

impl log::Log for LogBridge {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, r: &log::Record) {
        let location = slog::RecordLocation {
            file: r.file_static().unwrap_or("<unknown>"),
            line: r.line().unwrap_or_default(),
            column: 0,
            function: "",
            module: r.module_path_static().unwrap_or("<unknown>"),
        };
        let rs = slog::RecordStatic { location: &location, level: to_slog(r.level()), tag: r.target() };
        self.0.log(&slog::Record::new(&rs, r.args(), slog::b!()))
    }

    fn flush(&self) {}
}

fn to_slog(level: log::Level) -> slog::Level {
    match level {
        log::Level::Error => slog::Level::Error,
        log::Level::Warn => slog::Level::Warning,
        log::Level::Info => slog::Level::Info,
        log::Level::Debug => slog::Level::Debug,
        log::Level::Trace => slog::Level::Trace,
    }
}

fn to_log(level: slog::Level) -> log::Level {
    match level {
        slog::Level::Critical | slog::Level::Error => log::Level::Error,
        slog::Level::Warning => log::Level::Warn,
        slog::Level::Info => log::Level::Info,
        slog::Level::Debug => log::Level::Debug,
        slog::Level::Trace => log::Level::Trace,
    }
}

/// Plain text lines to the console, a file or both, written from a
/// background thread.
pub fn config_logger(filename: &str, to: To, level: Level) -> Result<Logger> {
    let file = if to.file() { Some(open_file(filename)?) } else { None };
    let decorator = slog_term::PlainSyncDecorator::new(Sink { to, file, console: io::stdout() });
    let drain = slog_term::FullFormat::new(decorator)
        .use_custom_timestamp(local_time)
        .build()
        .filter_level(level.inner())
        .fuse();
    let drain = slog_async::Async::new(drain)
        .chan_size(16 * 1024)
        .overflow_strategy(slog_async::OverflowStrategy::DropAndReport)
        .build()
        .fuse();
    Ok(Logger::root(drain, o!()))
}

fn local_time(w: &mut dyn Write) -> io::Result<()> {
    write!(w, "{}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"))
}

/// Copies every formatted line to the configured targets.
struct Sink {
    to: To,
    file: Option<File>,
    console: Stdout,
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.to.console() {
            self.console.write_all(buf)?;
        }
        if let Some(file) = &mut self.file {
            file.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.to.console() {
            self.console.flush()?;
        }
        match &mut self.file {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

fn open_file(filename: &str) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(filename)
        .map_err(|e| anyhow!("cannot open log file {}, {}", filename, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels() {
        assert_eq!(to_slog(log::Level::Warn), slog::Level::Warning);
        assert_eq!(to_log(slog::Level::Critical), log::Level::Error);
        assert_eq!(to_log(to_slog(log::Level::Trace)), log::Level::Trace);
    }

    #[test]
    fn installs_once() {
        let level = Level::from(slog::Level::Info);
        let discard = Logger::root(slog::Discard, o!());
        logger_init(discard.clone(), level).unwrap();
        log::info!("routed to the discard drain");
        assert!(logger_init(discard, level).is_err());
    }

    #[test]
    fn writes_to_file() {
        let path = std::env::temp_dir().join(format!("rmesh-logger-{}.log", std::process::id()));
        let filename = path.to_string_lossy().into_owned();
        let mut sink = Sink { to: To::File, file: Some(open_file(&filename).unwrap()), console: io::stdout() };
        sink.write_all(b"hello\n").unwrap();
        sink.flush().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello\n");
        let _ = std::fs::remove_file(&path);

        assert!(open_file("/nonexistent-dir/rmesh.log").is_err());
    }
}
