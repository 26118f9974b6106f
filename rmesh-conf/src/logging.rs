use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;

/// Log output settings, `[log]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Log {
    pub to: To,
    pub level: Level,
    pub dir: String,
    pub file: String,
}

impl Default for Log {
    fn default() -> Self {
        Log { to: To::Console, level: Level::default(), dir: "/var/log/rmesh".into(), file: "rmesh.log".into() }
    }
}

impl Log {
    /// Full path of the log file, empty when no file is configured.
    pub fn filename(&self) -> String {
        match (self.dir.as_str(), self.file.as_str()) {
            (_, "") => String::new(),
            ("", file) => file.to_owned(),
            (dir, file) => Path::new(dir).join(file).to_string_lossy().into_owned(),
        }
    }
}

/// Where log lines go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum To {
    Off,
    File,
    Console,
    Both,
}

impl To {
    #[inline]
    pub fn file(&self) -> bool {
        matches!(self, To::Both | To::File)
    }
    #[inline]
    pub fn console(&self) -> bool {
        matches!(self, To::Both | To::Console)
    }
    #[inline]
    pub fn off(&self) -> bool {
        *self == To::Off
    }
}

/// Lowest severity written, one of slog's level names.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(try_from = "String")]
pub struct Level(slog::Level);

impl Level {
    #[inline]
    pub fn inner(&self) -> slog::Level {
        self.0
    }
}

impl Default for Level {
    fn default() -> Self {
        Level(slog::Level::Info)
    }
}

impl From<slog::Level> for Level {
    fn from(level: slog::Level) -> Self {
        Level(level)
    }
}

impl TryFrom<String> for Level {
    type Error = String;

    fn try_from(name: String) -> Result<Self, String> {
        slog::Level::from_str(&name).map(Level).map_err(|_| format!("unknown log level {name:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct Wrap {
        log: Log,
    }

    fn parse(s: &str) -> Result<Log, config::ConfigError> {
        let c = config::Config::builder()
            .add_source(config::File::from_str(s, config::FileFormat::Toml))
            .build()?;
        Ok(c.try_deserialize::<Wrap>()?.log)
    }

    #[test]
    fn targets_and_levels() {
        let log = parse("[log]\nto = \"both\"\nlevel = \"debug\"\ndir = \"/tmp/\"").unwrap();
        assert!(log.to.file() && log.to.console());
        assert_eq!(log.level.inner(), slog::Level::Debug);
        assert_eq!(log.filename(), "/tmp/rmesh.log");
        assert_eq!(Log::default().filename(), "/var/log/rmesh/rmesh.log");

        let log = parse("[log]\nto = \"off\"\nfile = \"\"").unwrap();
        assert!(log.to.off());
        assert_eq!(log.filename(), "");

        assert!(parse("[log]\nto = \"syslog\"").is_err());
        assert!(parse("[log]\nlevel = \"loud\"").is_err());
    }
}
