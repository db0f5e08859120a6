//! `key=value` configuration file loading, matching the original
//! `config.c`'s tolerant-parse behavior: unknown keys and malformed lines
//! are logged and skipped rather than failing the whole load.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Configuration {
    pub port: u16,
    pub worker_processes: usize,
    pub root: PathBuf,
    pub log: PathBuf,
    pub max_connections: usize,
    pub keep_alive_timeout: u64,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            port: 8080,
            worker_processes: 4,
            root: PathBuf::from("./static"),
            log: PathBuf::from("./logs/access.log"),
            max_connections: 10_000,
            keep_alive_timeout: 60,
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Read(PathBuf, std::io::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read(path, err) => write!(f, "cannot read {}: {}", path.display(), err),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Configuration {
    /// Reads a `key=value` file. Blank lines and `#`-prefixed comments
    /// (after trimming leading whitespace) are skipped. Unknown keys are
    /// logged and ignored; lines with no `=` are logged and skipped. A
    /// missing file is the only hard error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
        let mut config = Self::default();
        for (lineno, line) in text.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let Some((key, value)) = trimmed.split_once('=') else {
                tracing::warn!(line = lineno + 1, "config: line has no '=', skipping");
                continue;
            };
            let key = key.trim();
            let value = value.trim();
            match key {
                "port" => config.port = parse_or_warn(lineno, key, value, config.port),
                "worker_processes" => {
                    config.worker_processes = parse_or_warn(lineno, key, value, config.worker_processes)
                }
                "root" => config.root = PathBuf::from(value),
                "log" => config.log = PathBuf::from(value),
                "max_connections" => {
                    config.max_connections = parse_or_warn(lineno, key, value, config.max_connections)
                }
                "keep_alive_timeout" => {
                    config.keep_alive_timeout = parse_or_warn(lineno, key, value, config.keep_alive_timeout)
                }
                other => tracing::warn!(line = lineno + 1, key = other, "config: unknown key, ignoring"),
            }
        }
        Ok(config)
    }

    /// Re-parses `path` and copies over every field except `port` and
    /// `max_connections`: those require a fresh listener and pool sizing
    /// respectively, and a running master intentionally leaves them alone
    /// until restart.
    pub fn reload(&mut self, path: &Path) -> Result<(), ConfigError> {
        let fresh = Self::load(path)?;
        self.worker_processes = fresh.worker_processes;
        self.root = fresh.root;
        self.log = fresh.log;
        self.keep_alive_timeout = fresh.keep_alive_timeout;
        Ok(())
    }
}

fn parse_or_warn<T: std::str::FromStr>(lineno: usize, key: &str, value: &str, default: T) -> T {
    value.parse().unwrap_or_else(|_| {
        tracing::warn!(line = lineno + 1, key, value, "config: invalid value, keeping default");
        default
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[test]
    fn loads_known_keys() {
        let f = write_temp("port=9090\nworker_processes=8\nroot=/srv/www\n");
        let config = Configuration::load(f.path()).unwrap();
        assert_eq!(config.port, 9090);
        assert_eq!(config.worker_processes, 8);
        assert_eq!(config.root, PathBuf::from("/srv/www"));
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let f = write_temp("# comment\n\n   # indented comment\nport=1234\n");
        let config = Configuration::load(f.path()).unwrap();
        assert_eq!(config.port, 1234);
    }

    #[test]
    fn unknown_keys_are_ignored_not_fatal() {
        let f = write_temp("bogus=value\nport=1234\n");
        let config = Configuration::load(f.path()).unwrap();
        assert_eq!(config.port, 1234);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(Configuration::load(Path::new("/no/such/file")).is_err());
    }

    #[test]
    fn reload_preserves_port_and_max_connections() {
        let f = write_temp("port=1\nmax_connections=1\nworker_processes=2\n");
        let mut config = Configuration { port: 9999, max_connections: 55, ..Configuration::default() };
        config.reload(f.path()).unwrap();
        assert_eq!(config.port, 9999);
        assert_eq!(config.max_connections, 55);
        assert_eq!(config.worker_processes, 2);
    }
}
