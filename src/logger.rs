//! log4rs setup. Everything goes to stderr (stdout of a worker process is
//! reserved for protocol frames), optionally mirrored to a file.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::LevelFilter;
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::append::file::FileAppender;
use log4rs::config::runtime::ConfigErrors;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;

const PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S)} - {l} - {m}{n}";

#[derive(Debug, thiserror::Error)]
pub enum LoggerError {
    #[error("invalid log level '{0}'")]
    Level(String),
    #[error("failed to open log file {path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error(transparent)]
    Install(#[from] log::SetLoggerError),
}

pub fn build_config(level: &str, file: Option<&Path>) -> Result<Config, LoggerError> {
    let level = LevelFilter::from_str(level).map_err(|_| LoggerError::Level(level.to_string()))?;

    let stderr = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new(PATTERN)))
        .build();
    let mut builder = Config::builder().appender(Appender::builder().build("stderr", Box::new(stderr)));
    let mut root = Root::builder().appender("stderr");

    if let Some(path) = file {
        let file_appender = FileAppender::builder()
            .encoder(Box::new(PatternEncoder::new(PATTERN)))
            .build(path)
            .map_err(|source| LoggerError::File {
                path: path.to_path_buf(),
                source,
            })?;
        builder = builder.appender(Appender::builder().build("file", Box::new(file_appender)));
        root = root.appender("file");
    }

    Ok(builder.build(root.build(level))?)
}

pub fn init(level: &str, file: Option<&Path>) -> Result<log4rs::Handle, LoggerError> {
    Ok(log4rs::init_config(build_config(level, file)?)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("madx_model.log");
        let config = build_config("debug", Some(&path)).unwrap();
        assert_eq!(config.appenders().len(), 2);
        assert_eq!(config.root().level(), LevelFilter::Debug);
        assert!(path.exists());
    }

    #[test]
    fn test_invalid_level() {
        assert!(matches!(
            build_config("loud", None),
            Err(LoggerError::Level(level)) if level == "loud"
        ));
    }
}
