//! Terminal and file logging.

use std::{fs, fs::File, path::Path, str::FromStr};

use anyhow::{anyhow, Context, Result};
use log::LevelFilter;
use simplelog::{
    ColorChoice, CombinedLogger, Config, SharedLogger, TermLogger, TerminalMode, WriteLogger,
};

pub const LOG_FILE_NAME: &str = "log.txt";

pub fn parse_level(level: &str) -> Result<LevelFilter> {
    LevelFilter::from_str(level.trim()).map_err(|_| anyhow!("unknown log level '{level}'"))
}

/// Logs to the terminal at `level` and to `<output_dir>/log.txt` at debug.
pub fn initialize_logging(output_dir: &Path, level: &str) -> Result<()> {
    let terminal_level = parse_level(level)?;
    fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create output directory {}", output_dir.display()))?;
    let log_path = output_dir.join(LOG_FILE_NAME);
    let log_file = File::create(&log_path)
        .with_context(|| format!("Failed to create log file {}", log_path.display()))?;
    let loggers: Vec<Box<dyn SharedLogger>> = vec![
        TermLogger::new(
            terminal_level,
            Config::default(),
            TerminalMode::Mixed,
            ColorChoice::Auto,
        ),
        WriteLogger::new(terminal_level.max(LevelFilter::Debug), Config::default(), log_file),
    ];
    CombinedLogger::init(loggers).context("Failed to initialize logging")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_parse_case_insensitively() {
        assert_eq!(parse_level("info").unwrap(), LevelFilter::Info);
        assert_eq!(parse_level(" DEBUG ").unwrap(), LevelFilter::Debug);
        assert!(parse_level("loud").is_err());
    }
}
