//! Tracing setup for the node binary.
//!
//! Log lines go to stderr; stdout carries the shell prompt and replies.
//!
//! Level precedence: a non-empty `RUST_LOG` (full `EnvFilter` directives)
//! wins. Otherwise the configured level applies, which [`crate::config::load`]
//! has already resolved from `PTERM_LOG_LEVEL` or `[node] log_level`.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::error::AppError;

/// Install the global subscriber. Call once, after config is loaded.
pub fn init(level: &str) -> Result<(), AppError> {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = node_filter(level, rust_log.as_deref())?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| AppError::Logger(format!("failed to set subscriber: {e}")))
}

/// Malformed `RUST_LOG` directives fall back to `level`.
fn node_filter(level: &str, rust_log: Option<&str>) -> Result<EnvFilter, AppError> {
    let from_env = rust_log
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .and_then(|d| EnvFilter::try_new(d).ok());
    if let Some(filter) = from_env {
        return Ok(filter);
    }
    let level = parse_level(level)?;
    Ok(EnvFilter::builder().with_default_directive(level.into()).parse_lossy(""))
}

/// A plain level name (`error` .. `trace`, or `off`). Used to validate
/// `log_level` at config load.
pub fn parse_level(level: &str) -> Result<LevelFilter, AppError> {
    if level.trim().is_empty() {
        return Err(AppError::Logger("log level must not be empty".into()));
    }
    level
        .trim()
        .parse::<LevelFilter>()
        .map_err(|_| AppError::Logger(format!("unrecognised log level: '{level}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hint(level: &str, rust_log: Option<&str>) -> Option<LevelFilter> {
        node_filter(level, rust_log).unwrap().max_level_hint()
    }

    #[test]
    fn configured_level_applies_without_rust_log() {
        assert_eq!(hint("warn", None), Some(LevelFilter::WARN));
        assert_eq!(hint("trace", Some("   ")), Some(LevelFilter::TRACE));
    }

    #[test]
    fn rust_log_directives_win() {
        assert_eq!(hint("warn", Some("pterm=debug")), Some(LevelFilter::DEBUG));
    }

    #[test]
    fn malformed_rust_log_falls_back_to_configured_level() {
        assert_eq!(hint("error", Some("pterm=verbose")), Some(LevelFilter::ERROR));
    }

    #[test]
    fn bad_configured_level_is_rejected() {
        assert!(matches!(node_filter("verbose", None), Err(AppError::Logger(_))));
    }

    #[test]
    fn level_names() {
        assert_eq!(parse_level(" debug ").unwrap(), LevelFilter::DEBUG);
        assert_eq!(parse_level("off").unwrap(), LevelFilter::OFF);
        assert!(parse_level("verbose").is_err());
        assert!(parse_level("").is_err());
    }
}
