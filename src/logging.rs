//! Process-wide tracing setup
//!
//! Installed once from `main`. Library code only emits `tracing` events.

use anyhow::Result;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Default)]
pub struct LoggingConfig {
    /// Raise the default level from info to debug
    pub verbose: bool,
    /// Force ANSI colors off (for CI logs)
    pub plain: bool,
}

impl LoggingConfig {
    fn default_directive(&self) -> &'static str {
        if self.verbose {
            "bug_agent=debug,info"
        } else {
            "bug_agent=info,warn"
        }
    }

    /// `RUST_LOG` wins over the verbosity flag when set.
    pub fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.default_directive()))
    }
}

/// Install the global subscriber. Logs go to stderr so command output on
/// stdout stays clean.
pub fn init(config: &LoggingConfig) -> Result<()> {
    tracing_subscriber::registry()
        .with(config.filter())
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_ansi(!config.plain),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialise logging: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbose_raises_default_level() {
        let quiet = LoggingConfig::default();
        let loud = LoggingConfig {
            verbose: true,
            ..LoggingConfig::default()
        };
        assert!(quiet.default_directive().contains("bug_agent=info"));
        assert!(loud.default_directive().contains("bug_agent=debug"));
    }
}
