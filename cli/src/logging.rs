//! Tracing subscriber setup for the `fleetlab` binary.
//!
//! Logs go to stderr so the monitor table on stdout stays readable.
//!
//! # Priority (highest to lowest)
//!
//! 1. `FLEETLAB_LOG` env var (per-target directives, e.g. `fleetlab_core=debug,warn`)
//! 2. `RUST_LOG` env var
//! 3. CLI flags (`-v` → debug, `-q` → error)
//! 4. Default: warnings, plus progress from the engine at info

use tracing::Level;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

const ENGINE_TARGET: &str = "fleetlab_core";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    Quiet,
    Normal,
    Verbose,
}

impl Verbosity {
    /// Verbose wins when both flags are given.
    pub fn from_flags(verbose: bool, quiet: bool) -> Self {
        if verbose {
            Verbosity::Verbose
        } else if quiet {
            Verbosity::Quiet
        } else {
            Verbosity::Normal
        }
    }

    fn directive(self) -> String {
        match self {
            Verbosity::Quiet => Level::ERROR.to_string(),
            Verbosity::Normal => format!("{},{}={}", Level::WARN, ENGINE_TARGET, Level::INFO),
            Verbosity::Verbose => Level::DEBUG.to_string(),
        }
    }
}

/// Install the global subscriber. Call once, before loading settings.
pub fn init(verbosity: Verbosity) {
    let use_ansi = std::io::IsTerminal::is_terminal(&std::io::stderr());
    let layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(use_ansi)
        .with_target(verbosity == Verbosity::Verbose);

    let registry = tracing_subscriber::registry().with(build_env_filter(verbosity));
    if verbosity == Verbosity::Verbose {
        registry.with(layer.with_timer(fmt::time::uptime())).init();
    } else {
        registry.with(layer.without_time().compact()).init();
    }
}

fn build_env_filter(verbosity: Verbosity) -> EnvFilter {
    if let Ok(directives) = std::env::var("FLEETLAB_LOG") {
        if let Ok(filter) = EnvFilter::try_new(&directives) {
            return filter;
        }
    }
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    EnvFilter::try_new(verbosity.directive()).unwrap_or_else(|_| EnvFilter::new("warn"))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_from_flags() {
        assert_eq!(Verbosity::from_flags(false, false), Verbosity::Normal);
        assert_eq!(Verbosity::from_flags(false, true), Verbosity::Quiet);
        assert_eq!(Verbosity::from_flags(true, true), Verbosity::Verbose);
    }

    #[test]
    fn default_directives_parse() {
        for v in [Verbosity::Quiet, Verbosity::Normal, Verbosity::Verbose] {
            assert!(EnvFilter::try_new(v.directive()).is_ok());
        }
        assert_eq!(Verbosity::Normal.directive(), "WARN,fleetlab_core=INFO");
    }
}
