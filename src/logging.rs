//! Diagnostic logging to stderr.
//!
//! `RUST_LOG` wins over the level given on the command line.

use std::io::IsTerminal;
use std::sync::OnceLock;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Level used when neither `--log-level` nor `RUST_LOG` says otherwise
pub const DEFAULT_LEVEL: &str = "warn";

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Filter for `level`, unless `RUST_LOG` is set
pub fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LEVEL))
}

/// Colors only on a terminal, and never with `NO_COLOR` set
fn use_color() -> bool {
    color_allowed(std::io::stderr().is_terminal(), std::env::var_os("NO_COLOR").is_some())
}

fn color_allowed(is_tty: bool, no_color: bool) -> bool {
    is_tty && !no_color
}

/// Install the global subscriber once; later calls are no-ops
pub fn init(level: &str) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(use_color())
            .without_time()
            .with_target(false);

        if tracing_subscriber::registry()
            .with(layer)
            .with(env_filter(level))
            .try_init()
            .is_err()
        {
            tracing::debug!("tracing subscriber already installed");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_filter_accepts_levels() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        assert_eq!(env_filter("debug").to_string(), "debug");
        assert_eq!(env_filter("dssh=trace").to_string(), "dssh=trace");
    }

    #[test]
    fn test_env_filter_falls_back_on_garbage() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        assert_eq!(env_filter("dssh=loud").to_string(), DEFAULT_LEVEL);
    }

    #[test]
    fn test_color_only_on_terminal() {
        assert!(color_allowed(true, false));
        assert!(!color_allowed(false, false));
        assert!(!color_allowed(true, true));
    }

    #[test]
    fn test_init_twice() {
        init("warn");
        init("debug");
    }
}
