//! Logging setup
//!
//! `RUST_LOG` takes precedence; otherwise the crate logs at `info`, or
//! `debug` when verbose. Output goes to stderr so streamed text on stdout
//! stays clean.

use tracing_subscriber::EnvFilter;

pub const DEFAULT_FILTER: &str = "localchat=info";
const VERBOSE_FILTER: &str = "localchat=debug";

/// Filter used when `RUST_LOG` is unset or invalid
pub fn default_filter(verbose: bool) -> EnvFilter {
    EnvFilter::new(if verbose { VERBOSE_FILTER } else { DEFAULT_FILTER })
}

/// Install the global subscriber; later calls are ignored
pub fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(verbose));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filters() {
        assert_eq!(default_filter(false).to_string(), DEFAULT_FILTER);
        assert_eq!(default_filter(true).to_string(), VERBOSE_FILTER);
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init_logging(false);
        init_logging(true);
        tracing::info!("logging initialised");
    }
}
