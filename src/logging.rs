//! Tracing subscriber setup for the binary.

use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is not set.
///
/// `quiet` wins over `verbosity`; each `-v` widens the crate's own level.
pub fn default_directive(verbosity: u8, quiet: bool) -> &'static str {
    if quiet {
        return "error";
    }
    match verbosity {
        0 => "warn,voxagent=info",
        1 => "info,voxagent=debug",
        2 => "info,voxagent=trace",
        _ => "trace",
    }
}

/// Installs the global subscriber, writing to stderr.
///
/// `RUST_LOG` overrides the verbosity-derived filter.
pub fn init(verbosity: u8, quiet: bool, json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbosity, quiet)));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quiet_overrides_verbosity() {
        assert_eq!(default_directive(3, true), "error");
    }

    #[test]
    fn test_verbosity_widens_filter() {
        assert_eq!(default_directive(0, false), "warn,voxagent=info");
        assert_eq!(default_directive(1, false), "info,voxagent=debug");
        assert_eq!(default_directive(9, false), "trace");
    }

    #[test]
    fn test_directives_parse() {
        for verbosity in 0..4 {
            assert!(EnvFilter::try_new(default_directive(verbosity, false)).is_ok());
        }
    }
}
