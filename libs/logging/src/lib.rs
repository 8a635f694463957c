//! Subscriber setup for the doorman binaries.

use anyhow::{Context, Result};
use tracing_subscriber::{
    EnvFilter, Layer, Registry, layer::SubscriberExt as _, util::SubscriberInitExt as _,
};

/// Where log lines end up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTarget {
    /// Human-readable lines on stderr.
    Stderr,
    /// JSON lines on stderr.
    StderrJson,
    /// The journal, with the given syslog identifier.
    Journald,
}

/// Registers the global subscriber.
///
/// `directives` is an `EnvFilter` string; `ident` becomes the syslog
/// identifier for the journald target.
pub fn setup_global_subscriber(
    directives: &str,
    target: LogTarget,
    ident: &str,
) -> Result<()> {
    let filter = EnvFilter::try_new(directives).context("Failed to parse log directives")?;

    let layer = match target {
        LogTarget::Stderr => tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .boxed(),
        LogTarget::StderrJson => tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_writer(std::io::stderr)
            .boxed(),
        LogTarget::Journald => tracing_journald::layer()
            .context("Failed to connect to journald")?
            .with_syslog_identifier(ident.to_owned())
            .boxed(),
    };

    Registry::default()
        .with(layer.with_filter(filter))
        .try_init()
        .context("Failed to register global subscriber")?;

    Ok(())
}

/// Maps the `-v`/`-V N` debug verbosity onto filter directives. The
/// daemon's own crates get noisier; everything else stays at info.
pub fn verbosity_directives(level: u8) -> String {
    match level {
        0 => "info".to_owned(),
        1 => "info,doorman=debug,doorman_policy=debug".to_owned(),
        _ => "info,doorman=trace,doorman_policy=trace".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_scales_with_level() {
        assert_eq!(verbosity_directives(0), "info");
        assert!(verbosity_directives(1).contains("doorman=debug"));
        assert!(verbosity_directives(5).contains("doorman=trace"));
    }
}
