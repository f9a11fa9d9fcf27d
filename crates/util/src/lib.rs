// SPDX-License-Identifier: PolyForm-Shield-1.0

pub mod logging {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    const DEFAULT_FILTER: &str = "info";

    /// Log line format.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub enum LogFormat {
        /// Human-readable lines for terminals.
        #[default]
        Pretty,
        /// One JSON object per line, for log shippers.
        Json,
    }

    /// Filter from `RUST_LOG`, falling back to `info` when unset or invalid.
    pub fn env_filter() -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
    }

    /// Install the global subscriber. Later calls are ignored so tests and
    /// embedders can call this freely.
    pub fn init_tracing(format: LogFormat) {
        let registry = tracing_subscriber::registry().with(env_filter());
        let _ = match format {
            LogFormat::Pretty => registry.with(fmt::layer().with_target(false)).try_init(),
            LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
        };
    }

}
