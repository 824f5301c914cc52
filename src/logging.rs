//! Logging setup shared by the driver and the CLI

use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Quieter defaults for chatty dependencies
const DEPENDENCY_DIRECTIVES: &[&str] = &[
    "hyper=warn",
    "reqwest=warn",
    "kube=info",
    "tower=warn",
    "axum=info",
];

fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` directives are honoured on top of `level`.
pub fn init_logging(level: &str, json: bool) {
    let mut filter = EnvFilter::from_default_env().add_directive(parse_level(level).into());
    for directive in DEPENDENCY_DIRECTIVES {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
