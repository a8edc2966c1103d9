//! Tracing setup shared by the ancestor and workers.
//!
//! `RUST_LOG` wins when set. Otherwise `CELLHOST_LOG` picks the level for
//! this crate (`debug`, `warn`/`warning`, `error`, default `info`).
//! `LOG_FORMAT=json` switches to JSON lines. Output always goes to stderr,
//! which workers share with the ancestor unless told otherwise.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

pub const LOG_LEVEL_ENV: &str = "CELLHOST_LOG";

fn default_directives(level: Option<&str>) -> String {
    let level = match level {
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    };
    format!("cellhost={level}")
}

fn filter() -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = std::env::var(LOG_LEVEL_ENV).ok();
        EnvFilter::new(default_directives(level.as_deref()))
    }
}

/// Install the global subscriber. A second call is a no-op.
///
/// `ansi` should follow whether stderr is a color terminal; in workers that
/// is [`Worker::stderr_has_color`](crate::worker::Worker::stderr_has_color).
pub fn init_tracing(ansi: bool) {
    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter())
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter())
            .with(fmt::layer().with_ansi(ansi).with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names_map_to_directives() {
        assert_eq!(default_directives(None), "cellhost=info");
        assert_eq!(default_directives(Some("debug")), "cellhost=debug");
        assert_eq!(default_directives(Some("warning")), "cellhost=warn");
        assert_eq!(default_directives(Some("error")), "cellhost=error");
        assert_eq!(default_directives(Some("loud")), "cellhost=info");
    }

    #[test]
    fn init_twice_is_harmless() {
        init_tracing(false);
        init_tracing(false);
        tracing::info!("still logging");
    }
}
