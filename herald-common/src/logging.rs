//! Logging setup and span-scoped event macros
//!
//! Events are grouped under one of three spans:
//!
//! - `request`: bodies sent to the push service
//! - `reply`: what the push service sent back
//! - `pipeline`: the dispatcher's own bookkeeping (scheduling, filtering,
//!   settling handles)
//!
//! Each macro accepts the same arguments as [`tracing::event!`] after an
//! optional `level = LEVEL`, so structured fields work as usual:
//!
//! ```rust,ignore
//! pipeline!(level = DEBUG, message_id = id, "Message cancelled by enqueue filter");
//! request!(%body, "Sending request");
//! ```

use std::str::FromStr;

use tracing::metadata::LevelFilter;
use tracing_subscriber::{
    Layer, filter::FilterFn, prelude::__tracing_subscriber_SubscriberExt, util::SubscriberInitExt,
};

const LEVEL_ENV: &str = "LOG_LEVEL";

/// Emit an event inside the span named `$span`
#[macro_export]
macro_rules! log {
    ($level:expr, $span:literal, $($arg:tt)+) => {{
        let span = $crate::tracing::span!($level, $span);
        let _enter = span.enter();

        $crate::tracing::event!($level, $($arg)+)
    }};
}

/// Requests leaving for the push service
#[macro_export]
macro_rules! request {
    (level = $level:ident, $($arg:tt)+) => {
        $crate::log!($crate::tracing::Level::$level, "request", $($arg)+)
    };

    ($($arg:tt)+) => {
        $crate::request!(level = TRACE, $($arg)+)
    };
}

/// Replies coming back from the push service
#[macro_export]
macro_rules! reply {
    (level = $level:ident, $($arg:tt)+) => {
        $crate::log!($crate::tracing::Level::$level, "reply", $($arg)+)
    };

    ($($arg:tt)+) => {
        $crate::reply!(level = TRACE, $($arg)+)
    };
}

/// Dispatcher bookkeeping
#[macro_export]
macro_rules! pipeline {
    (level = $level:ident, $($arg:tt)+) => {
        $crate::log!($crate::tracing::Level::$level, "pipeline", $($arg)+)
    };

    ($($arg:tt)+) => {
        $crate::pipeline!(level = TRACE, $($arg)+)
    };
}

const fn default_level() -> LevelFilter {
    if cfg!(debug_assertions) {
        LevelFilter::TRACE
    } else {
        LevelFilter::INFO
    }
}

/// Level named by `value`, or `default` when it is unset or not a level
fn parse_level(value: Option<&str>, default: LevelFilter) -> LevelFilter {
    value.map_or(default, |level| {
        LevelFilter::from_str(level).unwrap_or_else(|_| {
            eprintln!("Invalid log level specified {level}, defaulting to {default}");
            default
        })
    })
}

/// Install the global subscriber.
///
/// The level comes from `LOG_LEVEL`, defaulting to `TRACE` in debug builds and
/// `INFO` otherwise. Only events from `herald*` targets are emitted. Calling
/// this again keeps the subscriber installed first.
pub fn init() {
    let level = parse_level(std::env::var(LEVEL_ENV).ok().as_deref(), default_level());

    let _ = tracing_subscriber::Registry::default()
        .with(
            tracing_subscriber::fmt::layer()
                .with_file(false)
                .with_line_number(false)
                .with_thread_names(true)
                .compact()
                .with_ansi(true)
                .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
                .with_filter(level)
                .with_filter(FilterFn::new(|metadata| {
                    metadata.target().starts_with("herald")
                })),
        )
        .try_init();
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(
            parse_level(Some("debug"), LevelFilter::INFO),
            LevelFilter::DEBUG
        );
        assert_eq!(parse_level(Some("OFF"), LevelFilter::INFO), LevelFilter::OFF);
        assert_eq!(parse_level(None, LevelFilter::WARN), LevelFilter::WARN);
        assert_eq!(
            parse_level(Some("loud"), LevelFilter::INFO),
            LevelFilter::INFO
        );
    }

    #[test]
    fn test_macros_accept_fields_and_levels() {
        init();
        init();

        let id = 7_u64;
        crate::pipeline!(level = DEBUG, message_id = id, "Message scheduled");
        crate::pipeline!("Message {} settled", id);
        crate::request!(body = "{}", "Sending request");
        crate::reply!(level = WARN, status = 503_u16, "Received reply");
    }
}
