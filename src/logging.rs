//! Tracing subscriber setup for terminal and log-file output.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::field::MakeExt as _;
use tracing_subscriber::fmt::format;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

/// Longest `message` field written before it is cut off.
const MAX_MESSAGE_CHARS: usize = 280;

/// The first `max_chars` characters of `message`, or `None` if it already fits.
fn clip_chars(message: &str, max_chars: usize) -> Option<&str> {
    message
        .char_indices()
        .nth(max_chars)
        .map(|(byte_index, _)| &message[..byte_index])
}

/// Field formatter shared by both modes. Bot tokens never reach the output
/// even if a caller records one by mistake.
fn field_formatter() -> impl for<'writer> tracing_subscriber::fmt::FormatFields<'writer> {
    format::debug_fn(|writer, field, value| {
        let field_name = field.name();

        if field_name == "token" {
            write!(writer, "{field_name}=[redacted]")
        } else if field_name == "message" {
            let formatted = format!("{value:?}");
            match clip_chars(&formatted, MAX_MESSAGE_CHARS) {
                Some(clipped) => write!(writer, "{field_name}={clipped}..."),
                None => write!(writer, "{field_name}={formatted}"),
            }
        } else {
            write!(writer, "{field_name}={value:?}")
        }
    })
    .delimited(" ")
}

/// Initialize tracing for background mode: a daily rolling file under
/// `log_dir`. The returned guard flushes the writer on drop and must be held
/// for the lifetime of the process.
pub fn init_background_tracing(log_dir: &Path, debug: bool) -> anyhow::Result<WorkerGuard> {
    use anyhow::Context as _;

    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create log directory: {}", log_dir.display()))?;

    let file_appender = tracing_appender::rolling::daily(log_dir, "topicbot.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .fmt_fields(field_formatter())
        .compact();

    tracing_subscriber::registry()
        .with(build_env_filter(debug))
        .with(fmt_layer)
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok(guard)
}

/// Initialize tracing for foreground (terminal) mode.
pub fn init_foreground_tracing(debug: bool) -> anyhow::Result<()> {
    use anyhow::Context as _;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .fmt_fields(field_formatter())
        .compact();

    tracing_subscriber::registry()
        .with(build_env_filter(debug))
        .with(fmt_layer)
        .try_init()
        .context("failed to install tracing subscriber")
}

/// `RUST_LOG` wins when set; otherwise `info`, or `debug` with `--debug`.
fn build_env_filter(debug: bool) -> tracing_subscriber::EnvFilter {
    let default_directive = if debug { "debug" } else { "info" };
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive))
}
