//! tracing subscriber setup for the binary.

use tracing_subscriber::field::MakeExt as _;
use tracing_subscriber::fmt::format;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

/// Longest `message` field written before truncation.
const MAX_MESSAGE_CHARS: usize = 280;

/// Install the global subscriber: compact lines on stderr, `info` by default,
/// `debug` with `--debug`. `RUST_LOG` overrides both.
pub fn init(debug: bool) {
    let field_formatter = format::debug_fn(|writer, field, value| {
        let field_name = field.name();
        if field_name == "message" {
            let formatted = format!("{value:?}");
            let (truncated, was_truncated) = truncate_for_log(&formatted, MAX_MESSAGE_CHARS);
            if was_truncated {
                write!(writer, "{truncated}...")
            } else {
                write!(writer, "{formatted}")
            }
        } else {
            write!(writer, "{field_name}={value:?}")
        }
    })
    .delimited(" ");

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .fmt_fields(field_formatter)
        .compact();

    tracing_subscriber::registry()
        .with(build_env_filter(debug))
        .with(fmt_layer)
        .init();
}

fn build_env_filter(debug: bool) -> tracing_subscriber::EnvFilter {
    if let Ok(filter) = tracing_subscriber::EnvFilter::try_from_default_env() {
        return filter;
    }
    if debug {
        tracing_subscriber::EnvFilter::new("debug,hyper=info,reqwest=info")
    } else {
        tracing_subscriber::EnvFilter::new("info")
    }
}

fn truncate_for_log(message: &str, max_chars: usize) -> (&str, bool) {
    match message.char_indices().nth(max_chars) {
        Some((byte_index, _character)) => (&message[..byte_index], true),
        None => (message, false),
    }
}
