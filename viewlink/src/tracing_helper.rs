use std::{num::NonZeroU8, panic};

use anyhow::Result;
use time::format_description::well_known::{iso8601, Iso8601};
use tracing::{error, Level};
use tracing_subscriber::{
    fmt::{time::LocalTime, writer::MakeWriterExt},
    prelude::__tracing_subscriber_SubscriberExt,
    EnvFilter, Layer,
};

const MY_CONFIG: iso8601::EncodedConfig = iso8601::Config::DEFAULT
    .set_time_precision(iso8601::TimePrecision::Second {
        decimal_digits: NonZeroU8::new(3),
    })
    .encode();

fn make_filter() -> EnvFilter {
    let default_level = if cfg!(debug_assertions) {
        "debug"
    } else {
        "info"
    };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{}={},viewlink_lib={}",
            env!("CARGO_CRATE_NAME"),
            default_level,
            default_level
        ))
    })
}

/// Logs to stderr, and appends warnings and errors to `dir/file_name`.
pub fn init_tracing(dir: &str, file_name: &str, ansi: bool) -> Result<()> {
    let default_layer = || {
        const WITH_FILE_PATH: bool = cfg!(debug_assertions);
        tracing_subscriber::fmt::layer()
            .compact()
            .with_file(WITH_FILE_PATH)
            .with_line_number(WITH_FILE_PATH)
            .with_target(!WITH_FILE_PATH)
            .with_thread_ids(true)
            .with_timer(LocalTime::new(Iso8601::<MY_CONFIG>))
    };
    let writer = tracing_appender::rolling::never(dir, file_name).with_max_level(Level::WARN);
    let file_layer = default_layer().with_ansi(false).with_writer(writer);
    let stderr_layer = default_layer()
        .with_ansi(ansi)
        .with_writer(std::io::stderr);

    tracing::subscriber::set_global_default(
        tracing_subscriber::registry().with(
            file_layer
                .with_filter(make_filter())
                .and_then(stderr_layer.with_filter(make_filter())),
        ),
    )?;

    panic::set_hook(Box::new(|panic| error!("{}", panic)));
    Ok(())
}
