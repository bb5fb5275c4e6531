use time::UtcOffset;
use time::macros::format_description;
use tracing_subscriber::fmt::time::OffsetTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::DynError;

/// Installs the tracing pipeline the binary logs through. `RUST_LOG` wins;
/// otherwise the given crate logs at debug and tower_http stays quiet.
/// `.init()` also wires the `log` macro facade into this subscriber.
pub fn init(env_cargo_crate_name: &str) -> Result<(), DynError> {
    let offset = UtcOffset::current_local_offset()?;
    let timer = OffsetTime::new(offset, format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| format!("{env_cargo_crate_name}=debug,tower_http=error").into()),
        )
        .with(tracing_subscriber::fmt::layer().with_thread_ids(true).with_ansi(true).with_timer(timer))
        .init();
    Ok(())
}
