use std::fmt::{self, Display};

use tokio::task::JoinHandle;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use crate::{
    config::{LogFormat, LoggingConfig},
    Error, Result,
};

/// Installs the global tracing subscriber. `RUST_LOG` takes precedence over
/// the configured level.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| {
            Error::Config(format!("invalid log level {:?}: {e}", config.level))
        })?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    let installed = match config.format {
        LogFormat::Json => builder.json().with_current_span(true).try_init(),
        LogFormat::Console => builder.compact().try_init(),
    };
    installed.map_err(|e| {
        Error::Config(format!("failed to install tracing subscriber: {e}"))
    })
}

/// Emits one structured record for a queue or gateway operation. Never
/// blocks and never fails the caller; with no subscriber it is a no-op.
pub fn record(
    trace_id: &str,
    operation: &str,
    fields: &[(&str, &dyn Display)],
) {
    tracing::info!(
        target: "millionboxes::queue",
        trace_id,
        operation,
        fields = %Fields(fields),
        "queue operation"
    );
}

/// Waits for a background task, logging a panic or cancellation under
/// `task`. Returns whether it ended cleanly.
pub async fn join_logged(task: &'static str, handle: JoinHandle<()>) -> bool {
    match handle.await {
        Ok(()) => true,
        Err(e) => {
            warn!(task, error = %e, "background task ended abnormally");
            false
        }
    }
}

struct Fields<'a>(&'a [(&'a str, &'a dyn Display)]);

impl Display for Fields<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{key}={value}")?;
        }
        Ok(())
    }
}
