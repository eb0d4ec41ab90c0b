//! Console logging through tracing.

use std::io::IsTerminal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// The AWS SDK logs every request at info.
const QUIET_TARGETS: &str = "aws_config=warn,aws_smithy_runtime=warn,aws_sdk_s3=warn";

/// Install the global subscriber. `RUST_LOG` wins over `level`; an invalid
/// `level` falls back to `info`.
pub fn init(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directives(level)))
        .unwrap_or_else(|_| EnvFilter::new(directives("info")));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(std::io::stdout().is_terminal()),
        )
        .try_init()?;

    Ok(())
}

fn directives(level: &str) -> String {
    format!("{},{}", level, QUIET_TARGETS)
}
