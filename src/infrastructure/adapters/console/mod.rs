//! Console ingress - one JSON event payload per line

use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::errors::BotError;
use crate::application::services::BotRuntime;

/// What a console session did before it stopped
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConsoleSummary {
    pub submitted: usize,
    pub skipped: usize,
}

/// Feeds events typed (or piped) into stdin to the runtime
pub struct ConsoleAdapter<R> {
    reader: R,
}

impl ConsoleAdapter<BufReader<tokio::io::Stdin>> {
    pub fn stdin() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()))
    }
}

impl<R: AsyncBufRead + Unpin> ConsoleAdapter<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Read lines until EOF or `stop` fires. Blank lines are ignored,
    /// unparsable ones are logged and skipped.
    pub async fn run(self, runtime: &BotRuntime, stop: CancellationToken) -> Result<ConsoleSummary, BotError> {
        info!("Reading events from console (one JSON object per line)");
        let mut lines = self.reader.lines();
        let mut summary = ConsoleSummary::default();

        loop {
            let line = tokio::select! {
                _ = stop.cancelled() => break,
                line = lines.next_line() => line?,
            };
            let Some(line) = line else {
                debug!("console reached end of input");
                break;
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let payload = match serde_json::from_str::<serde_json::Value>(line) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(error = %e, "skipping console line that is not JSON");
                    summary.skipped += 1;
                    continue;
                }
            };

            match runtime.submit(payload).await {
                Ok(()) => summary.submitted += 1,
                Err(BotError::ShuttingDown) => break,
                Err(e) => {
                    warn!(error = %e, "skipping console event");
                    summary.skipped += 1;
                }
            }
        }

        Ok(summary)
    }
}
