use std::{future::Future, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, trace, warn};

/// Run `fut` on the runtime inside `span` until it finishes or `token` is
/// cancelled, logging how it ended. Errors are logged, not returned: the
/// spawned task owns them.
pub fn spawn_with_cancel(
    span: tracing::Span,
    token: CancellationToken,
    fut: impl Future<Output = anyhow::Result<()>> + Send + 'static,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(log_outcome(fut, token).instrument(span))
}

async fn log_outcome(fut: impl Future<Output = anyhow::Result<()>>, token: CancellationToken) {
    trace!("started");
    let mut heartbeat = tokio::time::interval(Duration::from_secs(5));
    tokio::pin!(fut);
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("cancelled");
                return;
            }
            res = &mut fut => {
                match res {
                    Ok(()) => trace!("finished"),
                    Err(e) => warn!("finished with error: {e:#}"),
                }
                return;
            }
            _ = heartbeat.tick() => trace!("still running"),
        }
    }
}
