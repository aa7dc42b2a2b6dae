//! Sync watcher: consume the control plane's desired-state stream.
//!
//! Each session resumes from the committed cursor. Sequences of records
//! applied during a session are held back and only committed once the
//! stream closes cleanly, so a session broken mid-bootstrap is replayed
//! from where the previous clean session ended.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use rand::Rng;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::control_plane::SyncRequest;
use crate::reconciler::{Core, stopped};

/// How a sync session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionEnd {
    /// The stream finished; pending progress was committed.
    Closed,
    /// Opening or reading the stream failed; nothing was committed.
    Failed,
    /// Stop was requested.
    Stopped,
}

/// Uniform delay in `[min, max]`.
pub(crate) fn jittered(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    rand::thread_rng().gen_range(min..=max)
}

/// Reconnect forever, sleeping a jittered backoff before every attempt.
pub(crate) async fn run(core: Arc<Core>, mut stop: watch::Receiver<bool>) {
    info!(region = %core.config.region, "sync watcher started");
    loop {
        let delay = jittered(core.config.sync.min_backoff(), core.config.sync.max_backoff());
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = stopped(&mut stop) => break,
        }
        if session(&core, &mut stop).await == SessionEnd::Stopped {
            break;
        }
    }
    info!("sync watcher stopped");
}

/// Run one stream session to completion.
pub(crate) async fn session(core: &Core, stop: &mut watch::Receiver<bool>) -> SessionEnd {
    let request = SyncRequest {
        region: core.config.region.clone(),
        sequence_last_seen: core.cursor.committed(),
    };
    debug!(sequence_last_seen = request.sequence_last_seen, "opening sync stream");

    let mut stream = tokio::select! {
        opened = core.control_plane.sync(request) => match opened {
            Ok(stream) => stream,
            Err(err) => {
                warn!(error = %err, "failed to open sync stream");
                return SessionEnd::Failed;
            }
        },
        () = stopped(&mut *stop) => return SessionEnd::Stopped,
    };

    let mut pending: Option<u64> = None;
    let mut received = 0_usize;
    loop {
        let next = tokio::select! {
            next = stream.next() => next,
            () = stopped(&mut *stop) => return SessionEnd::Stopped,
        };
        match next {
            Some(Ok(state)) => {
                received += 1;
                let handled = tokio::select! {
                    handled = core.handle_state(Some(&state)) => handled,
                    () = stopped(&mut *stop) => return SessionEnd::Stopped,
                };
                match handled {
                    Ok(sequence) => pending = Some(pending.map_or(sequence, |p| p.max(sequence))),
                    Err(err) => warn!(
                        sequence = state.sequence,
                        error = %err,
                        "failed to handle desired state"
                    ),
                }
            }
            Some(Err(err)) => {
                warn!(error = %err, received, "sync stream broke, discarding pending progress");
                return SessionEnd::Failed;
            }
            None => {
                let committed = pending.map_or_else(|| core.cursor.committed(), |seq| core.cursor.commit(seq));
                info!(received, committed, "sync stream closed");
                return SessionEnd::Closed;
            }
        }
    }
}
