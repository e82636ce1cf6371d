use std::borrow::Cow;
use std::sync::Arc;

use bytes::Bytes;
use tokio::time::Duration;

use super::connection::ConnectionId;
use super::registry::Registry;
use crate::error::WriteFailure;
use crate::logger::Logger;

/// Outcome of one fan-out.
#[derive(Debug, Default)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failures: Vec<WriteFailure>,
}

impl BroadcastReport {
    /// How many connections were in the snapshot.
    pub fn recipients(&self) -> usize {
        self.delivered + self.failures.len()
    }
}

/// Fans a message out to every registered connection but one.
#[derive(Clone)]
pub struct Broadcaster {
    registry: Arc<Registry>,
    write_timeout: Duration,
    logger: Logger,
}

impl Broadcaster {
    pub fn new(registry: Arc<Registry>, write_timeout: Duration, logger: Logger) -> Self {
        Self {
            registry,
            write_timeout,
            logger,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }

    /// Send `message` (newline-terminated) to everyone except `excluding`.
    ///
    /// Each recipient is written from its own task, so one stalled client
    /// costs at most `write_timeout` and never delays the others. Failures are
    /// logged and collected. A failed or timed-out write marks the recipient's
    /// connection broken, so later broadcasts skip it instead of appending to
    /// a partial line; the entry stays registered until its own session sees
    /// the break and cleans up.
    pub async fn broadcast(&self, message: &str, excluding: Option<ConnectionId>) -> BroadcastReport {
        // 1) Copy the recipients out; the registry lock is released here
        let snapshot = self.registry.snapshot(excluding).await;

        self.logger.info(&format!("📢 {}", message));

        let mut report = BroadcastReport::default();
        if snapshot.is_empty() {
            return report;
        }

        // 2) Build the bytes once; clones share the buffer
        let payload = Bytes::from(ensure_trailing_newline(message).into_owned());

        // 3) One write task per recipient
        let mut tasks = Vec::with_capacity(snapshot.len());
        for recipient in snapshot {
            let buf = payload.clone();
            let timeout = self.write_timeout;
            tasks.push(tokio::spawn(async move {
                let result = recipient.write_timed(&buf, timeout).await;
                (recipient, result)
            }));
        }

        // 4) Collect outcomes; nothing here can fail the caller
        for task in tasks {
            match task.await {
                Ok((_, Ok(()))) => report.delivered += 1,
                Ok((recipient, Err(source))) => {
                    let failure = WriteFailure {
                        id: recipient.id(),
                        peer: recipient.peer().to_string(),
                        source,
                    };
                    self.logger.warn(&format!("❌ {}", failure));
                    report.failures.push(failure);
                }
                Err(e) => {
                    self.logger.error(&format!("Broadcast write task failed: {}", e));
                }
            }
        }

        report
    }
}

/// Borrow `s` if it already ends in `\n`, otherwise allocate with one appended.
fn ensure_trailing_newline(s: &str) -> Cow<'_, str> {
    if s.ends_with('\n') {
        Cow::Borrowed(s)
    } else {
        Cow::Owned(format!("{s}\n"))
    }
}
