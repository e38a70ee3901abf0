// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-subscriber tail session.
//!
//! A [`Tailer`] turns one subscriber cursor into a restartable event
//! stream with two modes:
//!
//! ```text
//!             ┌──────────────┐
//!  cursor ──▶ │  decide mode │
//!             └──────┬───────┘
//!      operation id / none          replication id
//!                    │                     │
//!                    ▼                     ▼
//!             ┌────────────┐       ┌──────────────┐
//!             │ LIVE tail  │◀──────│  REPLICATE   │
//!             │ op-log     │ done, │ states by ts │
//!             │            │ emit  │ (paged)      │
//!             └─────┬──────┘ live  └─────┬────────┘
//!                   │ error / empty      │ error
//!                   └───── backoff ──────┘
//! ```
//!
//! Replication is bounded by a snapshot of the op-log tail taken before
//! the first page, so the handoff to live tailing is gap-free: the
//! `live` control event carries the last replayed id, and tailing
//! resumes strictly after the captured tail. Every store error closes
//! the session, refreshes it, backs off, and resumes from the last
//! emitted position. Delivery is at-least-once; consumers dedupe by
//! event id.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::filter::Filter;
use crate::ident::{LastId, OpId};
use crate::operation::{unix_millis, StreamEvent, UrlTemplate};
use crate::resilience::retry::{Backoff, RetryConfig};
use crate::storage::traits::{OpStore, StateCursor, StateEvents, StoreError, TailChunk};

/// Default replication page size.
const DEFAULT_PAGE_SIZE: usize = 1000;

/// Default blocking window for one tail read.
const DEFAULT_TAIL_TIMEOUT: Duration = Duration::from_secs(5);

/// Where live tailing resumes on the op-log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TailAnchor {
    /// From the start of the (capped) log.
    Start,
    /// From whatever the tail end is right now; resolved to a concrete
    /// position on first use.
    Current,
    /// Strictly after this operation.
    After(OpId),
}

/// The session's current mode, decided from the cursor variant.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Mode {
    Replicate { from: StateCursor, fallback: bool },
    Live { anchor: TailAnchor },
}

impl Mode {
    fn from_cursor(cursor: Option<LastId>) -> Self {
        match cursor {
            None => Mode::Live { anchor: TailAnchor::Current },
            Some(LastId::Operation(id)) => Mode::Live { anchor: TailAnchor::After(id) },
            Some(LastId::Replication { ts, fallback }) => Mode::Replicate {
                from: StateCursor::from_ts(ts),
                fallback,
            },
        }
    }
}

enum ReplicateOutcome {
    /// Replication exhausted; go live strictly after the captured tail.
    Done { resume: TailAnchor },
    /// Store error; retry from just past the last emitted state.
    Retry { from: StateCursor },
    /// Subscriber went away or shutdown fired.
    Stopped,
}

enum TailOutcome {
    Progress,
    /// The blocking read timed out with no new data; re-tail at once.
    Idle,
    /// The op-log is empty; back off before retrying.
    Empty,
    /// Store error; refresh the session and back off.
    Failed,
    Stopped,
}

pub struct Tailer {
    store: Arc<dyn OpStore>,
    filter: Filter,
    template: Option<UrlTemplate>,
    page_size: usize,
    tail_timeout: Duration,
    retry: RetryConfig,
}

impl Tailer {
    #[must_use]
    pub fn new(store: Arc<dyn OpStore>, filter: Filter) -> Self {
        Self {
            store,
            filter,
            template: None,
            page_size: DEFAULT_PAGE_SIZE,
            tail_timeout: DEFAULT_TAIL_TIMEOUT,
            retry: RetryConfig::tail(),
        }
    }

    /// Render each emitted event's `ref` from this template.
    #[must_use]
    pub fn with_template(mut self, template: Option<UrlTemplate>) -> Self {
        self.template = template;
        self
    }

    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    #[must_use]
    pub fn with_tail_timeout(mut self, timeout: Duration) -> Self {
        self.tail_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Stream events for one subscriber until it disconnects or the
    /// token fires.
    ///
    /// `cursor` is the subscriber's resume position: `None` resumes from
    /// the current tail end, an operation id resumes live tailing, a
    /// replication id replays states first. The full-sync cursor emits a
    /// `reset` control event (id `"1"`) before anything else.
    #[tracing::instrument(skip(self, out, cancel), fields(cursor = ?cursor))]
    pub async fn run(
        self,
        cursor: Option<LastId>,
        out: mpsc::Sender<StreamEvent>,
        cancel: CancellationToken,
    ) {
        debug!("tail session started");

        if cursor.is_some_and(|c| c.is_full_sync()) {
            // Id "1" parses as a non-zero cursor, so a consumer that
            // reconnects right after the reset does not get a second one.
            if !self.emit(&out, &cancel, StreamEvent::Reset).await {
                return;
            }
        }

        let mut mode = Mode::from_cursor(cursor);
        let mut backoff = Backoff::new(&self.retry);

        loop {
            if cancel.is_cancelled() {
                break;
            }
            mode = match mode {
                Mode::Replicate { from, fallback } => {
                    match self.replicate(from, fallback, &out, &cancel).await {
                        ReplicateOutcome::Done { resume } => {
                            backoff.reset();
                            Mode::Live { anchor: resume }
                        }
                        ReplicateOutcome::Retry { from } => {
                            self.store.reset_session().await;
                            if !backoff.sleep_unless_cancelled(&cancel).await {
                                break;
                            }
                            Mode::Replicate { from, fallback }
                        }
                        ReplicateOutcome::Stopped => break,
                    }
                }
                Mode::Live { anchor } => {
                    let (anchor, outcome) = self.tail_once(anchor, &out, &cancel).await;
                    match outcome {
                        TailOutcome::Progress => backoff.reset(),
                        TailOutcome::Idle => {}
                        TailOutcome::Empty => {
                            if !backoff.sleep_unless_cancelled(&cancel).await {
                                break;
                            }
                        }
                        TailOutcome::Failed => {
                            self.store.reset_session().await;
                            if !backoff.sleep_unless_cancelled(&cancel).await {
                                break;
                            }
                        }
                        TailOutcome::Stopped => break,
                    }
                    Mode::Live { anchor }
                }
            };
        }
        debug!("tail session ended");
    }

    /// Replay state snapshots past `from`, then hand off.
    async fn replicate(
        &self,
        from: StateCursor,
        fallback: bool,
        out: &mpsc::Sender<StreamEvent>,
        cancel: &CancellationToken,
    ) -> ReplicateOutcome {
        // Snapshot the live tail first: replication covers states up to
        // here, live tailing resumes strictly after it.
        let upper = match self.store.last_op_id().await {
            Ok(upper) => upper,
            Err(e) => return self.replicate_error(e, from),
        };
        let upper_ts = upper.map_or_else(unix_millis, |id| id.millis() as i64);

        // A fresh sync has no database to delete from; only a fallback
        // cursor (the client was live) needs the tombstones.
        let events = if fallback { StateEvents::All } else { StateEvents::InsertsOnly };

        debug!(from_ts = from.ts, upper_ts, fallback, "starting replication");

        // Advancing past each emitted state (id tiebreak included)
        // never re-reads the page boundary and pages through timestamp
        // ties wider than one page.
        let mut cursor = from;
        let mut last_emitted: Option<String> = None;

        loop {
            if cancel.is_cancelled() {
                return ReplicateOutcome::Stopped;
            }
            let page = match self
                .store
                .read_states(&cursor, upper_ts, &self.filter, events, self.page_size)
                .await
            {
                Ok(page) => page,
                Err(e) => return self.replicate_error(e, cursor),
            };
            let full = page.len() == self.page_size;

            for state in page {
                cursor = StateCursor::after(&state);
                last_emitted = Some(state.event_id());
                if !self.emit(out, cancel, StreamEvent::State(state)).await {
                    return ReplicateOutcome::Stopped;
                }
            }

            if !full {
                break;
            }
        }

        // The live id is the last replayed state's id, so a consumer
        // that drops right after `live` resumes replication there.
        let live_id = last_emitted.unwrap_or_default();
        if !self.emit(out, cancel, StreamEvent::Live { id: live_id }).await {
            return ReplicateOutcome::Stopped;
        }
        debug!("replication done, switching to live tail");

        ReplicateOutcome::Done {
            resume: upper.map_or(TailAnchor::Start, TailAnchor::After),
        }
    }

    fn replicate_error(&self, e: StoreError, from: StateCursor) -> ReplicateOutcome {
        warn!(error = %e, "replication read failed, will refresh session and retry");
        crate::metrics::record_tail_error("replicate");
        ReplicateOutcome::Retry { from }
    }

    /// One blocking read of the op-log. Returns the advanced anchor,
    /// which moves past everything scanned (matching the filter or
    /// not) so filtered-out operations are never rescanned.
    async fn tail_once(
        &self,
        anchor: TailAnchor,
        out: &mpsc::Sender<StreamEvent>,
        cancel: &CancellationToken,
    ) -> (TailAnchor, TailOutcome) {
        let anchor = if anchor == TailAnchor::Current {
            match self.store.last_op_id().await {
                Ok(Some(id)) => TailAnchor::After(id),
                Ok(None) => TailAnchor::Start,
                Err(e) => {
                    warn!(error = %e, "tail position lookup failed");
                    crate::metrics::record_tail_error("live");
                    return (anchor, TailOutcome::Failed);
                }
            }
        } else {
            anchor
        };
        let after = match anchor {
            TailAnchor::After(id) => Some(id),
            _ => None,
        };

        match self.store.tail_ops(after, &self.filter, self.tail_timeout).await {
            Ok(TailChunk::Ops { ops, last_seen }) => {
                for op in ops {
                    if !self.emit(out, cancel, StreamEvent::Operation(op)).await {
                        return (anchor, TailOutcome::Stopped);
                    }
                }
                (TailAnchor::After(last_seen), TailOutcome::Progress)
            }
            Ok(TailChunk::TimedOut) => (anchor, TailOutcome::Idle),
            Ok(TailChunk::EmptyLog) => (anchor, TailOutcome::Empty),
            Err(e) => {
                warn!(error = %e, "live tail failed, will refresh session and retry");
                crate::metrics::record_tail_error("live");
                (anchor, TailOutcome::Failed)
            }
        }
    }

    /// Render `ref` and deliver; false when the subscriber is gone.
    /// Emission blocks on a slow subscriber; the transport decides
    /// whether to disconnect it.
    async fn emit(
        &self,
        out: &mpsc::Sender<StreamEvent>,
        cancel: &CancellationToken,
        mut event: StreamEvent,
    ) -> bool {
        if let Some(ref template) = self.template {
            match &mut event {
                StreamEvent::Operation(op) => {
                    op.data.ref_url =
                        Some(template.render(&op.data.object_type, &op.data.object_id));
                }
                StreamEvent::State(state) => {
                    state.data.ref_url =
                        Some(template.render(&state.data.object_type, &state.data.object_id));
                }
                StreamEvent::Reset | StreamEvent::Live { .. } => {}
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => false,
            sent = out.send(event) => sent.is_ok(),
        }
    }
}
