// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Replayable task event stream: a buffer teed into a broadcast channel.
//!
//! Late subscribers first receive every buffered event, then switch to
//! live delivery with no gap (the broadcast subscription is taken under
//! the same lock that guards publishing).  Terminal states are
//! `complete` and `fail`; a failed subject yields one final `Err` item
//! to every subscriber.  Backpressure is not designed: consumers are
//! expected to drain, and a subscriber that lags far enough to overflow
//! the broadcast ring misses those live events.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use futures::Stream;
use tokio::sync::broadcast;
use tokio_stream::{wrappers::BroadcastStream, StreamExt};

use crate::{events::TaskEventEnvelope, event_id, TaskError, TaskEvent, TaskEventId};

#[derive(Clone)]
enum Signal {
    Event(TaskEventEnvelope),
    Complete,
    Fail(Arc<TaskError>),
}

enum Terminal {
    Completed,
    Failed(Arc<TaskError>),
}

struct Inner {
    buffer: Vec<TaskEventEnvelope>,
    terminal: Option<Terminal>,
}

/// Buffered publish/subscribe subject for one task's events.
#[derive(Clone)]
pub struct ReplaySubject {
    inner: Arc<Mutex<Inner>>,
    live_tx: broadcast::Sender<Signal>,
}

impl ReplaySubject {
    pub fn new() -> Self {
        let (live_tx, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                buffer: Vec::new(),
                terminal: None,
            })),
            live_tx,
        }
    }

    /// Tag an event with a fresh id and deliver it to the buffer and all
    /// live subscribers.  Ignored after a terminal state.
    pub fn publish(&self, event: TaskEvent) -> Option<TaskEventId> {
        let mut inner = self.inner.lock().expect("subject poisoned");
        if inner.terminal.is_some() {
            return None;
        }
        let envelope = TaskEventEnvelope {
            event_id: event_id::generate(),
            event,
        };
        inner.buffer.push(envelope.clone());
        let _ = self.live_tx.send(Signal::Event(envelope.clone()));
        Some(envelope.event_id)
    }

    /// Finish the stream normally.
    pub fn complete(&self) {
        let mut inner = self.inner.lock().expect("subject poisoned");
        if inner.terminal.is_some() {
            return;
        }
        inner.terminal = Some(Terminal::Completed);
        let _ = self.live_tx.send(Signal::Complete);
    }

    /// Terminate the stream with an error; subscribers receive it as the
    /// final item.
    pub fn fail(&self, error: TaskError) {
        let mut inner = self.inner.lock().expect("subject poisoned");
        if inner.terminal.is_some() {
            return;
        }
        let error = Arc::new(error);
        inner.terminal = Some(Terminal::Failed(Arc::clone(&error)));
        let _ = self.live_tx.send(Signal::Fail(error));
    }

    /// Subscribe from the beginning: buffered events replay first.
    pub fn subscribe(
        &self,
    ) -> impl Stream<Item = Result<TaskEventEnvelope, Arc<TaskError>>> + Send + Unpin {
        self.subscribe_inner(None)
    }

    /// Subscribe resuming past `last_event_id`: only buffered events
    /// strictly after it replay.
    pub fn subscribe_after(
        &self,
        last_event_id: TaskEventId,
    ) -> impl Stream<Item = Result<TaskEventEnvelope, Arc<TaskError>>> + Send + Unpin {
        self.subscribe_inner(Some(last_event_id))
    }

    fn subscribe_inner(
        &self,
        after: Option<TaskEventId>,
    ) -> impl Stream<Item = Result<TaskEventEnvelope, Arc<TaskError>>> + Send + Unpin {
        // Snapshot and subscription happen under the publish lock, so
        // nothing is missed or duplicated at the hand-over point.
        let inner = self.inner.lock().expect("subject poisoned");
        let mut pending: VecDeque<Result<TaskEventEnvelope, Arc<TaskError>>> = inner
            .buffer
            .iter()
            .filter(|e| after.map_or(true, |a| e.event_id.is_after(&a)))
            .cloned()
            .map(Ok)
            .collect();
        let live = match &inner.terminal {
            None => Some(BroadcastStream::new(self.live_tx.subscribe())),
            Some(Terminal::Completed) => None,
            Some(Terminal::Failed(e)) => {
                pending.push_back(Err(Arc::clone(e)));
                None
            }
        };
        drop(inner);

        Box::pin(futures::stream::unfold(
            (pending, live, false),
            |(mut pending, mut live, mut failed)| async move {
                loop {
                    if let Some(item) = pending.pop_front() {
                        let is_err = item.is_err();
                        if is_err {
                            failed = true;
                        }
                        return Some((item, (pending, live, failed)));
                    }
                    if failed {
                        return None;
                    }
                    let stream = live.as_mut()?;
                    match stream.next().await {
                        None => return None,
                        // A lagged subscriber missed live events; skip
                        // the gap (documented limitation).
                        Some(Err(_)) => continue,
                        Some(Ok(Signal::Event(ev))) => {
                            return Some((Ok(ev), (pending, live, failed)))
                        }
                        Some(Ok(Signal::Complete)) => return None,
                        Some(Ok(Signal::Fail(e))) => {
                            return Some((Err(e), (pending, None, true)))
                        }
                    }
                }
            },
        ))
    }
}

impl Default for ReplaySubject {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
