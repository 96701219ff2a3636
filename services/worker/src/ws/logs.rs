//! Ordered, loss-reporting delivery of generator log lines.
//!
//! Lines are sequenced as they are captured. While the connection is down they
//! accumulate in a bounded buffer; once it is full the oldest line is dropped
//! and the next delivered `log` frame reports how many were lost. Sequence
//! numbers are never reused, so a dropped line shows up as a gap.

use super::connection::{ConnectionState, Outbound};
use super::protocol::Message;
use genloop_core::LogLine;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A captured line together with its sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub sequence: u64,
    pub line: LogLine,
}

/// Sequencing buffer for one session.
#[derive(Debug)]
pub struct LogStreamer {
    generation_id: String,
    capacity: usize,
    next_sequence: Arc<AtomicU64>,
    buffer: VecDeque<LogEntry>,
    /// Lines dropped since the last delivered frame.
    pending_dropped: u64,
    total_dropped: u64,
}

impl LogStreamer {
    pub fn new(generation_id: impl Into<String>, capacity: usize, first_sequence: u64) -> Self {
        Self {
            generation_id: generation_id.into(),
            capacity: capacity.max(1),
            next_sequence: Arc::new(AtomicU64::new(first_sequence)),
            buffer: VecDeque::new(),
            pending_dropped: 0,
            total_dropped: 0,
        }
    }

    /// Assigns the next sequence number and buffers the line.
    pub fn capture(&mut self, line: LogLine) -> u64 {
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        if self.buffer.len() == self.capacity {
            if let Some(evicted) = self.buffer.pop_front() {
                debug!(sequence = evicted.sequence, "Log buffer full; dropping oldest line");
            }
            self.pending_dropped += 1;
            self.total_dropped += 1;
        }
        self.buffer.push_back(LogEntry { sequence, line });
        sequence
    }

    /// Takes the oldest buffered line as a `log` frame.
    pub fn next_frame(&mut self) -> Option<Message> {
        let entry = self.buffer.pop_front()?;
        let dropped_count = match std::mem::take(&mut self.pending_dropped) {
            0 => None,
            n => Some(n),
        };
        Some(Message::Log {
            generation_id: self.generation_id.clone(),
            sequence: entry.sequence,
            text: entry.line.text,
            stream: entry.line.stream,
            timestamp: Some(entry.line.timestamp),
            dropped_count,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn total_dropped(&self) -> u64 {
        self.total_dropped
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence.load(Ordering::SeqCst)
    }

    /// Spawns the drain task that feeds buffered lines to the connection.
    pub fn spawn(
        self,
        lines: mpsc::Receiver<LogLine>,
        outbound: mpsc::Sender<Outbound>,
        link: watch::Receiver<ConnectionState>,
    ) -> LogStreamHandle {
        let sequence = Arc::clone(&self.next_sequence);
        let (flush_tx, flush_rx) = mpsc::channel(4);
        let drain = LogDrain {
            streamer: self,
            lines,
            outbound,
            link,
            flush_rx,
        };
        LogStreamHandle {
            flush_tx,
            sequence,
            task: tokio::spawn(drain.run()),
        }
    }
}

/// Statistics returned when the drain task finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogStats {
    pub next_sequence: u64,
    pub dropped: u64,
    /// Lines still buffered when the connection went away for good.
    pub undelivered: u64,
}

/// Control handle for a running drain task.
pub struct LogStreamHandle {
    flush_tx: mpsc::Sender<oneshot::Sender<()>>,
    sequence: Arc<AtomicU64>,
    task: JoinHandle<LogStats>,
}

impl LogStreamHandle {
    /// Pushes everything captured so far to the connection if it is up.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.flush_tx.send(ack_tx).await.is_ok() {
            let _ = ack_rx.await;
        }
    }

    pub fn next_sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    /// Waits for the drain task to deliver what it still holds and exit.
    ///
    /// The task exits once every [`genloop_core::LogSink`] clone is dropped.
    pub async fn finish(self) -> LogStats {
        drop(self.flush_tx);
        match self.task.await {
            Ok(stats) => stats,
            Err(e) => {
                warn!(error = %e, "Log drain task failed");
                LogStats::default()
            }
        }
    }
}

struct LogDrain {
    streamer: LogStreamer,
    lines: mpsc::Receiver<LogLine>,
    outbound: mpsc::Sender<Outbound>,
    link: watch::Receiver<ConnectionState>,
    flush_rx: mpsc::Receiver<oneshot::Sender<()>>,
}

impl LogDrain {
    async fn run(mut self) -> LogStats {
        let mut link_open = true;
        let mut flush_open = true;
        loop {
            let live = self.link.borrow().is_live();
            let can_send = live && !self.streamer.is_empty() && !self.outbound.is_closed();
            let mut pending_ack = None;
            tokio::select! {
                line = self.lines.recv() => match line {
                    Some(line) => {
                        self.streamer.capture(line);
                    }
                    None => break,
                },
                permit = self.outbound.reserve(), if can_send => {
                    if let Ok(permit) = permit {
                        if let Some(frame) = self.streamer.next_frame() {
                            permit.send(Outbound::Frame(frame));
                        }
                    }
                },
                changed = self.link.changed(), if link_open => {
                    if changed.is_err() {
                        link_open = false;
                    }
                },
                ack = self.flush_rx.recv(), if flush_open => match ack {
                    Some(ack) => pending_ack = Some(ack),
                    None => flush_open = false,
                },
            }
            // Flushed outside the select so no branch future still borrows the drain.
            if let Some(ack) = pending_ack {
                self.flush().await;
                let _ = ack.send(());
            }
        }

        // Every producer is gone: hand over whatever is left, in order.
        while let Some(frame) = self.streamer.next_frame() {
            if self.outbound.send(Outbound::Frame(frame)).await.is_err() {
                break;
            }
        }
        let undelivered = self.streamer.len() as u64;
        if undelivered > 0 {
            warn!(undelivered, "Connection closed with log lines still buffered");
        }
        LogStats {
            next_sequence: self.streamer.next_sequence(),
            dropped: self.streamer.total_dropped(),
            undelivered,
        }
    }

    async fn flush(&mut self) {
        while let Ok(line) = self.lines.try_recv() {
            self.streamer.capture(line);
        }
        if !self.link.borrow().is_live() {
            return;
        }
        while let Some(frame) = self.streamer.next_frame() {
            if self.outbound.send(Outbound::Frame(frame)).await.is_err() {
                break;
            }
        }
    }
}
