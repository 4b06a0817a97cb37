//! Copy-in sink: buffers producer writes and streams them to the backend as
//! data frames once the server has entered copy-in mode.
//!
//! The sink is a small state machine driven from two sides. The producer
//! calls [`CopyInSink::write`]/[`CopyInSink::finish`]/[`CopyInSink::abort`];
//! the connection's dispatch loop delivers backend events through
//! [`CopyInEvents`]. The two sides never run a handler concurrently (state
//! sits behind one mutex) but their interleaving is arbitrary: a write can
//! land before the backend is ready, readiness can land mid-write. The
//! machine imposes the protocol order - no data frame before readiness, the
//! termination frame last, completion only after the backend returns to
//! idle - using at most one pending one-shot continuation at a time.

use crate::connection::CopyConnection;
use crate::protocol;
use anyhow::{anyhow, bail, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Default flush threshold: buffered bytes above this are framed and written
/// out eagerly once the backend is ready.
pub const DEFAULT_MAX_BUFFER: usize = 512 * 1024;

#[derive(Clone, Debug)]
pub struct CopyInConfig {
    /// Buffered-byte threshold that forces a flush before the producer's
    /// write is acknowledged. Only applies once the backend is in copy-in
    /// mode; before that, writes always buffer and ack immediately.
    pub max_buffer: usize,
}

impl Default for CopyInConfig {
    fn default() -> Self {
        CopyInConfig {
            max_buffer: DEFAULT_MAX_BUFFER,
        }
    }
}

impl CopyInConfig {
    fn validate(&self) -> Result<()> {
        if self.max_buffer == 0 {
            bail!("max_buffer must be nonzero");
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Created,
    AwaitingReady,
    Streaming,
    Finishing,
    AwaitingDone,
    AwaitingAbortAck,
    Done,
    Errored,
}

impl Phase {
    fn terminal(self) -> bool {
        matches!(self, Phase::Done | Phase::Errored)
    }
}

/// The single outstanding continuation. Protocol steps are strictly
/// sequential, so at most one of these is live; resolving one consumes the
/// sender, which makes "already resolved" structural rather than a flag.
enum Pending {
    None,
    Ready(oneshot::Sender<Result<()>>),
    Done(oneshot::Sender<Result<Option<u64>>>),
    AbortAck(oneshot::Sender<Result<()>>),
}

impl Pending {
    fn take(&mut self) -> Pending {
        std::mem::replace(self, Pending::None)
    }
}

struct Shared {
    phase: Phase,
    // Borrowed for the duration of one operation; dropped on completion or
    // error so no further frame can leave this instance.
    conn: Option<Box<dyn CopyConnection>>,
    chunks: VecDeque<Vec<u8>>,
    buffered: usize,
    max_buffer: usize,
    server_ready: bool,
    pending: Pending,
    rows: Option<u64>,
    // Drain left over from a flush performed in event context; the next
    // producer-side flush waits it out first.
    drain: Option<oneshot::Receiver<()>>,
    // Error that arrived while no continuation was outstanding; handed to
    // the producer on its next call.
    failure: Option<anyhow::Error>,
}

impl Shared {
    fn take_failure(&mut self) -> anyhow::Error {
        self.failure
            .take()
            .unwrap_or_else(|| anyhow!("copy operation already failed"))
    }

    /// Frame and write everything buffered. Returns the drain receiver when
    /// the transport reports saturation; the caller decides whether to wait
    /// (producer context) or park it (event context).
    fn flush(&mut self) -> Result<Option<oneshot::Receiver<()>>> {
        if self.buffered == 0 {
            return Ok(None);
        }
        let mut payload = Vec::with_capacity(self.buffered);
        for chunk in self.chunks.drain(..) {
            payload.extend_from_slice(&chunk);
        }
        self.buffered = 0;
        let frame = protocol::data_frame(&payload)?;
        let mut conn = self
            .conn
            .take()
            .ok_or_else(|| anyhow!("copy connection detached"))?;
        match conn.write_frame(&frame) {
            Ok(true) => {
                self.conn = Some(conn);
                Ok(None)
            }
            Ok(false) => {
                let rx = conn.drain_signal();
                self.conn = Some(conn);
                Ok(Some(rx))
            }
            Err(e) => {
                self.phase = Phase::Errored;
                Err(e)
            }
        }
    }
}

/// Create a copy-in operation for `command` (e.g. `COPY t FROM STDIN`).
///
/// Returns the producer-side sink and the event handle the connection's
/// dispatch loop uses to deliver backend messages for this operation.
pub fn copy_in(
    command: impl Into<String>,
    config: CopyInConfig,
) -> Result<(CopyInSink, CopyInEvents)> {
    config.validate()?;
    let shared = Arc::new(Mutex::new(Shared {
        phase: Phase::Created,
        conn: None,
        chunks: VecDeque::new(),
        buffered: 0,
        max_buffer: config.max_buffer,
        server_ready: false,
        pending: Pending::None,
        rows: None,
        drain: None,
        failure: None,
    }));
    let sink = CopyInSink {
        shared: shared.clone(),
        command: command.into(),
    };
    Ok((sink, CopyInEvents { shared }))
}

/// Producer half: a backpressured byte sink for one bulk-load operation.
///
/// Not reusable; `finish` and `abort` consume it.
pub struct CopyInSink {
    shared: Arc<Mutex<Shared>>,
    command: String,
}

impl CopyInSink {
    /// Submit the copy command over `conn` and take exclusive use of its
    /// write half until the operation settles.
    pub fn start(&mut self, mut conn: Box<dyn CopyConnection>) -> Result<()> {
        let mut s = self.shared.lock();
        if s.phase != Phase::Created {
            bail!("copy operation already started");
        }
        conn.submit(&self.command);
        s.conn = Some(conn);
        s.phase = Phase::AwaitingReady;
        Ok(())
    }

    /// Append `chunk` to the outgoing stream.
    ///
    /// Before the backend is ready this always buffers and returns
    /// immediately. Afterwards, a write that pushes the buffer over the
    /// threshold is only acknowledged once the flush - and any transport
    /// drain it runs into - has completed. That deferred return is the
    /// backpressure the producer sees.
    pub async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        {
            let mut s = self.shared.lock();
            match s.phase {
                Phase::Created | Phase::AwaitingReady | Phase::Streaming => {}
                Phase::Errored => return Err(s.take_failure()),
                _ => bail!("copy sink is no longer accepting data"),
            }
            s.chunks.push_back(chunk.to_vec());
            s.buffered += chunk.len();
            if !s.server_ready || s.buffered <= s.max_buffer {
                return Ok(());
            }
        }
        self.flush_buffered().await
    }

    /// Signal end of input: flush what remains, send the termination frame,
    /// and wait for the backend to report the load durably applied. Returns
    /// the affected-row count from the completion report, when present.
    pub async fn finish(mut self) -> Result<Option<u64>> {
        {
            let mut s = self.shared.lock();
            match s.phase {
                Phase::AwaitingReady | Phase::Streaming => s.phase = Phase::Finishing,
                Phase::Created => bail!("copy operation was never submitted"),
                Phase::Errored => return Err(s.take_failure()),
                _ => bail!("copy operation already finished"),
            }
        }
        // The termination frame can only follow the backend's ready signal,
        // and all buffered data must be out first.
        self.wait_server_ready().await?;
        self.flush_buffered().await?;
        let rx = {
            let mut s = self.shared.lock();
            if s.phase.terminal() {
                return Err(s.take_failure());
            }
            let mut conn = s
                .conn
                .take()
                .ok_or_else(|| anyhow!("copy connection detached"))?;
            match conn.write_frame(&protocol::done_frame()) {
                // Saturation here is fine: the frame is queued and nothing
                // further gets written for this operation.
                Ok(_) => s.conn = Some(conn),
                Err(e) => {
                    s.phase = Phase::Errored;
                    return Err(e);
                }
            }
            s.phase = Phase::AwaitingDone;
            let (tx, rx) = oneshot::channel();
            s.pending = Pending::Done(tx);
            rx
        };
        match rx.await {
            Ok(res) => res,
            Err(_) => Err(self.shared.lock().take_failure()),
        }
    }

    /// Cancel the load: ask the backend to roll back whatever partial data
    /// it holds. The backend's rollback report resolves this call; buffered
    /// but unsent bytes are discarded.
    ///
    /// A cancel cannot be transmitted before the backend has entered
    /// copy-in mode, so an early abort waits for the ready signal first.
    /// Aborting an operation that was never submitted is a local error; the
    /// server is not contacted.
    pub async fn abort(mut self, reason: &str) -> Result<()> {
        {
            let mut s = self.shared.lock();
            match s.phase {
                Phase::Created => bail!("copy operation was never submitted; nothing to cancel"),
                Phase::Errored => return Err(s.take_failure()),
                Phase::Done => bail!("copy operation already finished"),
                _ => s.phase = Phase::AwaitingAbortAck,
            }
        }
        self.wait_server_ready().await?;
        let rx = {
            let mut s = self.shared.lock();
            if s.phase.terminal() {
                return Err(s.take_failure());
            }
            s.chunks.clear();
            s.buffered = 0;
            let conn = s
                .conn
                .as_mut()
                .ok_or_else(|| anyhow!("copy connection detached"))?;
            conn.send_abort(reason);
            let (tx, rx) = oneshot::channel();
            s.pending = Pending::AbortAck(tx);
            rx
        };
        match rx.await {
            Ok(res) => res,
            Err(_) => Err(self.shared.lock().take_failure()),
        }
    }

    /// Park until the backend's copy-in ready signal has been seen.
    async fn wait_server_ready(&mut self) -> Result<()> {
        let rx = {
            let mut s = self.shared.lock();
            if s.phase.terminal() {
                return Err(s.take_failure());
            }
            if s.server_ready {
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            s.pending = Pending::Ready(tx);
            rx
        };
        match rx.await {
            Ok(res) => res,
            Err(_) => Err(self.shared.lock().take_failure()),
        }
    }

    /// Flush all buffered bytes, waiting out transport backpressure. The
    /// producer call that triggered this does not return until the
    /// transport has accepted the frame.
    async fn flush_buffered(&mut self) -> Result<()> {
        // A flush performed in event context may have saturated the
        // transport; wait for that drain before framing more data.
        let leftover = self.shared.lock().drain.take();
        if let Some(rx) = leftover {
            if rx.await.is_err() {
                return Err(self.shared.lock().take_failure());
            }
        }
        let wait = {
            let mut s = self.shared.lock();
            if s.phase.terminal() {
                return Err(s.take_failure());
            }
            s.flush()?
        };
        if let Some(rx) = wait {
            if rx.await.is_err() {
                return Err(self.shared.lock().take_failure());
            }
        }
        Ok(())
    }
}

/// Connection half: the handle the dispatch loop uses to deliver backend
/// events for one copy operation.
///
/// Once the operation has settled (completed or failed), every method is a
/// no-op; stray events from a sloppy dispatch loop cannot produce a second
/// completion or any further frame.
#[derive(Clone)]
pub struct CopyInEvents {
    shared: Arc<Mutex<Shared>>,
}

impl CopyInEvents {
    /// Backend entered copy-in mode. Bytes buffered while the handshake was
    /// outstanding go out now as the first data frame; a parked finish or
    /// abort resumes instead.
    pub fn copy_in_ready(&self) {
        let mut s = self.shared.lock();
        if s.phase.terminal() || s.server_ready {
            return;
        }
        s.server_ready = true;
        if s.phase == Phase::AwaitingReady {
            s.phase = Phase::Streaming;
        }
        match s.pending.take() {
            Pending::Ready(tx) => {
                let _ = tx.send(Ok(()));
            }
            Pending::None => match s.flush() {
                Ok(Some(rx)) => s.drain = Some(rx),
                Ok(None) => {}
                Err(e) => s.failure = Some(e),
            },
            other => s.pending = other,
        }
    }

    /// Completion report from the backend, e.g. `COPY 1234`. Records the
    /// affected-row count; the producer is released only on the subsequent
    /// return-to-idle event.
    pub fn command_complete(&self, tag: &str) {
        let mut s = self.shared.lock();
        if s.phase.terminal() {
            return;
        }
        s.rows = protocol::command_rows(tag);
    }

    /// Backend returned to idle: the load is durably applied. Releases the
    /// waiting finish() call and drops the connection reference.
    pub fn ready_for_query(&self) {
        let mut s = self.shared.lock();
        if s.phase.terminal() {
            return;
        }
        match s.pending.take() {
            Pending::Done(tx) => {
                s.phase = Phase::Done;
                s.conn = None;
                let rows = s.rows;
                let _ = tx.send(Ok(rows));
            }
            other => s.pending = other,
        }
    }

    /// Terminal failure for the operation, from the backend or the
    /// transport. Resolves whichever protocol step is parked; with none
    /// outstanding the error is held for the producer's next call.
    ///
    /// This is also the expected acknowledgment of a producer-requested
    /// cancel - the backend reports the rollback as an error, which
    /// resolves the waiting abort() successfully. An external timeout layer
    /// short-circuits a stalled operation through this same path.
    pub fn connection_error(&self, err: anyhow::Error) {
        let mut s = self.shared.lock();
        if s.phase.terminal() {
            return;
        }
        s.phase = Phase::Errored;
        s.conn = None;
        s.chunks.clear();
        s.buffered = 0;
        s.drain = None;
        match s.pending.take() {
            Pending::Ready(tx) => {
                let _ = tx.send(Err(err));
            }
            Pending::Done(tx) => {
                let _ = tx.send(Err(err));
            }
            Pending::AbortAck(tx) => {
                let _ = tx.send(Ok(()));
            }
            Pending::None => s.failure = Some(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_rejects_zero_threshold() {
        let cfg = CopyInConfig { max_buffer: 0 };
        assert!(copy_in("COPY t FROM STDIN", cfg).is_err());
    }

    #[test]
    fn config_default_threshold() {
        assert_eq!(CopyInConfig::default().max_buffer, 512 * 1024);
    }

    #[tokio::test]
    async fn abort_before_submit_is_local_error() {
        let (sink, _events) = copy_in("COPY t FROM STDIN", CopyInConfig::default()).unwrap();
        let err = sink.abort("changed my mind").await.unwrap_err();
        assert!(err.to_string().contains("never submitted"));
    }

    #[tokio::test]
    async fn finish_before_submit_is_local_error() {
        let (sink, _events) = copy_in("COPY t FROM STDIN", CopyInConfig::default()).unwrap();
        assert!(sink.finish().await.is_err());
    }

    #[tokio::test]
    async fn write_before_submit_buffers() {
        let (mut sink, _events) = copy_in("COPY t FROM STDIN", CopyInConfig::default()).unwrap();
        sink.write(b"row\n").await.unwrap();
        assert_eq!(sink.shared.lock().buffered, 4);
    }
}
