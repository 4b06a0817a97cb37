//! Seam between the copy sink and the owning database connection.
//!
//! The connection handles the session lifecycle (startup, auth, the message
//! decode loop); the sink only borrows its write half for the duration of
//! one copy operation and hears back through
//! [`CopyInEvents`](crate::copy_in::CopyInEvents).

use anyhow::Result;
use tokio::sync::oneshot;

/// Write half of a connection hosting one in-flight copy operation.
///
/// The sink owns the transport exclusively while the operation is in flight;
/// nothing else may write to it between submission and the final
/// acknowledgment. Implementations deliver backend events (copy-in ready,
/// completion, errors) from their own dispatch task, never from inside these
/// methods: the sink re-enters its own state on event delivery.
pub trait CopyConnection: Send {
    /// Queue the COPY command for the backend. Failures surface later
    /// through the error event, not here.
    fn submit(&mut self, command: &str);

    /// Write one raw frame to the transport. `Ok(false)` means the write
    /// buffer is now saturated and the caller must wait for the drain
    /// signal before writing again. `Err` is a transport failure, terminal
    /// for the operation.
    fn write_frame(&mut self, frame: &[u8]) -> Result<bool>;

    /// One-shot notification that a saturated transport can accept more
    /// data. The sender is dropped (closing the channel) if the connection
    /// dies first.
    fn drain_signal(&mut self) -> oneshot::Receiver<()>;

    /// Ask the backend to abandon the load and roll back. The backend
    /// acknowledges with an error report, which arrives via the error
    /// event; no frame is written here.
    fn send_abort(&mut self, reason: &str);
}
