//! Host callback model.
//!
//! The host hands every command a responder. One-shot commands answer once;
//! streaming commands answer repeatedly with `keep_callback = true` until a
//! final result closes the stream. [`ResponderHandle`] enforces that nothing
//! reaches the host after the final result.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::Error;

/// Outcome class of a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Success, with or without a payload.
    Ok,
    /// Failure; the payload carries the error object.
    Error,
    /// No data. Used to close a stream on the host side.
    NoResult,
}

/// A single result delivered to the host.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginResult {
    /// Outcome class.
    pub status: Status,
    /// Result payload.
    pub payload: Option<Value>,
    /// Whether the host should keep the callback for further results.
    pub keep_callback: bool,
}

impl PluginResult {
    /// A successful result.
    pub fn ok(payload: Option<Value>, keep_callback: bool) -> Self {
        Self {
            status: Status::Ok,
            payload,
            keep_callback,
        }
    }

    /// A failure carrying the error payload.
    pub fn error(err: &Error) -> Self {
        Self {
            status: Status::Error,
            payload: Some(err.to_payload()),
            keep_callback: false,
        }
    }

    /// A terminal no-result.
    pub fn no_result() -> Self {
        Self {
            status: Status::NoResult,
            payload: None,
            keep_callback: false,
        }
    }

    /// Whether this result is the last one on its callback.
    pub fn is_final(&self) -> bool {
        !self.keep_callback
    }
}

/// Host callback sink. Must be safe to invoke from any thread.
pub trait Responder: Send + Sync {
    /// Deliver a result to the host.
    fn send(&self, result: PluginResult);
}

/// Responder that forwards results into a tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelResponder {
    sender: mpsc::UnboundedSender<PluginResult>,
}

impl Responder for ChannelResponder {
    fn send(&self, result: PluginResult) {
        // The host may have dropped the receiver
        let _ = self.sender.send(result);
    }
}

/// Create a channel-backed responder handle and the receiving end.
pub fn responder_channel() -> (ResponderHandle, mpsc::UnboundedReceiver<PluginResult>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (ResponderHandle::new(Arc::new(ChannelResponder { sender })), receiver)
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

struct Inner {
    id: u64,
    responder: Arc<dyn Responder>,
    finished: Mutex<bool>,
}

/// Cloneable, thread-safe handle around a host responder.
///
/// After a result with `keep_callback = false` has been sent (or the handle
/// was [`revoke`](Self::revoke)d), every further call is dropped.
#[derive(Clone)]
pub struct ResponderHandle {
    inner: Arc<Inner>,
}

impl fmt::Debug for ResponderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponderHandle")
            .field("id", &self.inner.id)
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl ResponderHandle {
    /// Wrap a host responder.
    pub fn new(responder: Arc<dyn Responder>) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                responder,
                finished: Mutex::new(false),
            }),
        }
    }

    /// Process-unique identifier of this handle.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Whether the final result has been delivered.
    pub fn is_finished(&self) -> bool {
        *self.lock_finished()
    }

    /// Deliver a result unless the handle is already finished.
    ///
    /// Returns whether the result reached the host.
    pub fn send(&self, result: PluginResult) -> bool {
        let mut finished = self.lock_finished();
        if *finished {
            trace!(responder = self.inner.id, "dropping result after final");
            return false;
        }
        if result.is_final() {
            *finished = true;
        }
        self.inner.responder.send(result);
        true
    }

    /// Emit a payload, optionally keeping the callback open.
    pub fn emit(&self, payload: Value, keep_callback: bool) -> bool {
        self.send(PluginResult::ok(Some(payload), keep_callback))
    }

    /// One-shot success without a payload.
    pub fn success(&self) -> bool {
        self.send(PluginResult::ok(None, false))
    }

    /// One-shot failure.
    pub fn fail(&self, err: &Error) -> bool {
        self.send(PluginResult::error(err))
    }

    /// Close a stream with a terminal no-result.
    pub fn no_result(&self) -> bool {
        self.send(PluginResult::no_result())
    }

    /// Finish the handle without telling the host anything.
    pub fn revoke(&self) {
        *self.lock_finished() = true;
    }

    /// Whether two handles wrap the same host callback.
    pub fn same_as(&self, other: &ResponderHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn lock_finished(&self) -> std::sync::MutexGuard<'_, bool> {
        self.inner
            .finished
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stream_then_final() {
        let (handle, mut rx) = responder_channel();
        assert!(handle.emit(json!({"n": 1}), true));
        assert!(handle.emit(json!({"n": 2}), true));
        assert!(handle.no_result());
        assert!(!handle.emit(json!({"n": 3}), true));
        assert!(handle.is_finished());

        assert_eq!(rx.try_recv().unwrap().payload, Some(json!({"n": 1})));
        assert_eq!(rx.try_recv().unwrap().payload, Some(json!({"n": 2})));
        assert_eq!(rx.try_recv().unwrap().status, Status::NoResult);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_one_shot_is_idempotent() {
        let (handle, mut rx) = responder_channel();
        assert!(handle.success());
        assert!(!handle.fail(&Error::Busy));
        assert_eq!(rx.try_recv().unwrap().status, Status::Ok);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_revoke_silences_handle() {
        let (handle, mut rx) = responder_channel();
        let clone = handle.clone();
        handle.revoke();
        assert!(!clone.emit(json!(1), false));
        assert!(rx.try_recv().is_err());
        assert!(clone.same_as(&handle));
    }

    #[test]
    fn test_error_result_payload() {
        let (handle, mut rx) = responder_channel();
        handle.fail(&Error::NotConnected);
        let result = rx.try_recv().unwrap();
        assert_eq!(result.status, Status::Error);
        assert!(result.is_final());
        assert_eq!(result.payload.unwrap()["code"], "NotConnected");
    }

    #[test]
    fn test_handles_have_distinct_ids() {
        let (a, _rx_a) = responder_channel();
        let (b, _rx_b) = responder_channel();
        assert_ne!(a.id(), b.id());
        assert!(!a.same_as(&b));
    }
}
