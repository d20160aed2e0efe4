//! # LISTENER REGISTRY (PUBLISHER)
//!
//! A [Listener] receives typed callbacks for inbound frames and lifecycle
//! events; a [Publisher] is a named registry of listeners plus the
//! dispatch rule that turns one [Frame] into the matching callback. A
//! trait with default no-op methods plus a free-standing registry stands
//! in for a base class with empty virtual methods and a single `notify`
//! dispatch function.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use indexmap::IndexMap;
use tracing::warn;

use crate::frame::{
    Frame, CMD_BEFORE_MESSAGE, CMD_CONNECTED, CMD_CONNECTING, CMD_DISCONNECTED, CMD_ERROR,
    CMD_HEARTBEAT, CMD_HEARTBEAT_TIMEOUT, CMD_MESSAGE, CMD_RECEIPT, CMD_RECEIVER_LOOP_COMPLETED,
    CMD_SEND,
};
use crate::transport::HostAndPort;

/// ## LISTENER
///
/// Polymorphic over the full callback surface the core produces: connection
/// lifecycle, message pre/post-processing, receipts, errors, outbound
/// sends, heartbeats, and receiver-loop completion. Every method has an
/// empty default body, so implementors override only what they need.
///
/// [`notify`] is the synthetic base dispatcher: it maps a [Frame]'s
/// command (including the internal pseudo-commands) to the corresponding
/// typed method. Callers never need to override `notify` itself.
///
/// [`notify`]: Listener::notify
pub trait Listener: Send + Sync {
    fn on_connecting(&self, _host_and_port: Option<&HostAndPort>) {}
    fn on_connected(&self, _frame: &Frame) {}
    fn on_disconnected(&self) {}
    fn on_heartbeat_timeout(&self) {}
    /// Called before a `MESSAGE` is handed to [`on_message`]. Listeners
    /// that want to mutate headers/body do so by swapping the contents of
    /// `frame` in place.
    ///
    /// [`on_message`]: Listener::on_message
    fn on_before_message(&self, _frame: &mut Frame) {}
    fn on_message(&self, _frame: &Frame) {}
    fn on_receipt(&self, _frame: &Frame) {}
    fn on_error(&self, _frame: &Frame) {}
    fn on_send(&self, _frame: &Frame) {}
    fn on_heartbeat(&self) {}
    fn on_receiver_loop_completed(&self) {}

    /// Synthetic base dispatcher. Maps `frame.command` (including the
    /// pseudo-commands) to the matching typed method above.
    fn notify(&self, frame: &Frame, host_and_port: Option<&HostAndPort>) {
        match frame.command.as_str() {
            CMD_CONNECTING => self.on_connecting(host_and_port),
            CMD_CONNECTED => self.on_connected(frame),
            CMD_DISCONNECTED => self.on_disconnected(),
            CMD_HEARTBEAT_TIMEOUT => self.on_heartbeat_timeout(),
            CMD_BEFORE_MESSAGE => {}
            CMD_MESSAGE => self.on_message(frame),
            CMD_RECEIPT => self.on_receipt(frame),
            CMD_ERROR => self.on_error(frame),
            CMD_HEARTBEAT => self.on_heartbeat(),
            CMD_RECEIVER_LOOP_COMPLETED => self.on_receiver_loop_completed(),
            other => warn!(command = other, "notify: unrecognized frame command"),
        }
    }
}

/// ## PUBLISHER
///
/// A named mapping from listener name to listener. Mutation
/// (`set_listener`/`remove_listener`) and dispatch iteration are
/// serialized by a single [`Mutex`]; dispatch itself clones a snapshot of
/// the registered listeners out from under the lock before invoking any
/// callback, so a listener calling back into `set_listener`/
/// `remove_listener` from within its own callback cannot deadlock.
#[derive(Default)]
pub struct Publisher {
    listeners: Mutex<IndexMap<String, Arc<dyn Listener>>>,
}

impl Publisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `listener` under `name`, replacing any prior listener of
    /// the same name. Calling this twice with the same name and listener
    /// is equivalent to calling it once.
    pub fn set_listener(&self, name: impl Into<String>, listener: Arc<dyn Listener>) {
        self.listeners.lock().unwrap().insert(name.into(), listener);
    }

    pub fn remove_listener(&self, name: &str) {
        self.listeners.lock().unwrap().shift_remove(name);
    }

    pub fn get_listener(&self, name: &str) -> Option<Arc<dyn Listener>> {
        self.listeners.lock().unwrap().get(name).cloned()
    }

    fn snapshot(&self) -> Vec<(String, Arc<dyn Listener>)> {
        self.listeners
            .lock()
            .unwrap()
            .iter()
            .map(|(name, listener)| (name.clone(), listener.clone()))
            .collect()
    }

    /// Dispatches `frame` to every registered listener, in insertion
    /// order. A listener whose callback panics is caught and reported as
    /// an `ERROR` dispatch (to the other listeners only — the panicking
    /// listener is not re-invoked for this frame); other listeners are
    /// still notified.
    pub fn dispatch(&self, frame: &Frame, host_and_port: Option<&HostAndPort>) {
        self.dispatch_excluding(frame, host_and_port, &[])
    }

    /// Like [`dispatch`], but skips listeners named in `excluded` — used
    /// to keep a listener whose `on_before_message` just panicked from
    /// also receiving the following `MESSAGE` dispatch.
    ///
    /// [`dispatch`]: Publisher::dispatch
    pub(crate) fn dispatch_excluding(
        &self,
        frame: &Frame,
        host_and_port: Option<&HostAndPort>,
        excluded: &[String],
    ) {
        for (name, listener) in self.snapshot() {
            if excluded.iter().any(|skip| skip == &name) {
                continue;
            }
            let result = catch_unwind(AssertUnwindSafe(|| listener.notify(frame, host_and_port)));
            if let Err(panic) = result {
                let message = panic_message(&panic);
                warn!(listener = %name, error = %message, "listener callback panicked");
                self.dispatch_error_excluding(&name, &message, host_and_port);
            }
        }
    }

    /// Synthesizes and dispatches `BEFORE_MESSAGE` for `frame` (a `MESSAGE`
    /// frame), letting each listener mutate `frame`'s headers/body in
    /// turn before the real `MESSAGE` dispatch. Returns the names of any
    /// listeners whose `on_before_message` panicked — that
    /// listener is reported as `ERROR` and skipped for the subsequent
    /// `MESSAGE` dispatch, while the others still receive both events.
    pub(crate) fn dispatch_before_message(&self, frame: &mut Frame) -> Vec<String> {
        let mut failed = Vec::new();
        for (name, listener) in self.snapshot() {
            let result = catch_unwind(AssertUnwindSafe(|| listener.on_before_message(frame)));
            if let Err(panic) = result {
                let message = panic_message(&panic);
                warn!(listener = %name, error = %message, "on_before_message panicked");
                self.dispatch_error_excluding(&name, &message, None);
                failed.push(name);
            }
        }
        failed
    }

    /// Fans a just-transmitted `frame` out to every listener's `on_send`,
    /// catching and reporting a panic the same way [`dispatch`] does,
    /// rather than letting it abort the fan-out or propagate to the
    /// caller of `transmit`.
    ///
    /// [`dispatch`]: Publisher::dispatch
    pub(crate) fn dispatch_send(&self, frame: &Frame) {
        for (name, listener) in self.snapshot() {
            let result = catch_unwind(AssertUnwindSafe(|| listener.on_send(frame)));
            if let Err(panic) = result {
                let message = panic_message(&panic);
                warn!(listener = %name, error = %message, "on_send panicked");
                self.dispatch_error_excluding(&name, &message, None);
            }
        }
    }

    /// Like [`dispatch`] for an `ERROR` frame synthesized internally, but
    /// skips `exclude` (the listener whose own callback just panicked).
    ///
    /// [`dispatch`]: Publisher::dispatch
    fn dispatch_error_excluding(&self, exclude: &str, message: &str, host_and_port: Option<&HostAndPort>) {
        let mut headers = crate::frame::Headers::new();
        headers.insert("message".into(), message.to_string());
        let error_frame = Frame::new(CMD_ERROR, headers, Vec::new());
        for (name, listener) in self.snapshot() {
            if name == exclude {
                continue;
            }
            let _ = catch_unwind(AssertUnwindSafe(|| listener.notify(&error_frame, host_and_port)));
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "listener panicked with a non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingListener {
        messages: AtomicUsize,
    }

    impl Listener for CountingListener {
        fn on_message(&self, _frame: &Frame) {
            self.messages.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn set_listener_twice_with_same_name_is_idempotent() {
        let publisher = Publisher::new();
        let listener: Arc<dyn Listener> =
            Arc::new(CountingListener { messages: AtomicUsize::new(0) });
        publisher.set_listener("x", listener.clone());
        publisher.set_listener("x", listener);
        assert_eq!(publisher.listeners.lock().unwrap().len(), 1);
    }

    #[test]
    fn dispatch_reaches_every_registered_listener_in_order() {
        let publisher = Publisher::new();
        let a = Arc::new(CountingListener { messages: AtomicUsize::new(0) });
        let b = Arc::new(CountingListener { messages: AtomicUsize::new(0) });
        publisher.set_listener("a", a.clone());
        publisher.set_listener("b", b.clone());
        let frame = Frame::pseudo(CMD_MESSAGE);
        publisher.dispatch(&frame, None);
        assert_eq!(a.messages.load(Ordering::SeqCst), 1);
        assert_eq!(b.messages.load(Ordering::SeqCst), 1);
    }

    struct PanickingListener;
    impl Listener for PanickingListener {
        fn on_message(&self, _frame: &Frame) {
            panic!("boom");
        }
    }

    #[test]
    fn panicking_listener_does_not_prevent_others_from_being_notified() {
        let publisher = Publisher::new();
        publisher.set_listener("panicker", Arc::new(PanickingListener));
        let survivor = Arc::new(CountingListener { messages: AtomicUsize::new(0) });
        publisher.set_listener("survivor", survivor.clone());
        let frame = Frame::pseudo(CMD_MESSAGE);
        publisher.dispatch(&frame, None);
        assert_eq!(survivor.messages.load(Ordering::SeqCst), 1);
    }

    struct SendCountingListener {
        sends: AtomicUsize,
    }

    impl Listener for SendCountingListener {
        fn on_send(&self, _frame: &Frame) {
            self.sends.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct PanickingOnSendListener;
    impl Listener for PanickingOnSendListener {
        fn on_send(&self, _frame: &Frame) {
            panic!("boom");
        }
    }

    #[test]
    fn panicking_on_send_listener_does_not_prevent_others_from_being_notified() {
        let publisher = Publisher::new();
        publisher.set_listener("panicker", Arc::new(PanickingOnSendListener));
        let survivor = Arc::new(SendCountingListener { sends: AtomicUsize::new(0) });
        publisher.set_listener("survivor", survivor.clone());
        let frame = Frame::pseudo(CMD_SEND);
        publisher.dispatch_send(&frame);
        assert_eq!(survivor.sends.load(Ordering::SeqCst), 1);
    }
}
