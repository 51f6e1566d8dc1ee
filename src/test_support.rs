//! Scripted transport for unit tests.
//!
//! Records every dispatched frame, lets the test decide whether dispatch
//! fails, and runs listener callbacks and scheduled jobs on the test thread.
//! It can also answer reply-required frames straight into a registry, for
//! tests that have no connection routing replies.

use crate::{
    // ---
    DeliveryJob,
    Failure,
    Frame,
    Inbound,
    Reply,
    RequestRegistry,
    Result,
    RpcError,
    Transport,
    TransportEvent,
    TransportListener,
};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use bytes::Bytes;
use std::time::{Duration, Instant};

const WAIT_LIMIT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct Script {
    frames: Vec<Frame>,
    attempts: usize,
    fail_dispatch: bool,
    jobs: Vec<DeliveryJob>,
    listener: Option<Weak<dyn TransportListener>>,
    answer: Option<(Weak<RequestRegistry>, Option<Failure>)>,
}

#[derive(Default)]
pub(crate) struct ScriptedTransport {
    script: Mutex<Script>,
    cv: Condvar,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap()
    }

    /// Frames accepted so far.
    pub(crate) fn frames(&self) -> Vec<Frame> {
        self.lock().frames.clone()
    }

    /// Block until frame `index` has been accepted and return it.
    pub(crate) fn wait_for_frame(&self, index: usize) -> Frame {
        // ---
        let deadline = Instant::now() + WAIT_LIMIT;
        let mut script = self.lock();
        while script.frames.len() <= index {
            let now = Instant::now();
            assert!(now < deadline, "frame {index} never dispatched");
            script = self.cv.wait_timeout(script, deadline - now).unwrap().0;
        }
        script.frames[index].clone()
    }

    /// Block until `count` dispatch calls were made, failed ones included.
    pub(crate) fn wait_for_attempts(&self, count: usize) {
        // ---
        let deadline = Instant::now() + WAIT_LIMIT;
        let mut script = self.lock();
        while script.attempts < count {
            let now = Instant::now();
            assert!(now < deadline, "only {} dispatch attempts", script.attempts);
            script = self.cv.wait_timeout(script, deadline - now).unwrap().0;
        }
    }

    /// Complete every reply-required frame on `registry` as soon as it is
    /// dispatched: with success, or with `failure` when one is given.
    pub(crate) fn answer_requests(&self, registry: &Arc<RequestRegistry>, failure: Option<Failure>) {
        self.lock().answer = Some((Arc::downgrade(registry), failure));
    }

    pub(crate) fn fail_dispatch(&self, fail: bool) {
        self.lock().fail_dispatch = fail;
    }

    pub(crate) fn has_listener(&self) -> bool {
        self.lock()
            .listener
            .as_ref()
            .is_some_and(|listener| listener.strong_count() > 0)
    }

    /// Run scheduled jobs on the calling thread.
    pub(crate) fn run_jobs(&self) {
        let jobs = std::mem::take(&mut self.lock().jobs);
        for job in jobs {
            job();
        }
    }

    fn emit(&self, event: TransportEvent) {
        let listener = self.lock().listener.as_ref().and_then(Weak::upgrade);
        if let Some(listener) = listener {
            event.notify(listener.as_ref());
        }
    }

    pub(crate) fn emit_inbound(&self, inbound: Inbound) {
        self.emit(TransportEvent::Delivered(inbound));
    }

    pub(crate) fn emit_lost(&self, reason: &str) {
        self.emit(TransportEvent::Lost(reason.to_string()));
    }

    pub(crate) fn emit_reconnected(&self) {
        self.emit(TransportEvent::Reconnected);
    }
}

impl Transport for ScriptedTransport {
    fn transport_id(&self) -> &str {
        "scripted"
    }

    fn attach(&self, listener: Weak<dyn TransportListener>) -> Result<()> {
        self.lock().listener = Some(listener);
        Ok(())
    }

    fn dispatch(&self, frame: Frame) -> Result<()> {
        // ---
        let mut script = self.lock();
        script.attempts += 1;
        if script.fail_dispatch {
            self.cv.notify_all();
            return Err(RpcError::Transport("scripted dispatch failure".into()));
        }

        let slot = frame.correlation;
        script.frames.push(frame);
        let answer = script.answer.clone();
        self.cv.notify_all();
        drop(script);

        // The registry arms the slot before dispatching, so completing here
        // on the caller's thread is safe.
        if let (Some(slot), Some((registry, failure))) = (slot, answer) {
            if let Some(registry) = registry.upgrade() {
                let reply = match failure {
                    Some(failure) => Reply::failure(slot, failure),
                    None => Reply::success(slot, Bytes::new()),
                };
                registry.complete(reply);
            }
        }
        Ok(())
    }

    fn schedule(&self, job: DeliveryJob) -> Result<()> {
        self.lock().jobs.push(job);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.lock().listener = None;
        Ok(())
    }
}
