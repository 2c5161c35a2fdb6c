//! Background listener: one thread per channel that reads bytes and fans
//! them out through a [`CallbackRegistry`].
//!
//! Cancellation is cooperative. The listener checks for it before every
//! wait, so `stop` returns at most one channel poll interval (plus the time
//! needed to drain bytes that were already available) after it was called.
//! Nothing is dispatched once `stop` has returned.

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::channel::{ReadOutcome, SerialChannel};
use crate::error::{ChannelError, LifecycleError};
use crate::registry::CallbackRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    NotStarted,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for ListenerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NotStarted => "not started",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    Started,
    Stopped,
    /// The channel failed; the listener has stopped.
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub thread_name: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            thread_name: "serial-listener".to_string(),
        }
    }
}

struct Run {
    state: ListenerState,
    id: u64,
}

struct Shared {
    run: Mutex<Run>,
    state_changed: Condvar,
    cancel: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
    failure: Mutex<Option<ChannelError>>,
    events: Sender<ListenerEvent>,
}

impl Shared {
    fn state(&self) -> ListenerState {
        self.run.lock().state
    }

    fn set_stopped(&self) {
        self.run.lock().state = ListenerState::Stopped;
        self.state_changed.notify_all();
    }

    fn publish(&self, event: ListenerEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    /// Cancels run `run_id` and waits for its thread to finish.
    fn stop(&self, run_id: Option<u64>) -> Result<(), LifecycleError> {
        let mut run = self.run.lock();
        if run_id.is_some_and(|id| id != run.id) {
            return Ok(());
        }
        match run.state {
            ListenerState::NotStarted => {
                log::warn!("stop requested but the serial listener was never started");
                return Err(LifecycleError::NotRunning);
            }
            ListenerState::Running => {
                log::info!("stopping serial listener");
                run.state = ListenerState::Stopping;
                self.cancel.store(true, Ordering::Release);
                self.state_changed.notify_all();
            }
            ListenerState::Stopping | ListenerState::Stopped => {}
        }
        let this_run = run.id;
        drop(run);

        let worker = self.worker.lock().take();
        match worker {
            Some(worker) => {
                if worker.join().is_err() {
                    log::error!("serial listener thread panicked");
                    self.set_stopped();
                }
            }
            None => {
                // another caller is joining; wait for it to observe the exit.
                // A later start means this run is already over.
                let mut run = self.run.lock();
                while run.id == this_run && run.state != ListenerState::Stopped {
                    self.state_changed.wait(&mut run);
                }
            }
        }
        Ok(())
    }
}

/// Start/stop control for the background listener.
///
/// At most one listener thread runs per `Listener`. A stopped listener can be
/// started again, on the same or a different channel, and keeps dispatching
/// to the same registry.
pub struct Listener {
    registry: Arc<CallbackRegistry>,
    config: ListenerConfig,
    shared: Arc<Shared>,
    events: Receiver<ListenerEvent>,
}

impl Listener {
    pub fn new(registry: Arc<CallbackRegistry>) -> Self {
        Self::with_config(registry, ListenerConfig::default())
    }

    pub fn with_config(registry: Arc<CallbackRegistry>, config: ListenerConfig) -> Self {
        let (tx, rx) = unbounded();
        Self {
            registry,
            config,
            shared: Arc::new(Shared {
                run: Mutex::new(Run {
                    state: ListenerState::NotStarted,
                    id: 0,
                }),
                state_changed: Condvar::new(),
                cancel: AtomicBool::new(false),
                worker: Mutex::new(None),
                failure: Mutex::new(None),
                events: tx,
            }),
            events: rx,
        }
    }

    pub fn registry(&self) -> &Arc<CallbackRegistry> {
        &self.registry
    }

    pub fn state(&self) -> ListenerState {
        self.shared.state()
    }

    /// Lifecycle notifications. All receivers share one queue.
    pub fn events(&self) -> Receiver<ListenerEvent> {
        self.events.clone()
    }

    /// Launches the listener thread on `channel`.
    ///
    /// The state is `Running` by the time this returns.
    pub fn start(&self, channel: Arc<dyn SerialChannel>) -> Result<ListenerHandle, LifecycleError> {
        let mut run = self.shared.run.lock();
        match run.state {
            ListenerState::Running | ListenerState::Stopping => {
                return Err(LifecycleError::AlreadyRunning)
            }
            ListenerState::NotStarted | ListenerState::Stopped => {}
        }

        // reap the thread of a run that ended on its own
        if let Some(previous) = self.shared.worker.lock().take() {
            if previous.join().is_err() {
                log::error!("previous serial listener thread panicked");
            }
        }

        self.shared.cancel.store(false, Ordering::Release);
        self.shared.failure.lock().take();

        let shared = self.shared.clone();
        let registry = self.registry.clone();
        let worker = thread::Builder::new()
            .name(self.config.thread_name.clone())
            .spawn(move || run_listener(&shared, channel.as_ref(), &registry))
            .map_err(LifecycleError::Spawn)?;

        run.id += 1;
        run.state = ListenerState::Running;
        *self.shared.worker.lock() = Some(worker);
        let handle = ListenerHandle {
            shared: self.shared.clone(),
            run_id: run.id,
        };
        drop(run);

        self.shared.state_changed.notify_all();
        log::info!("serial listener started (run {})", handle.run_id);
        Ok(handle)
    }

    /// Cancels the current run and blocks until its thread has exited.
    ///
    /// Stopping an already stopped listener succeeds without doing anything;
    /// stopping one that was never started fails with
    /// [`LifecycleError::NotRunning`].
    pub fn stop(&self) -> Result<(), LifecycleError> {
        self.shared.stop(None)
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if matches!(
            self.state(),
            ListenerState::Running | ListenerState::Stopping
        ) {
            let _ = self.shared.stop(None);
        }
    }
}

/// Token for one run of a [`Listener`].
#[derive(Clone)]
pub struct ListenerHandle {
    shared: Arc<Shared>,
    run_id: u64,
}

impl ListenerHandle {
    /// State of this run. A run superseded by a later `start` reports
    /// `Stopped`.
    pub fn state(&self) -> ListenerState {
        let run = self.shared.run.lock();
        if run.id == self.run_id {
            run.state
        } else {
            ListenerState::Stopped
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == ListenerState::Running
    }

    /// Same as [`Listener::stop`], limited to this run.
    pub fn stop(&self) -> Result<(), LifecycleError> {
        self.shared.stop(Some(self.run_id))
    }

    /// Blocks until this run ends without requesting cancellation, then
    /// reports how it ended.
    pub fn wait(&self) -> Result<(), ChannelError> {
        {
            let mut run = self.shared.run.lock();
            while run.id == self.run_id && run.state != ListenerState::Stopped {
                self.shared.state_changed.wait(&mut run);
            }
        }
        match self.take_failure() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// The channel error that ended this run, if any. Returned once.
    pub fn take_failure(&self) -> Option<ChannelError> {
        if self.shared.run.lock().id != self.run_id {
            return None;
        }
        self.shared.failure.lock().take()
    }
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("run_id", &self.run_id)
            .field("state", &self.state())
            .finish()
    }
}

/// Marks the run stopped if the listener thread unwinds, so the listener
/// can be started again.
struct StopOnPanic<'a>(&'a Shared);

impl Drop for StopOnPanic<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.set_stopped();
            self.0
                .publish(ListenerEvent::Failed("listener thread panicked".to_string()));
        }
    }
}

fn run_listener(shared: &Shared, channel: &dyn SerialChannel, registry: &CallbackRegistry) {
    let _guard = StopOnPanic(shared);
    shared.publish(ListenerEvent::Started);

    let result = channel.prepare().and_then(|()| listen(shared, channel, registry));

    let event = match result {
        Ok(dispatched) => {
            log::info!("serial listener stopped after {dispatched} byte(s)");
            ListenerEvent::Stopped
        }
        Err(err) => {
            log::error!("serial listener failed: {err}");
            let event = ListenerEvent::Failed(err.to_string());
            *shared.failure.lock() = Some(err);
            event
        }
    };

    shared.set_stopped();
    shared.publish(event);
}

/// Reads until cancelled. Returns the number of bytes dispatched.
fn listen(
    shared: &Shared,
    channel: &dyn SerialChannel,
    registry: &CallbackRegistry,
) -> Result<u64, ChannelError> {
    let mut dispatched = 0u64;

    while !shared.cancel.load(Ordering::Acquire) {
        let mut outcome = channel.read_byte()?;

        // drain everything that is already available
        while let ReadOutcome::Byte { value, more } = outcome {
            registry.for_each(value);
            dispatched += 1;
            if !more {
                break;
            }
            outcome = channel.read_byte()?;
        }
    }

    Ok(dispatched)
}
