//! Control scripts: sequential test procedures stepped by the kernel.
//!
//! A script body runs on its own thread but never concurrently with the
//! kernel: every interaction goes through the rendezvous in `handshake`.
//! The kernel steps the script on each relevant mote log event; the script
//! observes the event, optionally injects commands, and yields. A timeout
//! and a periodic progress report are scheduled in simulated time at
//! activation and cancelled at deactivation.

pub mod handshake;

pub use handshake::{Handshake, Turn};

use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use anyhow::Context as _;

use crate::simulation::kernel::SimControl;
use crate::simulation::{EventRef, MILLISECOND, MoteId, SECOND, SimTime, TimeEvent};

/// Default script timeout: 20 simulated minutes.
pub const DEFAULT_TIMEOUT: SimTime = 20 * 60 * SECOND;

/// A control procedure. Receives its API surface and returns an exit code;
/// zero means the run passed.
pub type ScriptBody = Box<dyn FnOnce(ScriptContext) -> i32 + Send + 'static>;

pub struct ScriptConfig {
    /// Simulated-time timeout; `None` uses `DEFAULT_TIMEOUT`.
    pub timeout: Option<SimTime>,
    /// Plain-text test log written alongside the run (seed header, script
    /// output, end-of-test time).
    pub test_log: Option<PathBuf>,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        ScriptConfig {
            timeout: None,
            test_log: None,
        }
    }
}

/// What the kernel learned from stepping the script.
pub enum ScriptOutcome {
    Continue,
    Finished(i32),
}

/// One observed mote output event.
#[derive(Clone, Debug)]
pub struct ScriptEvent {
    pub time: SimTime,
    pub mote: MoteId,
    pub message: String,
}

struct ScriptShared {
    observed: Mutex<Option<ScriptEvent>>,
    timeout: AtomicBool,
    shutdown: AtomicBool,
    log_sink: Mutex<Option<File>>,
}

/// API surface handed to the script body.
pub struct ScriptContext {
    handshake: Arc<Handshake>,
    shared: Arc<ScriptShared>,
    control: SimControl,
}

impl ScriptContext {
    /// Yield to the kernel and block until the next relevant mote output
    /// (or timeout step). Returns `None` once the handshake is torn down or
    /// when stepped before any output was observed.
    pub fn wait_for_output(&self) -> Option<ScriptEvent> {
        if !self.handshake.script_wait() {
            return None;
        }
        self.shared
            .observed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Current simulated time in microseconds.
    pub fn time(&self) -> SimTime {
        self.control.sim_time()
    }

    /// The last observed output event, if any.
    pub fn last_event(&self) -> Option<ScriptEvent> {
        self.shared
            .observed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn timed_out(&self) -> bool {
        self.shared.timeout.load(Ordering::Acquire)
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    /// Log a line from the script, mirrored into the test log if one is
    /// configured.
    pub fn log(&self, message: &str) {
        log::info!(target: "motesim::script", "{message}");
        let mut sink = self
            .shared
            .log_sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(file) = sink.as_mut() {
            let _ = writeln!(file, "{message}");
        }
    }

    pub fn write_file(&self, path: &Path, content: &str) -> anyhow::Result<()> {
        std::fs::write(path, content)
            .with_context(|| format!("writing script file {}", path.display()))
    }

    pub fn append_file(&self, path: &Path, line: &str) -> anyhow::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening script file {}", path.display()))?;
        writeln!(file, "{line}").with_context(|| format!("appending to {}", path.display()))
    }

    /// Schedule a synthetic output event on the last observed mote after
    /// `delay_ms` simulated milliseconds.
    pub fn generate_message(&self, delay_ms: u64, message: &str) {
        let Some(event) = self.last_event() else {
            log::warn!("generate_message with no observed mote, ignored");
            return;
        };
        let mote = event.mote;
        let message = message.to_string();
        self.control.invoke(move |sim| {
            let at = sim.time() + delay_ms * MILLISECOND;
            let synthetic = TimeEvent::for_mote(
                "synthetic-output",
                mote,
                Box::new(move |sim, _now| {
                    sim.deliver_log_output(mote, message.clone());
                    Ok(())
                }),
            );
            sim.schedule_event(&synthetic, at);
        });
    }
}

pub struct ScriptEngine {
    id: usize,
    handshake: Arc<Handshake>,
    shared: Arc<ScriptShared>,
    result: Arc<Mutex<Option<i32>>>,
    thread: Option<JoinHandle<()>>,
    timeout_event: EventRef,
    progress_event: EventRef,
    timeout: SimTime,
    activated_at: SimTime,
    real_start: Instant,
    deactivated: bool,
}

impl ScriptEngine {
    /// Spawn the script thread and block until the body parks at its first
    /// wait point (or returns outright).
    pub(crate) fn activate(
        id: usize,
        body: ScriptBody,
        config: ScriptConfig,
        control: SimControl,
        seed: u64,
        now: SimTime,
    ) -> anyhow::Result<ScriptEngine> {
        let log_sink = match &config.test_log {
            Some(path) => {
                let mut file = File::create(path)
                    .with_context(|| format!("creating test log {}", path.display()))?;
                writeln!(file, "Random seed: {seed}")
                    .with_context(|| format!("writing test log {}", path.display()))?;
                Some(file)
            }
            None => None,
        };

        let handshake = Handshake::new();
        let shared = Arc::new(ScriptShared {
            observed: Mutex::new(None),
            timeout: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            log_sink: Mutex::new(log_sink),
        });
        let result = Arc::new(Mutex::new(None));

        let context = ScriptContext {
            handshake: Arc::clone(&handshake),
            shared: Arc::clone(&shared),
            control,
        };
        let thread = {
            let handshake = Arc::clone(&handshake);
            let result = Arc::clone(&result);
            thread::Builder::new()
                .name(format!("script-{id}"))
                .spawn(move || {
                    let code = match catch_unwind(AssertUnwindSafe(move || body(context))) {
                        Ok(code) => code,
                        Err(_) => {
                            log::error!("script {id} panicked, treating as failure");
                            1
                        }
                    };
                    *result.lock().unwrap_or_else(PoisonError::into_inner) = Some(code);
                    handshake.finish();
                })
                .context("spawning script thread")?
        };
        handshake.wait_for_sim_turn();

        let timeout_event = TimeEvent::new(
            "script-timeout",
            Box::new(move |sim, now| {
                sim.script_timeout(id, now);
                Ok(())
            }),
        );
        let progress_event = TimeEvent::new(
            "script-progress",
            Box::new(move |sim, now| {
                sim.script_progress(id, now);
                Ok(())
            }),
        );

        Ok(ScriptEngine {
            id,
            handshake,
            shared,
            result,
            thread: Some(thread),
            timeout_event,
            progress_event,
            timeout: config.timeout.unwrap_or(DEFAULT_TIMEOUT),
            activated_at: now,
            real_start: Instant::now(),
            deactivated: false,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn timeout(&self) -> SimTime {
        self.timeout
    }

    /// Progress reports fire at a twentieth of the timeout, at least once
    /// per simulated second.
    pub fn progress_interval(&self) -> SimTime {
        (self.timeout / 20).max(SECOND)
    }

    pub(crate) fn timeout_event(&self) -> &EventRef {
        &self.timeout_event
    }

    pub(crate) fn progress_event(&self) -> &EventRef {
        &self.progress_event
    }

    /// Kernel thread: publish the event and give the script its turn.
    pub(crate) fn on_mote_output(
        &mut self,
        mote: MoteId,
        time: SimTime,
        message: &str,
    ) -> ScriptOutcome {
        if !self.handshake.is_active() {
            return ScriptOutcome::Continue;
        }
        *self
            .shared
            .observed
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(ScriptEvent {
            time,
            mote,
            message: message.to_string(),
        });
        self.handshake.step_from_sim();
        match self.take_result() {
            Some(code) => ScriptOutcome::Finished(code),
            None => ScriptOutcome::Continue,
        }
    }

    /// Kernel thread: raise the timeout flag and give the script one last
    /// turn to react. A body that never returns a result counts as failed.
    pub(crate) fn trigger_timeout(&mut self) -> i32 {
        self.shared.timeout.store(true, Ordering::Release);
        self.handshake.step_from_sim();
        self.take_result().unwrap_or(1)
    }

    pub(crate) fn log_progress(&self, now: SimTime) {
        let elapsed = now.saturating_sub(self.activated_at);
        let percent = elapsed * 100 / self.timeout.max(1);
        let wall = self.real_start.elapsed().as_secs_f64();
        // Wall-clock estimate only; the timeout itself is simulated time.
        let remaining = if elapsed > 0 {
            wall * self.timeout.saturating_sub(elapsed) as f64 / elapsed as f64
        } else {
            0.0
        };
        log::info!(
            "script {}: {}% of timeout elapsed, estimated {:.0} s wall clock remaining",
            self.id,
            percent,
            remaining
        );
    }

    fn take_result(&self) -> Option<i32> {
        self.result
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Tear the handshake down and reap the script thread. Idempotent and
    /// safe from either side; joining is skipped when called from the
    /// script's own thread, which would deadlock.
    pub(crate) fn deactivate(&mut self, now: SimTime) {
        if self.deactivated {
            return;
        }
        self.deactivated = true;
        self.timeout_event.cancel();
        self.progress_event.cancel();
        self.shared.shutdown.store(true, Ordering::Release);
        self.handshake.deactivate();
        if let Some(handle) = self.thread.take() {
            if thread::current().id() != handle.thread().id() {
                let _ = handle.join();
            }
        }
        let mut sink = self
            .shared
            .log_sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(file) = sink.as_mut() {
            let _ = writeln!(file, "Test ended at simulation time: {now}");
        }
        log::debug!("script {} deactivated", self.id);
    }
}

impl Drop for ScriptEngine {
    fn drop(&mut self) {
        // Never leave a parked script thread behind.
        if !self.deactivated {
            self.handshake.deactivate();
            if let Some(handle) = self.thread.take() {
                if thread::current().id() != handle.thread().id() {
                    let _ = handle.join();
                }
            }
        }
    }
}
