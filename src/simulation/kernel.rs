//! The simulation kernel.
//!
//! Exactly one thread (the kernel thread) executes events and advances the
//! simulated clock; that is the invariant that makes runs deterministic and
//! replayable for a fixed seed and insertion order. Every other thread is a
//! producer only: it submits `Command`s into an unbounded channel the kernel
//! drains with priority over event execution, which gives outside callers a
//! "between any two events" injection point, never a "during" one.
//!
//! Pacing, mote lifecycle, the radio medium orchestration and control-script
//! stepping all live here because they all need `&mut Simulation`.

use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use crossbeam_channel::{Receiver, Sender, TryRecvError, unbounded};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::bridge::{BridgeError, CommunicatorFactory};
use crate::config::{
    MediumSnapshot, MoteSnapshot, MoteTypeSnapshot, SeedSetting, SimulationProfile,
    SimulationSnapshot,
};
use crate::mote::{ApplicationMote, FirmwareMoteType, Mote, MoteAction, MoteBackend};
use crate::radio::medium::{ActiveConnection, PropagationPolicy, RadioMedium};
use crate::radio::{RadioEvent, RadioPacket, SS_NOTHING, SS_STRONG, channels_compatible};
use crate::script::{ScriptBody, ScriptConfig, ScriptEngine, ScriptOutcome};

use super::event_queue::{EventQueue, EventRef, TimeEvent};
use super::{MILLISECOND, MoteId, SimTime};

/// A request executed on the kernel thread on the submitter's behalf.
pub enum Command {
    Start,
    Stop { result: Option<i32> },
    Shutdown,
    Invoke(Box<dyn FnOnce(&mut Simulation) + Send>),
}

#[derive(Default)]
struct SharedState {
    running: AtomicBool,
    shutdown: AtomicBool,
    sim_time: AtomicU64,
}

/// Cloneable cross-thread handle to a simulation. Submits commands and
/// mirrors a few atomics; all real state stays with the kernel thread.
#[derive(Clone)]
pub struct SimControl {
    commands: Sender<Command>,
    shared: Arc<SharedState>,
}

impl SimControl {
    pub fn start(&self) {
        let _ = self.commands.send(Command::Start);
    }

    pub fn stop(&self) {
        let _ = self.commands.send(Command::Stop { result: None });
    }

    pub fn stop_with_result(&self, result: i32) {
        let _ = self.commands.send(Command::Stop {
            result: Some(result),
        });
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    /// Run `action` on the kernel thread, between two events.
    pub fn invoke(&self, action: impl FnOnce(&mut Simulation) + Send + 'static) {
        let _ = self.commands.send(Command::Invoke(Box::new(action)));
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    pub fn sim_time(&self) -> SimTime {
        self.shared.sim_time.load(Ordering::Acquire)
    }
}

/// A spawned kernel thread plus the control handle to reach it.
pub struct KernelHandle {
    control: SimControl,
    thread: thread::JoinHandle<i32>,
}

impl KernelHandle {
    pub fn control(&self) -> SimControl {
        self.control.clone()
    }

    /// Wait for the kernel thread to terminate and return its exit code.
    pub fn join(self) -> i32 {
        self.thread.join().unwrap_or_else(|_| {
            log::error!("kernel thread panicked");
            1
        })
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum KernelState {
    Idle,
    Running,
    Shutdown,
}

pub struct Simulation {
    title: String,
    state: KernelState,
    clock: SimTime,
    queue: EventQueue,
    commands: Receiver<Command>,
    command_tx: Sender<Command>,
    shared: Arc<SharedState>,
    /// Interactive runs pause on event failure; non-interactive runs treat
    /// it as fatal.
    interactive: bool,
    random: StdRng,
    seed: u64,
    seed_generated: bool,
    startup_delay_max: SimTime,
    speed_limit: Option<f64>,
    pace_event: EventRef,
    pace_real_base: Instant,
    pace_sim_base: SimTime,
    run_real_base: Instant,
    run_sim_base: SimTime,
    motes: Vec<Mote>,
    next_mote_id: u32,
    mote_types: Vec<FirmwareMoteType>,
    medium: RadioMedium,
    communicators: CommunicatorFactory,
    scripts: Vec<ScriptEngine>,
    next_script_id: usize,
    return_value: Option<i32>,
}

impl Simulation {
    pub fn new(profile: SimulationProfile, policy: Box<dyn PropagationPolicy>) -> Self {
        let (command_tx, commands) = unbounded();
        let seed_generated = profile.seed.is_none();
        let seed = profile.seed.unwrap_or_else(rand::random);
        let now = Instant::now();
        log::info!(
            "simulation '{}' created, seed {} ({})",
            profile.title,
            seed,
            if seed_generated {
                "generated"
            } else {
                "explicit"
            }
        );
        Simulation {
            title: profile.title,
            state: KernelState::Idle,
            clock: 0,
            queue: EventQueue::new(),
            commands,
            command_tx,
            shared: Arc::new(SharedState::default()),
            interactive: !profile.quick_setup,
            random: StdRng::seed_from_u64(seed),
            seed,
            seed_generated,
            startup_delay_max: profile.mote_startup_delay_us,
            speed_limit: profile.speed_limit,
            pace_event: TimeEvent::new(
                "pace",
                Box::new(|sim: &mut Simulation, now: SimTime| {
                    sim.pace_tick(now);
                    Ok(())
                }),
            ),
            pace_real_base: now,
            pace_sim_base: 0,
            run_real_base: now,
            run_sim_base: 0,
            motes: Vec::new(),
            next_mote_id: 0,
            mote_types: Vec::new(),
            medium: RadioMedium::new(policy),
            communicators: CommunicatorFactory::new(profile.compiler, profile.extra_cflags),
            scripts: Vec::new(),
            next_script_id: 0,
            return_value: None,
        }
    }

    /// Spawn the kernel on its own thread. `setup` runs there before the
    /// command loop starts; a setup failure terminates the thread with exit
    /// code 1.
    pub fn spawn(
        profile: SimulationProfile,
        policy: Box<dyn PropagationPolicy>,
        setup: impl FnOnce(&mut Simulation) -> anyhow::Result<()> + Send + 'static,
    ) -> anyhow::Result<KernelHandle> {
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let thread = thread::Builder::new()
            .name("sim-kernel".into())
            .spawn(move || {
                let mut sim = Simulation::new(profile, policy);
                let _ = ready_tx.send(sim.control());
                if let Err(error) = setup(&mut sim) {
                    log::error!("simulation setup failed: {error:#}");
                    return 1;
                }
                sim.run()
            })
            .context("spawning kernel thread")?;
        let control = ready_rx
            .recv()
            .context("kernel thread exited during startup")?;
        Ok(KernelHandle { control, thread })
    }

    pub fn control(&self) -> SimControl {
        SimControl {
            commands: self.command_tx.clone(),
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn time(&self) -> SimTime {
        self.clock
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn is_running(&self) -> bool {
        self.state == KernelState::Running
    }

    pub fn return_value(&self) -> Option<i32> {
        self.return_value
    }

    /// The kernel loop. Commands always take priority over event execution;
    /// an idle kernel blocks on the channel instead of spinning.
    pub fn run(&mut self) -> i32 {
        log::info!("kernel loop started");
        while self.state != KernelState::Shutdown {
            loop {
                match self.commands.try_recv() {
                    Ok(command) => self.apply_command(command),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        self.begin_shutdown();
                        break;
                    }
                }
                if self.state == KernelState::Shutdown {
                    break;
                }
            }
            match self.state {
                KernelState::Shutdown => break,
                KernelState::Idle => match self.commands.recv() {
                    Ok(command) => self.apply_command(command),
                    Err(_) => self.begin_shutdown(),
                },
                KernelState::Running => self.execute_next_event(),
            }
        }
        log::info!("kernel loop terminated");
        self.return_value.unwrap_or(0)
    }

    fn apply_command(&mut self, command: Command) {
        match command {
            Command::Start => self.start_run(),
            Command::Stop { result } => self.stop_run(result),
            Command::Shutdown => self.begin_shutdown(),
            Command::Invoke(action) => action(self),
        }
    }

    fn start_run(&mut self) {
        if self.state != KernelState::Idle {
            return;
        }
        self.state = KernelState::Running;
        self.shared.running.store(true, Ordering::Release);
        self.run_real_base = Instant::now();
        self.run_sim_base = self.clock;
        self.pace_real_base = self.run_real_base;
        self.pace_sim_base = self.clock;
        if self.speed_limit.is_some() && !self.pace_event.is_scheduled() {
            let pace = Rc::clone(&self.pace_event);
            self.schedule_event(&pace, self.clock);
        }
        log::info!("simulation started at {} us", self.clock);
    }

    fn stop_run(&mut self, result: Option<i32>) {
        if let Some(code) = result {
            self.return_value = Some(code);
        }
        if self.state != KernelState::Running {
            return;
        }
        self.state = KernelState::Idle;
        self.shared.running.store(false, Ordering::Release);
        let real_ms = self.run_real_base.elapsed().as_millis().max(1) as u64;
        let sim_ms = (self.clock - self.run_sim_base) / MILLISECOND;
        log::info!(
            "runtime: {} ms, simulated: {} ms, speedup: {:.3}",
            real_ms,
            sim_ms,
            sim_ms as f64 / real_ms as f64
        );
    }

    /// Terminal. Drains the command channel, deactivates scripts, detaches
    /// the propagation policy and destroys motes in reverse creation order.
    fn begin_shutdown(&mut self) {
        if self.state == KernelState::Shutdown {
            return;
        }
        log::info!("shutting down simulation '{}'", self.title);
        self.state = KernelState::Shutdown;
        self.shared.running.store(false, Ordering::Release);
        self.shared.shutdown.store(true, Ordering::Release);
        while self.commands.try_recv().is_ok() {}
        let now = self.clock;
        for mut engine in std::mem::take(&mut self.scripts) {
            engine.deactivate(now);
        }
        self.medium.detach_policy();
        while let Some(mote) = self.motes.pop() {
            let id = mote.id();
            self.queue.remove_if(|event| event.mote() == Some(id));
            self.medium.unregister(id);
            log::debug!("destroyed mote {}", id);
        }
    }

    fn execute_next_event(&mut self) {
        let Some((event, time)) = self.queue.pop_next() else {
            log::warn!("event queue exhausted, stopping simulation");
            self.stop_run(None);
            return;
        };
        assert!(
            time >= self.clock,
            "event '{}' from the past: {} < {}",
            event.name(),
            time,
            self.clock
        );
        self.clock = time;
        self.shared.sim_time.store(time, Ordering::Release);
        if let Err(error) = event.execute(self, time) {
            if self.interactive {
                log::error!(
                    "event '{}' failed at {} us: {error:#}; simulation paused",
                    event.name(),
                    time
                );
                self.stop_run(None);
            } else {
                log::error!("event '{}' failed at {} us: {error:#}", event.name(), time);
                self.return_value = Some(1);
                self.begin_shutdown();
            }
        }
    }

    /// Insert `event` into the queue. Double-scheduling or scheduling into
    /// the past indicates a bug in the producer and is fatal.
    pub fn schedule_event(&mut self, event: &EventRef, time: SimTime) {
        if time < self.clock {
            panic!(
                "event '{}' scheduled in the past ({} < {})",
                event.name(),
                time,
                self.clock
            );
        }
        if let Err(error) = self.queue.schedule(event, time) {
            panic!("scheduling invariant broken: {error}");
        }
    }

    /// Self-rescheduling speed limiter. Runs every simulated millisecond
    /// while on schedule; when behind it reschedules itself further out to
    /// cut overhead, and it rebases its counters every real second.
    fn pace_tick(&mut self, now: SimTime) {
        let Some(limit) = self.speed_limit else {
            return;
        };
        let sim_ms = (now - self.pace_sim_base) / MILLISECOND;
        let real_ms = self.pace_real_base.elapsed().as_millis() as i64;
        let expected_ms = (sim_ms as f64 / limit) as i64;
        let surplus = expected_ms - real_ms;
        let next = if surplus >= 0 {
            if surplus > 0 {
                thread::sleep(Duration::from_millis(surplus as u64));
            }
            now + MILLISECOND
        } else {
            now + (-surplus as u64).max(1) * MILLISECOND
        };
        if self.pace_real_base.elapsed().as_millis() > 1_000 {
            self.pace_real_base = Instant::now();
            self.pace_sim_base = now;
        }
        let pace = Rc::clone(&self.pace_event);
        self.schedule_event(&pace, next);
    }

    // ----- motes -------------------------------------------------------

    pub fn add_application_mote(&mut self, type_name: &str) -> MoteId {
        self.add_mote(type_name, MoteBackend::Application(ApplicationMote::new()))
    }

    /// Compile, load and register a firmware mote type. Errors carry the
    /// toolchain diagnostics and leave the kernel intact.
    pub fn create_firmware_mote_type(
        &mut self,
        name: &str,
        firmware: &Path,
    ) -> Result<(), BridgeError> {
        let mote_type = FirmwareMoteType::create(&mut self.communicators, name, firmware)?;
        self.mote_types.push(mote_type);
        Ok(())
    }

    pub fn add_firmware_mote(&mut self, type_name: &str) -> anyhow::Result<MoteId> {
        let instance = self
            .mote_types
            .iter()
            .find(|t| t.name() == type_name)
            .map(|t| t.instantiate())
            .ok_or_else(|| anyhow::anyhow!("unknown mote type '{type_name}'"))?;
        Ok(self.add_mote(type_name, MoteBackend::Firmware(instance)))
    }

    fn add_mote(&mut self, type_name: &str, backend: MoteBackend) -> MoteId {
        let id = MoteId(self.next_mote_id);
        self.next_mote_id += 1;
        let tick_event = TimeEvent::for_mote(
            "mote-tick",
            id,
            Box::new(move |sim: &mut Simulation, now: SimTime| sim.tick_mote(id, now)),
        );
        self.medium.register(id);
        self.motes.push(Mote::new(id, type_name, backend, tick_event));

        // Boot-time clock drift, drawn from the seeded generator so runs
        // stay reproducible.
        let delay = if self.startup_delay_max > 0 {
            self.random.gen_range(0..=self.startup_delay_max)
        } else {
            0
        };
        let tick = Rc::clone(self.motes[self.motes.len() - 1].tick_event());
        self.schedule_event(&tick, self.clock + delay);
        log::info!("mote {} ({}) added, first tick in {} us", id, type_name, delay);
        id
    }

    pub fn remove_mote(&mut self, id: MoteId) {
        let Some(index) = self.mote_index(id) else {
            return;
        };
        self.motes.remove(index);
        self.queue.remove_if(|event| event.mote() == Some(id));
        self.medium.unregister(id);
        log::info!("mote {} removed", id);
    }

    pub fn mote_count(&self) -> usize {
        self.motes.len()
    }

    /// Queue a transmission on an application mote. The mote wakes at `at`
    /// (or after its boot delay, whichever is later) and puts the payload in
    /// the air.
    pub fn plan_transmission(
        &mut self,
        mote: MoteId,
        at: SimTime,
        payload: Vec<u8>,
        duration: SimTime,
    ) -> anyhow::Result<()> {
        let Some(index) = self.mote_index(mote) else {
            anyhow::bail!("unknown mote {mote}");
        };
        match self.motes[index].backend_mut() {
            MoteBackend::Application(app) => app.plan_transmission(at, payload, duration),
            MoteBackend::Firmware(_) => {
                anyhow::bail!("mote {mote} is firmware-backed, cannot plan transmissions")
            }
        }
        let tick = Rc::clone(self.motes[index].tick_event());
        if !tick.is_scheduled() {
            self.schedule_event(&tick, at.max(self.clock));
        }
        Ok(())
    }

    fn mote_index(&self, id: MoteId) -> Option<usize> {
        self.motes.iter().position(|m| m.id() == id)
    }

    /// Memory capability of a mote, for backends that have one. Application
    /// motes have no backing memory.
    pub fn mote_memory(&mut self, id: MoteId) -> Option<&mut dyn crate::mote::MemoryAddressable> {
        let index = self.mote_index(id)?;
        self.motes[index].memory()
    }

    pub(crate) fn tick_mote(&mut self, id: MoteId, now: SimTime) -> anyhow::Result<()> {
        let Some(index) = self.mote_index(id) else {
            return Ok(());
        };
        self.motes[index].radio.sample_signal();
        let actions = self.motes[index]
            .tick(now)
            .with_context(|| format!("ticking mote {id}"))?;
        self.apply_mote_actions(id, actions);
        Ok(())
    }

    fn apply_mote_actions(&mut self, id: MoteId, actions: Vec<MoteAction>) {
        for action in actions {
            match action {
                MoteAction::Transmit { payload, duration } => {
                    self.start_transmission(id, payload, duration);
                }
                MoteAction::Log(message) => self.deliver_log_output(id, message),
                MoteAction::NextTick { at } => {
                    if let Some(index) = self.mote_index(id) {
                        let tick = Rc::clone(self.motes[index].tick_event());
                        if !tick.is_scheduled() {
                            self.schedule_event(&tick, at.max(self.clock));
                        }
                    }
                }
            }
        }
    }

    // ----- radio medium orchestration ----------------------------------

    /// Put a packet in the air: flip the source radio, ask the policy who
    /// hears it, start receptions and schedule the transmission end.
    pub(crate) fn start_transmission(
        &mut self,
        source: MoteId,
        payload: Vec<u8>,
        duration: SimTime,
    ) {
        let now = self.clock;
        let packet = RadioPacket::new(payload);
        let source_channel;
        let was_receiving;
        {
            let Some(index) = self.mote_index(source) else {
                return;
            };
            let radio = &mut self.motes[index].radio;
            was_receiving = radio.is_receiving();
            if !radio.begin_transmission(packet.clone(), now) {
                return;
            }
            source_channel = radio.channel();
        }
        if was_receiving {
            // Transmitting over an ongoing reception destroys it.
            if let Some(index) = self.mote_index(source) {
                self.motes[index].radio.interfere(now);
            }
            for connection in self.medium.active_mut() {
                if connection.is_destination(source) {
                    connection.mark_interfered(source);
                }
            }
        }

        let candidates = self.medium.candidates(source);
        let outcome = self.medium.select(source, &candidates);
        let mut connection = ActiveConnection::new(source, packet.clone(), now);
        for destination in outcome.destinations {
            let Some(index) = self.mote_index(destination) else {
                continue;
            };
            let radio = &mut self.motes[index].radio;
            if !channels_compatible(source_channel, radio.channel()) {
                continue;
            }
            match radio.begin_reception(packet.clone(), now) {
                Some(RadioEvent::ReceptionStarted) => connection.destinations.push(destination),
                _ => connection.mark_interfered(destination),
            }
        }
        for disturbed in outcome.interfered {
            if let Some(index) = self.mote_index(disturbed) {
                self.motes[index].radio.interfere(now);
                connection.mark_interfered(disturbed);
            }
        }
        log::debug!(
            "mote {} transmitting {} bytes for {} us to {} destination(s)",
            source,
            connection.packet.len(),
            duration,
            connection.destinations.len()
        );
        self.medium.push_connection(connection);
        self.update_signal_strengths();

        let end = TimeEvent::for_mote(
            "transmission-end",
            source,
            Box::new(move |sim: &mut Simulation, now: SimTime| {
                sim.finish_transmission(source, now);
                Ok(())
            }),
        );
        self.schedule_event(&end, now + duration);
    }

    pub(crate) fn finish_transmission(&mut self, source: MoteId, now: SimTime) {
        if let Some(index) = self.mote_index(source) {
            self.motes[index].radio.end_transmission(now);
        }
        let Some(connection) = self.medium.take_connection(source) else {
            return;
        };
        self.medium.stats_mut().transmissions += 1;
        self.medium.stats_mut().interfered += connection.interfered.len() as u64;

        let mut deliveries = Vec::new();
        for destination in &connection.destinations {
            let Some(index) = self.mote_index(*destination) else {
                continue;
            };
            let (_event, delivered) = self.motes[index].radio.end_reception(now);
            if let Some(packet) = delivered {
                self.medium.stats_mut().receptions += 1;
                deliveries.push((*destination, packet.payload));
            }
        }
        // Interfered bystanders release their interferer too.
        for disturbed in &connection.interfered {
            if connection.destinations.contains(disturbed) {
                continue;
            }
            if let Some(index) = self.mote_index(*disturbed) {
                if self.motes[index].radio.is_interfered() {
                    self.motes[index].radio.end_reception(now);
                }
            }
        }
        self.update_signal_strengths();

        for (destination, payload) in deliveries {
            if let Some(index) = self.mote_index(destination) {
                let actions = self.motes[index].on_packet_received(&payload);
                self.apply_mote_actions(destination, actions);
            }
        }
    }

    /// Recompute raw signal strengths from the set of active connections:
    /// base level everywhere, strong at participants, and interfered radios
    /// that lost their flag are re-interfered while a disturbing connection
    /// is still in the air.
    fn update_signal_strengths(&mut self) {
        let now = self.clock;
        for mote in &mut self.motes {
            mote.radio.set_current_signal(SS_NOTHING);
        }
        let mut strong = Vec::new();
        let mut disturbed = Vec::new();
        for connection in self.medium.active() {
            strong.push(connection.source);
            strong.extend(connection.destinations.iter().copied());
            disturbed.extend(connection.interfered.iter().copied());
        }
        for id in strong {
            if let Some(index) = self.mote_index(id) {
                let radio = &mut self.motes[index].radio;
                if radio.current_signal() < SS_STRONG {
                    radio.set_current_signal(SS_STRONG);
                }
            }
        }
        for id in disturbed {
            if let Some(index) = self.mote_index(id) {
                let radio = &mut self.motes[index].radio;
                if radio.current_signal() < SS_STRONG {
                    radio.set_current_signal(SS_STRONG);
                }
                if !radio.is_interfered() {
                    radio.interfere(now);
                }
            }
        }
    }

    // ----- control scripts ---------------------------------------------

    /// Activate a control script. The script thread runs until its first
    /// wait point before this returns.
    pub fn add_script(&mut self, config: ScriptConfig, body: ScriptBody) -> anyhow::Result<()> {
        let id = self.next_script_id;
        self.next_script_id += 1;
        let engine = ScriptEngine::activate(id, body, config, self.control(), self.seed, self.clock)?;
        let timeout = Rc::clone(engine.timeout_event());
        self.schedule_event(&timeout, self.clock + engine.timeout());
        let progress = Rc::clone(engine.progress_event());
        self.schedule_event(&progress, self.clock + engine.progress_interval());
        log::info!("script {} activated, timeout {} us", id, engine.timeout());
        self.scripts.push(engine);
        Ok(())
    }

    /// A mote printed a line: step every active script over it. Scripts
    /// returning a result stop the run (and, non-interactively, shut the
    /// kernel down).
    pub(crate) fn deliver_log_output(&mut self, mote: MoteId, message: String) {
        log::debug!("mote {} output: {}", mote, message);
        let time = self.clock;
        let mut engines = std::mem::take(&mut self.scripts);
        let mut finished = Vec::new();
        for mut engine in engines.drain(..) {
            match engine.on_mote_output(mote, time, &message) {
                ScriptOutcome::Continue => self.scripts.push(engine),
                ScriptOutcome::Finished(code) => {
                    log::info!("script {} finished with result {}", engine.id(), code);
                    engine.deactivate(time);
                    finished.push(code);
                }
            }
        }
        for code in finished {
            self.stop_run(Some(code));
            if !self.interactive {
                self.begin_shutdown();
            }
        }
    }

    pub(crate) fn script_timeout(&mut self, id: usize, now: SimTime) {
        let Some(index) = self.scripts.iter().position(|e| e.id() == id) else {
            return;
        };
        log::error!("script {} timed out at {} us", id, now);
        let mut engine = self.scripts.remove(index);
        let code = engine.trigger_timeout();
        engine.deactivate(now);
        self.stop_run(Some(code));
        if !self.interactive {
            self.begin_shutdown();
        }
    }

    pub(crate) fn script_progress(&mut self, id: usize, now: SimTime) {
        let Some(index) = self.scripts.iter().position(|e| e.id() == id) else {
            return;
        };
        self.scripts[index].log_progress(now);
        let next = now + self.scripts[index].progress_interval();
        let progress = Rc::clone(self.scripts[index].progress_event());
        self.schedule_event(&progress, next);
    }

    // ----- persistence -------------------------------------------------

    /// Serializable view for the external persistence collaborator.
    pub fn snapshot(&self) -> SimulationSnapshot {
        SimulationSnapshot {
            title: self.title.clone(),
            speed_limit: self.speed_limit,
            seed: if self.seed_generated {
                SeedSetting::Generated { value: self.seed }
            } else {
                SeedSetting::Explicit { value: self.seed }
            },
            mote_startup_delay_us: self.startup_delay_max,
            radio_medium: MediumSnapshot {
                name: self.medium.policy_name().to_string(),
                config: self.medium.policy_config(),
                stats: self.medium.stats().clone(),
            },
            mote_types: self
                .mote_types
                .iter()
                .map(|t| MoteTypeSnapshot {
                    name: t.name().to_string(),
                    slot: t.slot().index(),
                })
                .collect(),
            motes: self
                .motes
                .iter()
                .map(|m| MoteSnapshot {
                    id: m.id().0,
                    mote_type: m.type_name().to_string(),
                    channel: m.radio.channel(),
                })
                .collect(),
        }
    }
}
