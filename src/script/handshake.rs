//! Two-party hand-off between the kernel thread and a control script.
//!
//! The protocol is a strict ping-pong over an explicit turn marker: a tagged
//! `Turn` value guarded by one mutex and one condvar. At most one side holds
//! the turn, so at most one side executes logic at any moment; that makes
//! the mutual-exclusion invariant directly observable in tests instead of
//! being implicit in semaphore counts.
//!
//! The script starts holding the turn: its body runs its prologue right
//! after spawn and parks at the first wait point, while the kernel blocks in
//! `wait_for_sim_turn` until then. Deactivation force-releases both sides
//! and is idempotent.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Turn {
    Script,
    Sim,
}

struct State {
    turn: Turn,
    active: bool,
    finished: bool,
}

pub struct Handshake {
    state: Mutex<State>,
    turn_changed: Condvar,
}

impl Handshake {
    pub fn new() -> Arc<Self> {
        Arc::new(Handshake {
            state: Mutex::new(State {
                turn: Turn::Script,
                active: true,
                finished: false,
            }),
            turn_changed: Condvar::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Kernel side: block until the script parks (or ends, or the handshake
    /// deactivates). Used once at activation.
    pub fn wait_for_sim_turn(&self) {
        let mut state = self.lock();
        while state.turn == Turn::Script && state.active && !state.finished {
            state = self
                .turn_changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Kernel side: hand the turn to the script and block until it comes
    /// back. Returns immediately if the handshake is no longer live.
    pub fn step_from_sim(&self) {
        let mut state = self.lock();
        if !state.active || state.finished {
            return;
        }
        state.turn = Turn::Script;
        self.turn_changed.notify_all();
        while state.turn == Turn::Script && state.active && !state.finished {
            state = self
                .turn_changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Script side: yield to the kernel and block until the turn comes back.
    /// Returns false once the handshake has been deactivated.
    pub fn script_wait(&self) -> bool {
        let mut state = self.lock();
        state.turn = Turn::Sim;
        self.turn_changed.notify_all();
        while state.turn == Turn::Sim && state.active {
            state = self
                .turn_changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.active
    }

    /// Script side: the body has returned. Unblocks a pending kernel step.
    pub fn finish(&self) {
        let mut state = self.lock();
        state.finished = true;
        state.turn = Turn::Sim;
        self.turn_changed.notify_all();
    }

    /// Force both sides loose. Safe from either side, idempotent.
    pub fn deactivate(&self) {
        let mut state = self.lock();
        state.active = false;
        state.turn = Turn::Sim;
        self.turn_changed.notify_all();
    }

    pub fn is_active(&self) -> bool {
        self.lock().active
    }

    pub fn is_finished(&self) -> bool {
        self.lock().finished
    }

    pub fn turn(&self) -> Turn {
        self.lock().turn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::thread;

    #[test]
    fn ping_pong_never_runs_both_sides_at_once() {
        let handshake = Handshake::new();
        let busy = Arc::new(AtomicBool::new(false));
        let violations = Arc::new(AtomicU32::new(0));
        let steps = Arc::new(AtomicU32::new(0));

        let script = {
            let handshake = Arc::clone(&handshake);
            let busy = Arc::clone(&busy);
            let violations = Arc::clone(&violations);
            let steps = Arc::clone(&steps);
            thread::spawn(move || {
                while handshake.script_wait() {
                    if busy.swap(true, Ordering::SeqCst) {
                        violations.fetch_add(1, Ordering::SeqCst);
                    }
                    steps.fetch_add(1, Ordering::SeqCst);
                    busy.store(false, Ordering::SeqCst);
                }
            })
        };

        handshake.wait_for_sim_turn();
        for _ in 0..100 {
            if busy.swap(true, Ordering::SeqCst) {
                violations.fetch_add(1, Ordering::SeqCst);
            }
            busy.store(false, Ordering::SeqCst);
            handshake.step_from_sim();
        }
        handshake.deactivate();
        script.join().unwrap();

        assert_eq!(violations.load(Ordering::SeqCst), 0);
        assert_eq!(steps.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn deactivation_from_kernel_side_unblocks_the_script() {
        let handshake = Handshake::new();
        let script = {
            let handshake = Arc::clone(&handshake);
            thread::spawn(move || {
                let mut waits = 0;
                while handshake.script_wait() {
                    waits += 1;
                }
                waits
            })
        };

        handshake.wait_for_sim_turn();
        handshake.step_from_sim();
        handshake.deactivate();
        let waits = script.join().unwrap();
        assert_eq!(waits, 1);
        assert!(!handshake.is_active());
    }

    #[test]
    fn deactivation_from_script_side_unblocks_the_kernel() {
        let handshake = Handshake::new();
        let script = {
            let handshake = Arc::clone(&handshake);
            thread::spawn(move || {
                handshake.script_wait();
                // Script tears the handshake down mid-turn.
                handshake.deactivate();
            })
        };

        handshake.wait_for_sim_turn();
        handshake.step_from_sim();
        script.join().unwrap();
        assert!(!handshake.is_active());
        // Further steps are no-ops, not deadlocks.
        handshake.step_from_sim();
    }

    #[test]
    fn finished_script_does_not_block_later_steps() {
        let handshake = Handshake::new();
        let script = {
            let handshake = Arc::clone(&handshake);
            thread::spawn(move || {
                // Body runs its prologue and ends without ever waiting.
                handshake.finish();
            })
        };

        handshake.wait_for_sim_turn();
        script.join().unwrap();
        assert!(handshake.is_finished());
        handshake.step_from_sim();
    }
}
