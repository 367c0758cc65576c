//! Cancellable, streaming execution of optimizer runs.
//!
//! Every run lives on its own worker thread which owns all solver state.
//! The controller talks to it over a command channel and reads back a single
//! ordered event channel. Events carry the id of the run that produced them;
//! anything from a superseded or stopped run is dropped on the receiving
//! side, so nothing from a cancelled run is ever observed.

use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::{
    boundary::GoalMarkers,
    datatypes::{Mesh, SolverFrame},
    error::Result,
    params::SimpParams,
    solver::SimpSolver,
};

/// Everything a run needs. Moved into the worker on `start`.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub mesh: Mesh,
    pub markers: GoalMarkers,
    pub params: SimpParams,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SolverEvent {
    Frame(SolverFrame),
    /// The run converged or hit its iteration cap
    Done,
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Paused,
    Converged,
    Exhausted,
    Cancelled,
    Errored,
}

impl RunState {
    pub fn is_active(self) -> bool {
        matches!(self, RunState::Running | RunState::Paused)
    }

    /// Whether `self -> next` is a legal transition. Starting a run is
    /// legal from any state.
    pub fn allows(self, next: RunState) -> bool {
        use RunState::*;
        match (self, next) {
            (_, Running) => true,
            (Running, Paused) => true,
            (Running | Paused, Cancelled | Converged | Exhausted | Errored) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Pause,
    Resume,
    Stop,
}

#[derive(Debug)]
struct Tagged {
    run: u64,
    event: SolverEvent,
}

struct ActiveRun {
    id: u64,
    commands: Sender<Command>,
    _worker: JoinHandle<()>,
}

/// How a worker left its loop
enum Exit {
    Finished,
    Cancelled,
}

/// Waits out a pause. Returns `false` if the run should end instead.
fn wait_for_resume(commands: &Receiver<Command>) -> bool {
    loop {
        match commands.recv() {
            Ok(Command::Resume) => return true,
            Ok(Command::Pause) => continue,
            Ok(Command::Stop) | Err(_) => return false,
        }
    }
}

/// Drains pending commands at an iteration boundary. Returns `false` if the
/// run should end.
fn poll_commands(commands: &Receiver<Command>) -> bool {
    loop {
        match commands.try_recv() {
            Ok(Command::Resume) => continue,
            Ok(Command::Pause) => {
                if !wait_for_resume(commands) {
                    return false;
                }
            }
            Ok(Command::Stop) | Err(TryRecvError::Disconnected) => return false,
            Err(TryRecvError::Empty) => return true,
        }
    }
}

fn drive(
    request: RunRequest,
    run: u64,
    commands: &Receiver<Command>,
    events: &Sender<Tagged>,
) -> Result<Exit> {
    let RunRequest {
        mesh,
        markers,
        params,
    } = request;
    let yield_every = params.yield_every.max(1);
    let mut solver = SimpSolver::from_markers(&mesh, &markers, params)?;

    loop {
        if !poll_commands(commands) {
            return Ok(Exit::Cancelled);
        }

        let outcome = solver.step()?;
        if let Some(frame) = outcome.frame {
            let event = SolverEvent::Frame(frame);
            if events.send(Tagged { run, event }).is_err() {
                return Ok(Exit::Cancelled);
            }
        }
        if outcome.terminal {
            return Ok(Exit::Finished);
        }
        if outcome.iteration % yield_every == 0 {
            thread::yield_now();
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}

fn run_worker(request: RunRequest, run: u64, commands: Receiver<Command>, events: Sender<Tagged>) {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| drive(request, run, &commands, &events)));

    let event = match outcome {
        Ok(Ok(Exit::Finished)) => SolverEvent::Done,
        Ok(Ok(Exit::Cancelled)) => {
            log::debug!("run {} cancelled", run);
            return;
        }
        Ok(Err(err)) => SolverEvent::Error(err.to_string()),
        Err(payload) => SolverEvent::Error(format!("solver panicked: {}", panic_message(payload))),
    };
    if let SolverEvent::Error(message) = &event {
        log::error!("run {} failed: {}", run, message);
    }
    // the controller may already be gone
    let _ = events.send(Tagged { run, event });
}

/// Owner of at most one optimizer run at a time
pub struct Controller {
    events_tx: Sender<Tagged>,
    events_rx: Receiver<Tagged>,
    active: Option<ActiveRun>,
    accepting: Option<u64>,
    next_run: u64,
    state: RunState,
    last_converged: bool,
}

impl Default for Controller {
    fn default() -> Self {
        Controller::new()
    }
}

impl Controller {
    pub fn new() -> Controller {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        Controller {
            events_tx,
            events_rx,
            active: None,
            accepting: None,
            next_run: 1,
            state: RunState::Idle,
            last_converged: false,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    fn transition(&mut self, next: RunState) -> bool {
        if !self.state.allows(next) {
            log::debug!("ignoring transition {:?} -> {:?}", self.state, next);
            return false;
        }
        self.state = next;
        true
    }

    /// Tells the active worker to stop and forgets it
    fn cancel_active(&mut self) {
        if let Some(run) = self.active.take() {
            // a worker that already exited has dropped its receiver
            let _ = run.commands.send(Command::Stop);
            log::debug!("cancelled run {}", run.id);
        }
        self.accepting = None;
    }

    /// Starts a new run, cancelling any active one. Returns the run id.
    pub fn start(&mut self, request: RunRequest) -> u64 {
        self.cancel_active();

        let id = self.next_run;
        self.next_run += 1;
        let (commands_tx, commands_rx) = crossbeam_channel::unbounded();
        let events = self.events_tx.clone();
        let worker = thread::spawn(move || run_worker(request, id, commands_rx, events));

        self.active = Some(ActiveRun {
            id,
            commands: commands_tx,
            _worker: worker,
        });
        self.accepting = Some(id);
        self.last_converged = false;
        self.state = RunState::Running;
        log::info!("started run {}", id);
        id
    }

    fn send(&self, command: Command) {
        if let Some(run) = &self.active {
            let _ = run.commands.send(command);
        }
    }

    /// Suspends frame production at the next iteration boundary
    pub fn pause(&mut self) -> bool {
        if !self.transition(RunState::Paused) {
            return false;
        }
        self.send(Command::Pause);
        true
    }

    pub fn resume(&mut self) -> bool {
        if self.state != RunState::Paused || !self.transition(RunState::Running) {
            log::debug!("ignoring resume while {:?}", self.state);
            return false;
        }
        self.send(Command::Resume);
        true
    }

    /// Cancels the active run. No frame or `Done` from it is delivered
    /// afterwards.
    pub fn stop(&mut self) -> bool {
        if !self.transition(RunState::Cancelled) {
            return false;
        }
        self.cancel_active();
        log::info!("stopped");
        true
    }

    /// Updates the state for an event of the accepted run. Returns `None`
    /// for events of any other run.
    fn accept(&mut self, tagged: Tagged) -> Option<SolverEvent> {
        if self.accepting != Some(tagged.run) {
            return None;
        }
        match &tagged.event {
            SolverEvent::Frame(frame) => self.last_converged = frame.converged,
            SolverEvent::Done => {
                let next = if self.last_converged {
                    RunState::Converged
                } else {
                    RunState::Exhausted
                };
                self.transition(next);
                self.active = None;
            }
            SolverEvent::Error(_) => {
                self.transition(RunState::Errored);
                self.active = None;
            }
        }
        Some(tagged.event)
    }

    /// Next event without blocking
    pub fn try_recv(&mut self) -> Option<SolverEvent> {
        while let Ok(tagged) = self.events_rx.try_recv() {
            if let Some(event) = self.accept(tagged) {
                return Some(event);
            }
        }
        None
    }

    /// Next event. Blocks only while a run is producing; otherwise behaves
    /// like [`Controller::try_recv`].
    pub fn recv(&mut self) -> Option<SolverEvent> {
        while self.state == RunState::Running {
            let tagged = self.events_rx.recv().ok()?;
            if let Some(event) = self.accept(tagged) {
                return Some(event);
            }
        }
        self.try_recv()
    }

    /// Like [`Controller::recv`], giving up after `timeout`
    pub fn recv_timeout(&mut self, timeout: Duration) -> Option<SolverEvent> {
        let deadline = Instant::now() + timeout;
        while self.state == RunState::Running {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.events_rx.recv_timeout(remaining) {
                Ok(tagged) => {
                    if let Some(event) = self.accept(tagged) {
                        return Some(event);
                    }
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
        self.try_recv()
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.cancel_active();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine() {
        use RunState::*;
        assert!(Idle.allows(Running));
        assert!(Running.allows(Paused));
        assert!(Paused.allows(Running));
        assert!(Paused.allows(Cancelled));
        assert!(Cancelled.allows(Running));
        assert!(!Idle.allows(Paused));
        assert!(!Idle.allows(Cancelled));
        assert!(!Converged.allows(Paused));
        assert!(!Paused.allows(Paused));
    }

    #[test]
    fn idle_controller_ignores_controls() {
        let mut controller = Controller::new();
        assert!(!controller.pause());
        assert!(!controller.resume());
        assert!(!controller.stop());
        assert_eq!(controller.state(), RunState::Idle);
        assert_eq!(controller.try_recv(), None);
        assert_eq!(controller.recv(), None);
    }

    #[test]
    fn invalid_parameters_give_one_error() {
        let mut controller = Controller::new();
        let request = RunRequest {
            mesh: Mesh::new(vec![0.0, 0.0, 0.0, 1.0, 1.0, 0.0]),
            markers: GoalMarkers::default(),
            params: SimpParams {
                nx: 0,
                ..Default::default()
            },
        };
        controller.start(request);

        let first = controller.recv_timeout(Duration::from_secs(30));
        assert!(matches!(first, Some(SolverEvent::Error(_))));
        assert_eq!(controller.state(), RunState::Errored);
        assert_eq!(controller.recv_timeout(Duration::from_millis(50)), None);
    }

    #[test]
    fn panic_payloads_become_messages() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new(String::from("bang"))), "bang");
        assert_eq!(panic_message(Box::new(3)), "unknown panic");
    }
}
