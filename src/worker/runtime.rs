//! Actor-style worker runtime.
//!
//! Every worker owns a single command queue consumed by one task, so a
//! worker's state never needs its own locking. Events from the bus are
//! turned into commands by the worker's [`EventTranslator`] on a separate
//! pump task; translation therefore keeps up even while a long command is
//! being handled.
//!
//! The runtime is a handle the worker embeds by composition. It carries the
//! queue, the subworker table, and deferred commands; the worker itself
//! supplies domain behavior through the [`Worker`] trait.

use crate::events::{Event, EventBus};
use crate::worker::status::{
    StatusBoard, STATUS_ADDED, STATUS_INITIALIZED, STATUS_INIT_FAILED, STATUS_STARTED,
    STATUS_TERMINATED, STATUS_TERMINATING,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const DEFAULT_DEFERRED_DELAY: Duration = Duration::from_secs(5);

/// A command on a worker's queue: either one of the runtime's own control
/// commands or a domain command of the worker's choosing.
#[derive(Debug)]
pub enum WorkerCommand<C> {
    /// Stop subworkers and prepare to wind down.
    BeginShutdown,
    /// A subworker's task has exited.
    SubworkerTerminated(String),
    /// Exit the command loop once all subworkers are done.
    Terminate(String),
    /// Worker-specific command.
    Domain(C),
}

impl<C: fmt::Display> fmt::Display for WorkerCommand<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerCommand::BeginShutdown => write!(f, "BeginShutdown"),
            WorkerCommand::SubworkerTerminated(name) => {
                write!(f, "SubworkerTerminated({name})")
            }
            WorkerCommand::Terminate(reason) => write!(f, "Terminate({reason})"),
            WorkerCommand::Domain(command) => write!(f, "{command}"),
        }
    }
}

/// Translates bus events into commands for one worker. Runs on the pump
/// task, concurrently with the command loop, so it must not touch worker
/// state; anything it needs is captured at construction.
pub trait EventTranslator: Send + Sync {
    type Command;

    fn translate(&self, event: &Event) -> Vec<WorkerCommand<Self::Command>>;
}

struct Subworker {
    quit: watch::Sender<bool>,
    terminated: bool,
}

/// Per-worker runtime state, embedded in each worker by composition.
pub struct WorkerRuntime<C> {
    name: String,
    bus: EventBus,
    status: Arc<StatusBoard>,
    sender: mpsc::UnboundedSender<WorkerCommand<C>>,
    queue: Option<mpsc::UnboundedReceiver<WorkerCommand<C>>>,
    subworkers: HashMap<String, Subworker>,
    deferred: Vec<WorkerCommand<C>>,
    deferred_delay: Duration,
    no_work_interval: Option<Duration>,
}

impl<C: Send + 'static> WorkerRuntime<C> {
    pub fn new(name: &str, bus: EventBus, status: Arc<StatusBoard>) -> Self {
        let (sender, queue) = mpsc::unbounded_channel();
        Self {
            name: name.to_string(),
            bus,
            status,
            sender,
            queue: Some(queue),
            subworkers: HashMap::new(),
            deferred: Vec::new(),
            deferred_delay: DEFAULT_DEFERRED_DELAY,
            no_work_interval: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn status_board(&self) -> Arc<StatusBoard> {
        self.status.clone()
    }

    /// Sender half of the command queue, for anything outside the worker
    /// that needs to enqueue commands directly.
    pub fn command_sender(&self) -> mpsc::UnboundedSender<WorkerCommand<C>> {
        self.sender.clone()
    }

    /// Enable the idle callback: when no command arrives within `interval`
    /// the loop calls [`Worker::no_work`].
    pub fn set_no_work_interval(&mut self, interval: Duration) {
        self.no_work_interval = Some(interval);
    }

    /// How long a deferred command waits before being requeued. Mostly for
    /// tests; the default suits production.
    pub fn set_deferred_delay(&mut self, delay: Duration) {
        self.deferred_delay = delay;
    }

    /// Park a command to be retried after the deferred delay.
    pub fn defer(&mut self, command: WorkerCommand<C>) {
        self.deferred.push(command);
    }

    /// Start a subworker that runs `task` every `interval`. The task may
    /// return a new interval to reschedule itself. Returns false if a live
    /// subworker already holds the name.
    pub fn dispatch_periodic<F, Fut>(&mut self, subworker: &str, interval: Duration, mut task: F) -> bool
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Option<Duration>> + Send,
    {
        if self.live_subworker(subworker) {
            warn!(
                worker = %self.name,
                subworker,
                "subworker already running, not adding"
            );
            return false;
        }
        let (quit, mut quit_rx) = watch::channel(false);
        self.subworkers
            .insert(subworker.to_string(), Subworker { quit, terminated: false });
        self.status
            .set_subworker_status(&self.name, subworker, STATUS_ADDED);

        let commands = self.sender.clone();
        let status = self.status.clone();
        let parent = self.name.clone();
        let name = subworker.to_string();
        tokio::spawn(async move {
            status.set_subworker_status(&parent, &name, STATUS_STARTED);
            let mut wait = interval;
            loop {
                tokio::select! {
                    _ = quit_rx.changed() => break,
                    _ = tokio::time::sleep(wait) => {
                        if let Some(next) = task().await {
                            wait = next;
                        }
                    }
                }
            }
            let _ = commands.send(WorkerCommand::SubworkerTerminated(name));
        });
        true
    }

    /// Start a subworker around a single long-running future. The future
    /// is dropped if the subworker is told to quit first.
    pub fn dispatch_loop<Fut>(&mut self, subworker: &str, task: Fut) -> bool
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.live_subworker(subworker) {
            warn!(
                worker = %self.name,
                subworker,
                "subworker already running, not adding"
            );
            return false;
        }
        let (quit, mut quit_rx) = watch::channel(false);
        self.subworkers
            .insert(subworker.to_string(), Subworker { quit, terminated: false });
        self.status
            .set_subworker_status(&self.name, subworker, STATUS_ADDED);

        let commands = self.sender.clone();
        let status = self.status.clone();
        let parent = self.name.clone();
        let name = subworker.to_string();
        tokio::spawn(async move {
            status.set_subworker_status(&parent, &name, STATUS_STARTED);
            tokio::select! {
                _ = quit_rx.changed() => {}
                _ = task => {}
            }
            let _ = commands.send(WorkerCommand::SubworkerTerminated(name));
        });
        true
    }

    /// Ask every live subworker to quit.
    pub fn terminate_subworkers(&mut self) {
        for (name, sub) in &self.subworkers {
            if !sub.terminated {
                self.status
                    .set_subworker_status(&self.name, name, STATUS_TERMINATING);
                let _ = sub.quit.send(true);
            }
        }
    }

    /// True when no subworker is still running.
    pub fn subworkers_done(&self) -> bool {
        self.subworkers.values().all(|s| s.terminated)
    }

    fn live_subworker(&self, name: &str) -> bool {
        self.subworkers.get(name).is_some_and(|s| !s.terminated)
    }

    fn record_subworker_terminated(&mut self, subworker: &str) {
        if let Some(sub) = self.subworkers.get_mut(subworker) {
            sub.terminated = true;
            self.status
                .set_subworker_status(&self.name, subworker, STATUS_TERMINATED);
        }
    }

    fn take_queue(&mut self) -> mpsc::UnboundedReceiver<WorkerCommand<C>> {
        // Only the command loop calls this, exactly once.
        match self.queue.take() {
            Some(queue) => queue,
            None => unreachable!("worker command queue already taken"),
        }
    }

    fn poll_interval(&self) -> Option<Duration> {
        match (self.no_work_interval, self.deferred.is_empty()) {
            (Some(interval), _) => Some(interval),
            (None, false) => Some(self.deferred_delay),
            (None, true) => None,
        }
    }

    fn requeue_deferred(&mut self) {
        for command in self.deferred.drain(..) {
            let _ = self.sender.send(command);
        }
    }
}

/// A worker: domain state plus an embedded [`WorkerRuntime`].
#[async_trait]
pub trait Worker: Send + 'static {
    type Command: Send + fmt::Display + 'static;

    fn runtime(&self) -> &WorkerRuntime<Self::Command>;
    fn runtime_mut(&mut self) -> &mut WorkerRuntime<Self::Command>;

    /// Translator shared with the event pump task.
    fn translator(&self) -> Arc<dyn EventTranslator<Command = Self::Command>>;

    /// One-shot setup before the command loop starts. Returning false marks
    /// the worker initialization-failed and the loop never runs.
    async fn initialize(&mut self) -> bool {
        true
    }

    /// Handle one domain command. Returning false means the command was not
    /// recognized; the runtime logs and drops it.
    async fn handle_command(&mut self, command: Self::Command) -> bool;

    /// Called when the no-work interval elapses without a command.
    async fn no_work(&mut self) {}
}

/// Spawn a worker: one pump task translating events, one task consuming the
/// command queue. The returned handle resolves when the command loop exits.
pub fn spawn<W: Worker>(mut worker: W) -> JoinHandle<()> {
    let name = worker.runtime().name().to_string();
    let bus = worker.runtime().bus().clone();
    let status = worker.runtime().status_board();
    let sender = worker.runtime().command_sender();
    let translator = worker.translator();
    let mut events = bus.subscribe();

    let pump_name = name.clone();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    for command in translator.translate(&event) {
                        if sender.send(command).is_err() {
                            return;
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(worker = %pump_name, missed, "event pump lagged, events lost");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    });

    tokio::spawn(async move {
        status.set_worker_status(&name, STATUS_STARTED);
        if !worker.initialize().await {
            status.set_worker_status(&name, STATUS_INIT_FAILED);
            warn!(worker = %name, "initialization failed");
            status.set_worker_status(&name, STATUS_TERMINATED);
            bus.publish(Event::WorkerStopped { worker: name });
            return;
        }
        status.set_worker_status(&name, STATUS_INITIALIZED);
        info!(worker = %name, "initialized");

        let mut queue = worker.runtime_mut().take_queue();
        loop {
            let next = match worker.runtime().poll_interval() {
                None => queue.recv().await,
                Some(wait) => match tokio::time::timeout(wait, queue.recv()).await {
                    Ok(next) => next,
                    Err(_) => {
                        if worker.runtime().no_work_interval.is_some() {
                            worker.no_work().await;
                        }
                        worker.runtime_mut().requeue_deferred();
                        continue;
                    }
                },
            };
            let Some(command) = next else { break };
            if dispatch(&mut worker, &name, &status, command).await {
                break;
            }
        }

        status.set_worker_status(&name, STATUS_TERMINATED);
        bus.publish(Event::WorkerStopped { worker: name });
    })
}

/// Handle one command. Returns true when the loop should exit.
async fn dispatch<W: Worker>(
    worker: &mut W,
    name: &str,
    status: &Arc<StatusBoard>,
    command: WorkerCommand<W::Command>,
) -> bool {
    debug!(worker = name, command = %command, "received command");
    match command {
        WorkerCommand::BeginShutdown => {
            worker.runtime_mut().terminate_subworkers();
            false
        }
        WorkerCommand::SubworkerTerminated(subworker) => {
            worker.runtime_mut().record_subworker_terminated(&subworker);
            false
        }
        WorkerCommand::Terminate(reason) => {
            status.set_worker_status(name, STATUS_TERMINATING);
            if worker.runtime().subworkers_done() {
                info!(worker = name, reason = %reason, "terminating");
                true
            } else {
                // Subworkers still draining; try again after the delay.
                worker.runtime_mut().defer(WorkerCommand::Terminate(reason));
                false
            }
        }
        WorkerCommand::Domain(command) => {
            if !worker.handle_command(command).await {
                warn!(worker = name, "unrecognized command dropped");
            }
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::status::STATUS_NONE;
    use std::sync::Mutex;

    #[derive(Debug)]
    enum TestCommand {
        Note(String),
    }

    impl fmt::Display for TestCommand {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                TestCommand::Note(note) => write!(f, "Note({note})"),
            }
        }
    }

    struct ShutdownTranslator;

    impl EventTranslator for ShutdownTranslator {
        type Command = TestCommand;

        fn translate(&self, event: &Event) -> Vec<WorkerCommand<TestCommand>> {
            match event {
                Event::ShutdownRequested => vec![
                    WorkerCommand::BeginShutdown,
                    WorkerCommand::Terminate("shutdown".to_string()),
                ],
                _ => Vec::new(),
            }
        }
    }

    struct TestWorker {
        runtime: WorkerRuntime<TestCommand>,
        init_ok: bool,
        with_subworker: bool,
        notes: Arc<Mutex<Vec<String>>>,
    }

    impl TestWorker {
        fn new(name: &str, bus: EventBus, status: Arc<StatusBoard>) -> Self {
            let mut runtime = WorkerRuntime::new(name, bus, status);
            runtime.set_deferred_delay(Duration::from_millis(20));
            Self {
                runtime,
                init_ok: true,
                with_subworker: false,
                notes: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl Worker for TestWorker {
        type Command = TestCommand;

        fn runtime(&self) -> &WorkerRuntime<TestCommand> {
            &self.runtime
        }

        fn runtime_mut(&mut self) -> &mut WorkerRuntime<TestCommand> {
            &mut self.runtime
        }

        fn translator(&self) -> Arc<dyn EventTranslator<Command = TestCommand>> {
            Arc::new(ShutdownTranslator)
        }

        async fn initialize(&mut self) -> bool {
            if self.with_subworker {
                self.runtime.dispatch_periodic(
                    "ticker",
                    Duration::from_secs(3600),
                    || async { None::<Duration> },
                );
            }
            self.init_ok
        }

        async fn handle_command(&mut self, command: TestCommand) -> bool {
            match command {
                TestCommand::Note(note) => {
                    self.notes.lock().unwrap().push(note);
                    true
                }
            }
        }
    }

    async fn wait_for_status(board: &StatusBoard, worker: &str, wanted: &str) {
        for _ in 0..200 {
            if board.worker_status(worker).as_deref() == Some(wanted) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "worker {worker} never reached {wanted}, at {:?}",
            board.worker_status(worker)
        );
    }

    #[tokio::test]
    async fn lifecycle_follows_exact_status_sequence() {
        let bus = EventBus::new(16);
        let board = Arc::new(StatusBoard::new());
        let worker = TestWorker::new("t1", bus.clone(), board.clone());
        let handle = spawn(worker);

        wait_for_status(&board, "t1", STATUS_INITIALIZED).await;
        bus.publish(Event::ShutdownRequested);
        handle.await.unwrap();

        assert_eq!(board.worker_status("t1").as_deref(), Some(STATUS_TERMINATED));
        let log = board.log();
        let statuses: Vec<&str> = log
            .iter()
            .filter(|l| l.contains("Worker t1:"))
            .map(|l| l.rsplit(": ").next().unwrap().trim_end_matches('.'))
            .collect();
        assert_eq!(
            statuses,
            vec![STATUS_STARTED, STATUS_INITIALIZED, STATUS_TERMINATING, STATUS_TERMINATED]
        );
    }

    #[tokio::test]
    async fn failed_initialize_passes_through_init_failed_to_terminated() {
        let bus = EventBus::new(16);
        let board = Arc::new(StatusBoard::new());
        let mut events = bus.subscribe();
        let mut worker = TestWorker::new("t2", bus.clone(), board.clone());
        worker.init_ok = false;

        let handle = spawn(worker);
        handle.await.unwrap();

        assert_eq!(board.worker_status("t2").as_deref(), Some(STATUS_TERMINATED));
        let log = board.log();
        let statuses: Vec<&str> = log
            .iter()
            .filter(|l| l.contains("Worker t2:"))
            .map(|l| l.rsplit(": ").next().unwrap().trim_end_matches('.'))
            .collect();
        assert_eq!(
            statuses,
            vec![STATUS_STARTED, STATUS_INIT_FAILED, STATUS_TERMINATED]
        );
        loop {
            match events.recv().await.unwrap() {
                Event::WorkerStopped { worker } => {
                    assert_eq!(worker, "t2");
                    break;
                }
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn domain_commands_reach_the_worker() {
        let bus = EventBus::new(16);
        let board = Arc::new(StatusBoard::new());
        let worker = TestWorker::new("t3", bus.clone(), board.clone());
        let notes = worker.notes.clone();
        let sender = worker.runtime().command_sender();
        let handle = spawn(worker);

        wait_for_status(&board, "t3", STATUS_INITIALIZED).await;
        sender
            .send(WorkerCommand::Domain(TestCommand::Note("hi".to_string())))
            .unwrap();
        bus.publish(Event::ShutdownRequested);
        handle.await.unwrap();

        assert_eq!(notes.lock().unwrap().as_slice(), ["hi".to_string()]);
    }

    #[tokio::test]
    async fn termination_waits_for_subworkers() {
        let bus = EventBus::new(16);
        let board = Arc::new(StatusBoard::new());
        let mut worker = TestWorker::new("t4", bus.clone(), board.clone());
        worker.with_subworker = true;
        let handle = spawn(worker);

        wait_for_status(&board, "t4", STATUS_INITIALIZED).await;
        bus.publish(Event::ShutdownRequested);
        handle.await.unwrap();

        assert_eq!(board.worker_status("t4").as_deref(), Some(STATUS_TERMINATED));
        assert_eq!(
            board.subworker_status("t4", "ticker").as_deref(),
            Some(STATUS_TERMINATED)
        );
    }

    #[tokio::test]
    async fn duplicate_subworker_name_is_rejected() {
        let bus = EventBus::new(16);
        let board = Arc::new(StatusBoard::new());
        let mut runtime: WorkerRuntime<TestCommand> =
            WorkerRuntime::new("t5", bus, board.clone());

        assert!(runtime.dispatch_periodic("h", Duration::from_secs(60), || async { None::<Duration> }));
        assert!(!runtime.dispatch_periodic("h", Duration::from_secs(60), || async { None::<Duration> }));
        assert_eq!(board.worker_status("t5").as_deref(), Some(STATUS_NONE));
    }
}
