//! Scripted engine for tests
//!
//! Each sandbox runs a [`Script`] instead of a real program. Scripts are picked
//! from the submitted source, so tests drive the full session flow without a
//! container runtime.

use crate::engine::{
    receiver_stream, stdin_relay, AttachOptions, AttachedIo, ExitStatus, SandboxEngine,
    SandboxHandle, SandboxSpec,
};
use crate::error::{SandboxError, SandboxResult};
use crate::frame::{encode_frame, StreamKind};
use async_trait::async_trait;
use bytes::Bytes;
use coderun_common::SOURCE_ENV_VAR;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

/// Exit code reported for a sandbox stopped before its script finished
pub const KILLED_EXIT_CODE: i64 = 137;

type Responder = Arc<dyn Fn(&[String]) -> String + Send + Sync>;
type Resolver = Arc<dyn Fn(&str) -> Script + Send + Sync>;

/// One scripted program action
#[derive(Clone)]
pub enum Step {
    Stdout(String),
    Stderr(String),
    /// Unframed bytes, as a TTY sandbox would produce
    Raw(Bytes),
    /// Block until a full line arrives on stdin
    ReadLine,
    /// Print to stdout whatever the closure makes of the lines read so far
    Respond(Responder),
    Sleep(Duration),
    Exit(i64),
    /// Fail the output stream
    Fault(String),
    /// Never finish
    Hang,
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Step::Stdout(text) => f.debug_tuple("Stdout").field(text).finish(),
            Step::Stderr(text) => f.debug_tuple("Stderr").field(text).finish(),
            Step::Raw(bytes) => f.debug_tuple("Raw").field(bytes).finish(),
            Step::ReadLine => f.write_str("ReadLine"),
            Step::Respond(_) => f.write_str("Respond(..)"),
            Step::Sleep(d) => f.debug_tuple("Sleep").field(d).finish(),
            Step::Exit(code) => f.debug_tuple("Exit").field(code).finish(),
            Step::Fault(msg) => f.debug_tuple("Fault").field(msg).finish(),
            Step::Hang => f.write_str("Hang"),
        }
    }
}

/// Ordered list of steps a scripted sandbox plays
#[derive(Debug, Clone, Default)]
pub struct Script {
    steps: Vec<Step>,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn stdout(self, text: impl Into<String>) -> Self {
        self.step(Step::Stdout(text.into()))
    }

    pub fn stderr(self, text: impl Into<String>) -> Self {
        self.step(Step::Stderr(text.into()))
    }

    pub fn raw(self, bytes: impl Into<Bytes>) -> Self {
        self.step(Step::Raw(bytes.into()))
    }

    pub fn read_line(self) -> Self {
        self.step(Step::ReadLine)
    }

    pub fn respond<F>(self, responder: F) -> Self
    where
        F: Fn(&[String]) -> String + Send + Sync + 'static,
    {
        self.step(Step::Respond(Arc::new(responder)))
    }

    pub fn sleep(self, duration: Duration) -> Self {
        self.step(Step::Sleep(duration))
    }

    pub fn exit(self, code: i64) -> Self {
        self.step(Step::Exit(code))
    }

    pub fn fault(self, message: impl Into<String>) -> Self {
        self.step(Step::Fault(message.into()))
    }

    pub fn hang(self) -> Self {
        self.step(Step::Hang)
    }

    /// `print(text)` followed by a clean exit
    pub fn prints(text: impl Into<String>) -> Self {
        Self::new().stdout(text).exit(0)
    }

    /// Two-number calculator that prompts three times
    pub fn calculator() -> Self {
        Self::new()
            .stdout("Enter first number: ")
            .read_line()
            .stdout("Enter second number: ")
            .read_line()
            .stdout("Enter operation (+, -, *, /): ")
            .read_line()
            .respond(|lines| calculate(lines).unwrap_or_else(|e| format!("Error: {e}\n")))
            .exit(0)
    }
}

fn calculate(lines: &[String]) -> Result<String, String> {
    let [a, b, op] = lines else {
        return Err("expected three inputs".to_string());
    };
    let a: f64 = a.trim().parse().map_err(|_| "invalid number".to_string())?;
    let b: f64 = b.trim().parse().map_err(|_| "invalid number".to_string())?;
    let value = match op.trim() {
        "+" => a + b,
        "-" => a - b,
        "*" => a * b,
        "/" if b == 0.0 => return Err("division by zero".to_string()),
        "/" => a / b,
        other => return Err(format!("unknown operation {other}")),
    };
    Ok(format!("Result: {value}\n"))
}

/// Engine operation, for failure injection and call counting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineOp {
    Create,
    Start,
    Attach,
    Stop,
    Remove,
    Wait,
}

struct ScriptedSandbox {
    script: Option<Script>,
    output_rx: Option<mpsc::UnboundedReceiver<std::io::Result<Bytes>>>,
    stdin_tx: Option<mpsc::UnboundedSender<Bytes>>,
    task: Option<JoinHandle<()>>,
    exit_tx: Arc<watch::Sender<Option<ExitStatus>>>,
}

#[derive(Default)]
struct Ledger {
    calls: HashMap<EngineOp, usize>,
    removals: HashMap<String, usize>,
    inputs: HashMap<String, Vec<String>>,
}

/// In-memory engine playing scripts
pub struct ScriptedEngine {
    resolver: Resolver,
    sandboxes: Mutex<HashMap<SandboxHandle, ScriptedSandbox>>,
    failing: StdMutex<HashSet<EngineOp>>,
    deny_stdin: StdMutex<bool>,
    stop_delay: StdMutex<Duration>,
    ledger: Arc<StdMutex<Ledger>>,
}

impl ScriptedEngine {
    /// Choose each sandbox's script from its source code
    pub fn new<F>(resolver: F) -> Self
    where
        F: Fn(&str) -> Script + Send + Sync + 'static,
    {
        Self {
            resolver: Arc::new(resolver),
            sandboxes: Mutex::new(HashMap::new()),
            failing: StdMutex::new(HashSet::new()),
            deny_stdin: StdMutex::new(false),
            stop_delay: StdMutex::new(Duration::ZERO),
            ledger: Arc::new(StdMutex::new(Ledger::default())),
        }
    }

    /// Every sandbox plays `script`
    pub fn with_script(script: Script) -> Self {
        Self::new(move |_| script.clone())
    }

    /// Make every future call of `op` fail
    pub fn fail_on(&self, op: EngineOp) {
        lock(&self.failing).insert(op);
    }

    /// Make write-only attaches return no input side
    pub fn deny_stdin(&self) {
        *lock(&self.deny_stdin) = true;
    }

    /// Make every `stop` take `delay` before the sandbox exits
    pub fn slow_stop(&self, delay: Duration) {
        *lock(&self.stop_delay) = delay;
    }

    /// Number of calls made to `op`, failed ones included
    pub fn calls(&self, op: EngineOp) -> usize {
        lock(&self.ledger).calls.get(&op).copied().unwrap_or(0)
    }

    /// Successful removals of the sandbox called `name`
    pub fn removals(&self, name: &str) -> usize {
        lock(&self.ledger).removals.get(name).copied().unwrap_or(0)
    }

    /// Lines the sandbox called `name` read from stdin
    pub fn inputs(&self, name: &str) -> Vec<String> {
        lock(&self.ledger)
            .inputs
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    /// Sandboxes created and not yet removed
    pub async fn live_sandboxes(&self) -> Vec<SandboxHandle> {
        self.sandboxes.lock().await.keys().cloned().collect()
    }

    fn enter(&self, op: EngineOp, handle: &str) -> SandboxResult<()> {
        *lock(&self.ledger).calls.entry(op).or_default() += 1;
        if lock(&self.failing).contains(&op) {
            return Err(SandboxError::operation(
                op_name(op),
                handle,
                "injected failure",
            ));
        }
        Ok(())
    }
}

fn op_name(op: EngineOp) -> &'static str {
    match op {
        EngineOp::Create => "create",
        EngineOp::Start => "start",
        EngineOp::Attach => "attach",
        EngineOp::Stop => "stop",
        EngineOp::Remove => "remove",
        EngineOp::Wait => "wait",
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn publish_exit(exit: &watch::Sender<Option<ExitStatus>>, code: i64) {
    exit.send_if_modified(|status| {
        if status.is_none() {
            *status = Some(ExitStatus { code });
            true
        } else {
            false
        }
    });
}

async fn play(
    name: String,
    script: Script,
    frames: mpsc::UnboundedSender<std::io::Result<Bytes>>,
    mut stdin: mpsc::UnboundedReceiver<Bytes>,
    exit: Arc<watch::Sender<Option<ExitStatus>>>,
    ledger: Arc<StdMutex<Ledger>>,
) {
    let mut lines: Vec<String> = Vec::new();
    let mut pending: Vec<u8> = Vec::new();

    for step in script.steps {
        match step {
            Step::Stdout(text) => {
                let _ = frames.send(Ok(encode_frame(StreamKind::Stdout, text.as_bytes())));
            }
            Step::Stderr(text) => {
                let _ = frames.send(Ok(encode_frame(StreamKind::Stderr, text.as_bytes())));
            }
            Step::Raw(bytes) => {
                let _ = frames.send(Ok(bytes));
            }
            Step::ReadLine => loop {
                if let Some(end) = pending.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = pending.drain(..=end).collect();
                    let line = String::from_utf8_lossy(&line[..end]).into_owned();
                    lock(&ledger)
                        .inputs
                        .entry(name.clone())
                        .or_default()
                        .push(line.clone());
                    lines.push(line);
                    break;
                }
                match stdin.recv().await {
                    Some(chunk) => pending.extend_from_slice(&chunk),
                    // EOF on stdin
                    None => {
                        publish_exit(&exit, 1);
                        return;
                    }
                }
            },
            Step::Respond(responder) => {
                let text = responder(&lines);
                let _ = frames.send(Ok(encode_frame(StreamKind::Stdout, text.as_bytes())));
            }
            Step::Sleep(duration) => tokio::time::sleep(duration).await,
            Step::Exit(code) => {
                publish_exit(&exit, code);
                return;
            }
            Step::Fault(message) => {
                let _ = frames.send(Err(std::io::Error::other(message)));
                publish_exit(&exit, 1);
                return;
            }
            Step::Hang => std::future::pending::<()>().await,
        }
    }
    publish_exit(&exit, 0);
}

#[async_trait]
impl SandboxEngine for ScriptedEngine {
    async fn create(&self, spec: SandboxSpec) -> SandboxResult<SandboxHandle> {
        self.enter(EngineOp::Create, &spec.name)?;
        let source = spec.env_var(SOURCE_ENV_VAR).unwrap_or_default();
        let script = (self.resolver)(source);

        let handle = SandboxHandle::new(spec.name);
        let (exit_tx, _) = watch::channel(None);
        self.sandboxes.lock().await.insert(
            handle.clone(),
            ScriptedSandbox {
                script: Some(script),
                output_rx: None,
                stdin_tx: None,
                task: None,
                exit_tx: Arc::new(exit_tx),
            },
        );
        Ok(handle)
    }

    async fn start(&self, handle: &SandboxHandle) -> SandboxResult<()> {
        self.enter(EngineOp::Start, handle.as_str())?;
        let mut sandboxes = self.sandboxes.lock().await;
        let sandbox = sandboxes
            .get_mut(handle)
            .ok_or_else(|| SandboxError::NotFound(handle.to_string()))?;
        let script = sandbox
            .script
            .take()
            .ok_or_else(|| SandboxError::operation("start", handle.as_str(), "already started"))?;

        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        sandbox.task = Some(tokio::spawn(play(
            handle.to_string(),
            script,
            frames_tx,
            stdin_rx,
            Arc::clone(&sandbox.exit_tx),
            Arc::clone(&self.ledger),
        )));
        sandbox.output_rx = Some(frames_rx);
        sandbox.stdin_tx = Some(stdin_tx);
        Ok(())
    }

    async fn attach(
        &self,
        handle: &SandboxHandle,
        options: AttachOptions,
    ) -> SandboxResult<AttachedIo> {
        self.enter(EngineOp::Attach, handle.as_str())?;
        let mut sandboxes = self.sandboxes.lock().await;
        let sandbox = sandboxes
            .get_mut(handle)
            .ok_or_else(|| SandboxError::NotFound(handle.to_string()))?;

        let output = if options.wants_output() {
            let frames = sandbox
                .output_rx
                .take()
                .ok_or_else(|| SandboxError::AlreadyAttached(handle.to_string()))?;
            Some(receiver_stream(frames))
        } else {
            None
        };
        let write_only = !options.wants_output();
        let input = if options.stdin && !(write_only && *lock(&self.deny_stdin)) {
            sandbox.stdin_tx.clone().map(stdin_relay)
        } else {
            None
        };
        Ok(AttachedIo { output, input })
    }

    async fn stop(&self, handle: &SandboxHandle, _grace: Duration) -> SandboxResult<()> {
        self.enter(EngineOp::Stop, handle.as_str())?;
        let delay = *lock(&self.stop_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut sandboxes = self.sandboxes.lock().await;
        let sandbox = sandboxes
            .get_mut(handle)
            .ok_or_else(|| SandboxError::NotFound(handle.to_string()))?;
        if let Some(task) = sandbox.task.take() {
            task.abort();
        }
        sandbox.stdin_tx = None;
        publish_exit(&sandbox.exit_tx, KILLED_EXIT_CODE);
        Ok(())
    }

    async fn remove(&self, handle: &SandboxHandle) -> SandboxResult<()> {
        self.enter(EngineOp::Remove, handle.as_str())?;
        let sandbox = self
            .sandboxes
            .lock()
            .await
            .remove(handle)
            .ok_or_else(|| SandboxError::NotFound(handle.to_string()))?;
        if let Some(task) = sandbox.task {
            task.abort();
        }
        publish_exit(&sandbox.exit_tx, KILLED_EXIT_CODE);
        *lock(&self.ledger)
            .removals
            .entry(handle.to_string())
            .or_default() += 1;
        Ok(())
    }

    async fn wait(&self, handle: &SandboxHandle) -> SandboxResult<ExitStatus> {
        self.enter(EngineOp::Wait, handle.as_str())?;
        let mut exit = {
            let sandboxes = self.sandboxes.lock().await;
            sandboxes
                .get(handle)
                .ok_or_else(|| SandboxError::NotFound(handle.to_string()))?
                .exit_tx
                .subscribe()
        };
        let status = exit
            .wait_for(Option::is_some)
            .await
            .map_err(|_| SandboxError::operation("wait", handle.as_str(), "sandbox dropped"))?;
        status.ok_or_else(|| SandboxError::operation("wait", handle.as_str(), "no exit status"))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
