//! One worker process per attempt, presented as structured events.
//!
//! `WorkerSession::start` spawns the worker in its own process group and hands
//! its stdout/stderr to reader tasks. The stdout reader owns the
//! `StreamParser` and sends decoded events over a bounded channel; `drive`
//! consumes them, races them against the stop token and the wall-clock
//! timeout, and tears the process tree down before returning.

use std::collections::VecDeque;
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::log::SessionLog;
use super::process;
use super::registry::PidRegistry;
use crate::checkpoint::CheckpointManager;
use crate::context::{ContextEstimate, RestartReason};
use crate::errors::WorkerError;
use crate::stream::{
    SessionEvent, StreamLineError, StreamParser, TokenStats, extract_progress_message, truncate_str,
};

/// Capacity of the reader-to-driver event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

const STDERR_TAIL_LINES: usize = 50;

/// Everything needed to launch one worker session.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub program: String,
    pub args: Vec<String>,
    pub workdir: PathBuf,
    pub env: Vec<(String, String)>,
    /// Written to the worker's stdin, which is then closed
    pub prompt: String,
    pub timeout: Duration,
    /// How long a SIGTERM'd tree gets before SIGKILL
    pub stop_grace: Duration,
    /// Raw stream lines are appended here when set
    pub log_path: Option<PathBuf>,
    /// Command prefix that marks an explicit progress signal
    pub progress_command: String,
    pub context: ContextEstimate,
    /// Whether a context-budget breach ends the session
    pub restart_enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Streaming,
    StopRequested,
    Terminating,
    Terminated,
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Completed { exit_code: i32 },
    TimedOut,
    ContextRestartRequested(RestartReason),
    Killed,
}

/// Cooperative stop for a running session. Cheap to clone.
#[derive(Debug, Clone)]
pub struct StopHandle {
    token: CancellationToken,
}

impl StopHandle {
    /// Ask the session to stop. The drive loop notices on its next wakeup,
    /// without waiting for the worker's next event.
    pub fn request_stop(&self) {
        self.token.cancel();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Callbacks for decoded worker activity. All default to no-ops.
pub trait SessionObserver {
    fn on_text(&mut self, _text: &str) {}
    fn on_tool_use(&mut self, _name: &str, _input: &Value) {}
    fn on_tool_result(
        &mut self,
        _tool_name: Option<&str>,
        _content: &str,
        _is_error: bool,
        _subagent: Option<&str>,
    ) {
    }
    fn on_token_stats(&mut self, _stats: &TokenStats, _is_final: bool) {}
    fn on_subagent_change(&mut self, _agent: Option<&str>) {}
    fn on_progress(&mut self, _message: &str) {}
    fn on_stderr(&mut self, _line: &str) {}
}

/// Observer that ignores everything.
pub struct NoopObserver;

impl SessionObserver for NoopObserver {}

/// Outcome and evidence of one finished session.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub termination: Termination,
    pub log: SessionLog,
    pub context: ContextEstimate,
    /// Authoritative totals from the `result` event, if one arrived
    pub final_usage: Option<TokenStats>,
    pub stderr_tail: Vec<String>,
    pub events_parsed: usize,
    pub malformed_lines: usize,
    pub duration: Duration,
    pub log_path: Option<PathBuf>,
}

impl SessionReport {
    /// Why this session counts as a worker failure, if it does.
    ///
    /// Stops (context restart or user) are not failures.
    pub fn failure_reason(&self) -> Option<String> {
        match self.termination {
            Termination::TimedOut => Some(format!(
                "worker timed out after {}s",
                self.duration.as_secs()
            )),
            Termination::Completed { exit_code } if exit_code != 0 => {
                let start = self.stderr_tail.len().saturating_sub(5);
                let stderr = self.stderr_tail[start..].join("\n");
                if stderr.is_empty() {
                    Some(format!("worker exited with code {}", exit_code))
                } else {
                    Some(format!("worker exited with code {}: {}", exit_code, stderr))
                }
            }
            Termination::Completed { .. } if self.events_parsed == 0 => Some(format!(
                "worker produced no parseable stream events ({} malformed line(s))",
                self.malformed_lines
            )),
            _ => None,
        }
    }
}

enum WorkerOutput {
    Events(String, Vec<SessionEvent>),
    Malformed(String, StreamLineError),
    Stderr(String),
}

pub struct WorkerSession {
    child: Child,
    pid: u32,
    registry: PidRegistry,
    stop: CancellationToken,
    rx: mpsc::Receiver<WorkerOutput>,
    tasks: Vec<JoinHandle<()>>,
    state: SessionState,
    started: Instant,
    timeout: Duration,
    stop_grace: Duration,
    progress_command: String,
    restart_enabled: bool,
    /// Prompt text not yet charged to the estimate (waits for the init window)
    uncounted_prompt: Option<String>,
    context: ContextEstimate,
    log: SessionLog,
    log_file: Option<std::io::BufWriter<std::fs::File>>,
    log_path: Option<PathBuf>,
    final_usage: Option<TokenStats>,
    stderr_tail: VecDeque<String>,
    events_parsed: usize,
    malformed_lines: usize,
    finished: bool,
}

impl WorkerSession {
    /// Spawn the worker and start reading its output.
    pub async fn start(spec: WorkerSpec, registry: PidRegistry) -> Result<Self, WorkerError> {
        let log_file = match &spec.log_path {
            Some(path) => Some(open_log(path)?),
            None => None,
        };

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.workdir)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        process::isolate_process_group(&mut cmd);

        let child = cmd.spawn().map_err(|source| WorkerError::SpawnFailed {
            program: spec.program.clone(),
            source,
        })?;
        let pid = child.id().unwrap_or(0);
        registry.register(pid);
        info!(pid, program = %spec.program, workdir = %spec.workdir.display(), "worker spawned");

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let mut context = spec.context;
        context.reset();

        let mut session = Self {
            child,
            pid,
            registry,
            stop: CancellationToken::new(),
            rx,
            tasks: Vec::new(),
            state: SessionState::Starting,
            started: Instant::now(),
            timeout: spec.timeout,
            stop_grace: spec.stop_grace,
            progress_command: spec.progress_command,
            restart_enabled: spec.restart_enabled,
            uncounted_prompt: Some(spec.prompt.clone()),
            context,
            log: SessionLog::default(),
            log_file,
            log_path: spec.log_path,
            final_usage: None,
            stderr_tail: VecDeque::new(),
            events_parsed: 0,
            malformed_lines: 0,
            finished: false,
        };

        // From here on, Drop cleans up the process tree on early return
        let stdout = session
            .child
            .stdout
            .take()
            .ok_or(WorkerError::MissingPipe("stdout"))?;
        let stderr = session
            .child
            .stderr
            .take()
            .ok_or(WorkerError::MissingPipe("stderr"))?;
        let stdin = session
            .child
            .stdin
            .take()
            .ok_or(WorkerError::MissingPipe("stdin"))?;

        session.tasks.push(tokio::spawn(read_stdout(stdout, tx.clone())));
        session.tasks.push(tokio::spawn(read_stderr(stderr, tx)));
        session
            .tasks
            .push(tokio::spawn(write_prompt(stdin, spec.prompt)));
        session.set_state(SessionState::Streaming);

        Ok(session)
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            token: self.stop.clone(),
        }
    }

    /// Shorthand for `stop_handle().request_stop()`.
    pub fn request_stop(&self) {
        self.stop.cancel();
    }

    fn set_state(&mut self, state: SessionState) {
        debug!(pid = self.pid, from = ?self.state, to = ?state, "worker session state");
        self.state = state;
    }

    /// Consume worker output until the session ends, then kill the tree.
    ///
    /// Returns only after the leader has been reaped and the process group
    /// has been signalled to death.
    pub async fn drive(
        &mut self,
        observer: &mut dyn SessionObserver,
        mut checkpoint: Option<&mut CheckpointManager>,
    ) -> Result<SessionReport, WorkerError> {
        let stop = self.stop.clone();
        let deadline = tokio::time::sleep(self.timeout.saturating_sub(self.started.elapsed()));
        tokio::pin!(deadline);

        let early = loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break Some(Termination::Killed),
                _ = &mut deadline => break Some(Termination::TimedOut),
                output = self.rx.recv() => match output {
                    Some(output) => {
                        if let Some(reason) =
                            self.handle_output(output, observer, checkpoint.as_deref_mut())
                        {
                            info!(
                                pid = self.pid,
                                reason = %reason,
                                context = %self.context.status_summary(),
                                "context budget reached, requesting restart"
                            );
                            break Some(Termination::ContextRestartRequested(reason));
                        }
                    }
                    None => break None,
                },
            }
        };

        let termination = match early {
            Some(termination) => {
                self.shut_down(termination).await;
                termination
            }
            // Both streams closed; the worker is exiting on its own
            None => {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => {
                        self.shut_down(Termination::Killed).await;
                        Termination::Killed
                    }
                    _ = &mut deadline => {
                        self.shut_down(Termination::TimedOut).await;
                        Termination::TimedOut
                    }
                    status = self.child.wait() => {
                        let status = status.map_err(WorkerError::Wait)?;
                        self.set_state(SessionState::Terminating);
                        process::reap_tree(self.pid, self.stop_grace).await;
                        Termination::Completed {
                            exit_code: status.code().unwrap_or(-1),
                        }
                    }
                }
            }
        };

        for task in &self.tasks {
            task.abort();
        }
        if let Some(file) = self.log_file.as_mut()
            && let Err(e) = file.flush()
        {
            debug!(error = %e, "failed to flush session log");
        }
        self.registry.unregister(self.pid);
        self.set_state(SessionState::Terminated);

        info!(
            pid = self.pid,
            termination = ?termination,
            events = self.events_parsed,
            tool_calls = self.context.tool_call_count(),
            context_pct = self.context.usage_percentage(),
            "worker session ended"
        );

        Ok(SessionReport {
            termination,
            log: std::mem::take(&mut self.log),
            context: self.context.clone(),
            final_usage: self.final_usage.take(),
            stderr_tail: self.stderr_tail.iter().cloned().collect(),
            events_parsed: self.events_parsed,
            malformed_lines: self.malformed_lines,
            duration: self.started.elapsed(),
            log_path: self.log_path.clone(),
        })
    }

    async fn shut_down(&mut self, termination: Termination) {
        if termination == Termination::Killed {
            self.set_state(SessionState::StopRequested);
        }
        self.set_state(SessionState::Terminating);
        let status = process::terminate_tree(&mut self.child, self.pid, self.stop_grace).await;
        debug!(pid = self.pid, status = ?status, "worker tree terminated");
    }

    /// Returns a restart reason when the context budget is exhausted.
    fn handle_output(
        &mut self,
        output: WorkerOutput,
        observer: &mut dyn SessionObserver,
        mut checkpoint: Option<&mut CheckpointManager>,
    ) -> Option<RestartReason> {
        match output {
            WorkerOutput::Events(raw, events) => {
                self.append_log(&raw);
                self.events_parsed += 1;
                for event in events {
                    self.handle_event(event, observer, checkpoint.as_deref_mut());
                }
            }
            WorkerOutput::Malformed(raw, error) => {
                self.append_log(&raw);
                self.malformed_lines += 1;
                warn!(pid = self.pid, error = %error, line = %truncate_str(&raw, 120), "skipping worker line");
            }
            WorkerOutput::Stderr(line) => {
                observer.on_stderr(&line);
                if self.stderr_tail.len() == STDERR_TAIL_LINES {
                    self.stderr_tail.pop_front();
                }
                self.stderr_tail.push_back(line);
            }
        }

        if self.restart_enabled && !self.finished {
            self.context.restart_reason()
        } else {
            None
        }
    }

    fn handle_event(
        &mut self,
        event: SessionEvent,
        observer: &mut dyn SessionObserver,
        checkpoint: Option<&mut CheckpointManager>,
    ) {
        if let SessionEvent::Init {
            context_window: Some(window),
            ..
        } = &event
            && self.context.set_window(*window)
        {
            debug!(window, "using worker-reported context window");
        }
        if let Some(prompt) = self.uncounted_prompt.take() {
            self.context.record_prompt(&prompt);
        }

        match event {
            SessionEvent::Init {
                session_id, model, ..
            } => {
                debug!(session_id = ?session_id, model = ?model, "worker session initialised");
            }
            SessionEvent::Text(text) => observer.on_text(&text),
            SessionEvent::ToolUse { name, input, .. } => {
                self.context.record_tool_call();
                self.log.record_tool_use(&name, &input);
                observer.on_tool_use(&name, &input);

                if name == "Bash"
                    && let Some(command) = input.get("command").and_then(|v| v.as_str())
                    && let Some(message) = extract_progress_message(command, &self.progress_command)
                {
                    debug!(progress = %message, "progress signal");
                    if let Some(cp) = checkpoint {
                        cp.record_progress(&message);
                    }
                    observer.on_progress(&message);
                    self.log.progress.push(message);
                }
            }
            SessionEvent::ToolResult {
                tool_name,
                content,
                is_error,
                subagent,
                ..
            } => {
                if tool_name.as_deref() == Some("Read") {
                    self.context.record_file_read(&content);
                } else {
                    self.context.record_tool_output(&content);
                }
                if let Some(agent) = &subagent {
                    self.log.record_subagent_result(agent);
                }
                observer.on_tool_result(
                    tool_name.as_deref(),
                    &content,
                    is_error,
                    subagent.as_deref(),
                );
            }
            SessionEvent::SubagentChanged(agent) => observer.on_subagent_change(agent.as_deref()),
            SessionEvent::Usage { stats, is_final } => {
                observer.on_token_stats(&stats, is_final);
                if is_final {
                    self.final_usage = Some(stats);
                }
            }
            SessionEvent::Finished {
                subtype,
                is_error,
                result,
            } => {
                debug!(subtype = %subtype, is_error, "worker reported result");
                self.finished = true;
                self.log.result_text = result;
                self.log.result_is_error = is_error;
            }
        }
    }

    fn append_log(&mut self, raw: &str) {
        if let Some(file) = self.log_file.as_mut()
            && let Err(e) = writeln!(file, "{}", raw)
        {
            debug!(error = %e, "failed to append to session log");
        }
    }
}

impl Drop for WorkerSession {
    fn drop(&mut self) {
        if self.state != SessionState::Terminated {
            process::kill_tree_now(self.pid);
            self.registry.unregister(self.pid);
            for task in &self.tasks {
                task.abort();
            }
        }
    }
}

fn open_log(path: &std::path::Path) -> Result<std::io::BufWriter<std::fs::File>, WorkerError> {
    let open = || -> std::io::Result<std::fs::File> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
    };
    open()
        .map(std::io::BufWriter::new)
        .map_err(|source| WorkerError::SessionLog {
            path: path.to_path_buf(),
            source,
        })
}

async fn read_stdout(stdout: ChildStdout, tx: mpsc::Sender<WorkerOutput>) {
    let mut parser = StreamParser::new();
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "worker stdout read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let output = match parser.parse_line(&line) {
            Ok(events) => WorkerOutput::Events(line, events),
            Err(e) => WorkerOutput::Malformed(line, e),
        };
        if tx.send(output).await.is_err() {
            break;
        }
    }
}

async fn read_stderr(stderr: ChildStderr, tx: mpsc::Sender<WorkerOutput>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(WorkerOutput::Stderr(line)).await.is_err() {
            break;
        }
    }
}

async fn write_prompt(mut stdin: ChildStdin, prompt: String) {
    let result = async {
        stdin.write_all(prompt.as_bytes()).await?;
        stdin.shutdown().await
    }
    .await;
    match result {
        Ok(()) => debug!(chars = prompt.len(), "prompt written to worker stdin"),
        Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
            debug!("worker closed stdin before reading the whole prompt");
        }
        Err(e) => warn!(error = %e, "failed to write prompt to worker stdin"),
    }
}
