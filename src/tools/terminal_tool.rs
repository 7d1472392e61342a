use crate::config::Config;
use crate::error::AppError;
use crate::tools::output_buffer::{LineSplitter, OutputBuffer};
use crate::utils::path_utils::validate_path_access;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio as StdProcessStdio;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command as TokioCommand};
use tokio::sync::{oneshot, watch, Mutex as TokioMutex};
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

const DEFAULT_WAIT_TIMEOUT_SECS: f64 = 30.0;
const DEFAULT_MAX_LINES: usize = 1000;
const SNAPSHOT_LINES: usize = 5;
const READ_CHUNK_BYTES: usize = 8192;

#[derive(Debug, Deserialize)]
pub struct CreateTerminalParams {
    pub shell: Option<String>,
    pub workdir: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub description: Option<String>,
    pub initial_command: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TerminalInputParams {
    pub terminal_id: String,
    pub input: String,
    pub wait_timeout: Option<f64>,
    pub max_lines: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ReadTerminalOutputParams {
    pub terminal_id: String,
    pub wait_timeout: Option<f64>,
    pub max_lines: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct CloseTerminalParams {
    pub terminal_id: String,
}

#[derive(Debug, Serialize)]
pub struct CreateTerminalResult {
    pub terminal_id: String,
}

/// Outcome of one read window. At most one of `truncated`, `timeout`,
/// `no_new_output_timeout` and `no_new_output` is set.
#[derive(Debug, Default, Serialize)]
pub struct TerminalReadResult {
    pub output: String,
    pub line_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truncated: Option<bool>,
    pub has_new_output: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub no_new_output_timeout: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub no_new_output: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lines_dropped: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct CloseTerminalResult {
    pub success: bool,
}

#[derive(Debug, Serialize)]
pub struct TerminalSummary {
    pub terminal_id: String,
    pub pid: Option<u32>,
    pub workdir: String,
    pub shell: String,
    pub description: Option<String>,
    pub created_at: String,
    pub last_activity: String,
    pub is_running: bool,
}

#[derive(Debug, Serialize)]
pub struct ListTerminalsResult {
    pub terminals: Vec<TerminalSummary>,
    pub count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ProcessState {
    Running,
    Exited(Option<i32>),
}

/// Which condition ended a read window without hitting the line cap.
#[derive(Debug, Clone, Copy, PartialEq)]
enum WindowEnd {
    Idle,
    Deadline,
}

#[derive(Debug)]
struct TerminalSession {
    id: String,
    pid: Option<u32>,
    workdir: PathBuf,
    shell: String,
    description: Option<String>,
    created_at: DateTime<Utc>,
    last_activity: TokioMutex<DateTime<Utc>>,
    stdin: TokioMutex<Option<ChildStdin>>,
    output_buffer: Arc<TokioMutex<OutputBuffer>>,
    // Owning the cursor is what serializes reads: the guard is held for the whole window.
    read_cursor: TokioMutex<u64>,
    state_rx: watch::Receiver<ProcessState>,
    // Dropping the sender also kills the process.
    kill_tx: std::sync::Mutex<Option<oneshot::Sender<()>>>,
}

impl TerminalSession {
    fn exit_state(&self) -> Option<Option<i32>> {
        match *self.state_rx.borrow() {
            ProcessState::Running => None,
            ProcessState::Exited(code) => Some(code),
        }
    }

    async fn touch(&self) {
        *self.last_activity.lock().await = Utc::now();
    }

    fn request_kill(&self) {
        let sender = match self.kill_tx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        match sender {
            Some(tx) => {
                if tx.send(()).is_err() {
                    debug!(terminal_id = %self.id, "Process monitor already finished; nothing to kill");
                }
            }
            None => debug!(terminal_id = %self.id, "Kill already requested"),
        }
    }
}

fn shell_args(shell: &str) -> &'static [&'static str] {
    let lower = shell.to_lowercase();
    if lower.contains("powershell") || lower.contains("pwsh") {
        &["-NoLogo", "-NoProfile", "-Command", "-"]
    } else {
        &[]
    }
}

/// Appends everything read from `reader` to `buffer` until EOF, one chunk at a time.
async fn pump_output<R>(mut reader: R, buffer: Arc<TokioMutex<OutputBuffer>>, terminal_id: String, stream: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut chunk = vec![0u8; READ_CHUNK_BYTES];
    let mut splitter = LineSplitter::default();
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                let lines = splitter.split(&chunk[..n]);
                let mut buffer = buffer.lock().await;
                for line in lines {
                    buffer.push(line);
                }
            }
            Err(e) => {
                warn!(terminal_id = %terminal_id, stream, error = %e, "Failed reading terminal output");
                break;
            }
        }
    }
    debug!(terminal_id = %terminal_id, stream, "Output stream closed");
}

/// Kills the shell together with any job it started. The shell leads its own process group.
#[cfg(unix)]
fn kill_process_tree(child: &mut Child) -> std::io::Result<()> {
    let Some(pid) = child.id() else {
        return Ok(());
    };
    let pgid = libc::pid_t::try_from(pid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("pid {} out of range", pid)))?;
    // SAFETY: a negative pid addresses the process group created for this shell at spawn.
    if unsafe { libc::kill(-pgid, libc::SIGKILL) } == 0 {
        return Ok(());
    }
    let group_error = std::io::Error::last_os_error();
    debug!(pid, error = %group_error, "Process group kill failed, killing the shell only");
    child.start_kill()
}

#[cfg(not(unix))]
fn kill_process_tree(child: &mut Child) -> std::io::Result<()> {
    child.start_kill()
}

/// Owns the child: reports its exit, or kills and reaps it when asked (or when the session is dropped).
async fn monitor_process(
    mut child: Child,
    mut kill_rx: oneshot::Receiver<()>,
    state_tx: watch::Sender<ProcessState>,
    terminal_id: String,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = &mut kill_rx => {
            if let Err(e) = kill_process_tree(&mut child) {
                warn!(terminal_id = %terminal_id, error = %e, "Failed to kill terminal process");
            }
            child.wait().await
        }
    };
    let code = match status {
        Ok(status) => {
            info!(terminal_id = %terminal_id, exit_code = ?status.code(), "Terminal process exited");
            status.code()
        }
        Err(e) => {
            warn!(terminal_id = %terminal_id, error = %e, "Failed to wait for terminal process");
            None
        }
    };
    state_tx.send_replace(ProcessState::Exited(code));
}

fn validate_read_args(wait_timeout: Option<f64>, max_lines: Option<usize>) -> Result<(Duration, usize), AppError> {
    let secs = wait_timeout.unwrap_or(DEFAULT_WAIT_TIMEOUT_SECS);
    if !secs.is_finite() || secs <= 0.0 {
        return Err(AppError::InvalidInputArgument(format!(
            "wait_timeout must be a positive number of seconds, got {}",
            secs
        )));
    }
    let max_lines = max_lines.unwrap_or(DEFAULT_MAX_LINES);
    if max_lines == 0 {
        return Err(AppError::InvalidInputArgument("max_lines must be at least 1".to_string()));
    }
    Ok((Duration::from_secs_f64(secs), max_lines))
}

#[derive(Debug)]
pub struct TerminalManager {
    config: Arc<Config>,
    sessions: Arc<TokioMutex<HashMap<String, Arc<TerminalSession>>>>,
}

impl TerminalManager {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            sessions: Arc::new(TokioMutex::new(HashMap::new())),
        }
    }

    fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.config.terminal_idle_timeout_ms)
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.terminal_poll_interval_ms.max(1))
    }

    #[instrument(skip(self, params), fields(shell = ?params.shell, workdir = ?params.workdir))]
    pub async fn create_terminal(&self, params: &CreateTerminalParams) -> Result<CreateTerminalResult, AppError> {
        let workdir_str = params
            .workdir
            .clone()
            .unwrap_or_else(|| self.config.files_root.to_string_lossy().into_owned());
        let workdir = validate_path_access(&workdir_str, &self.config, true)
            .map_err(|e| AppError::InvalidWorkdir(e.to_string()))?;
        if !workdir.is_dir() {
            return Err(AppError::InvalidWorkdir(format!("Not a directory: {}", workdir.display())));
        }
        let shell = self.config.resolve_shell(params.shell.as_deref());

        let session = {
            let mut sessions = self.sessions.lock().await;
            if sessions.len() >= self.config.max_terminals {
                warn!(max = self.config.max_terminals, "Terminal limit reached");
                return Err(AppError::CapacityExceeded(self.config.max_terminals));
            }

            let mut command = TokioCommand::new(&shell);
            command
                .args(shell_args(&shell))
                .current_dir(&workdir)
                .envs(&params.env)
                .stdin(StdProcessStdio::piped())
                .stdout(StdProcessStdio::piped())
                .stderr(StdProcessStdio::piped())
                .kill_on_drop(true);
            #[cfg(unix)]
            command.process_group(0);

            let mut child = command.spawn().map_err(|e| {
                error!(error = %e, shell = %shell, "Failed to spawn terminal shell");
                AppError::CommandExecutionError(format!("Failed to spawn shell '{}': {}", shell, e))
            })?;

            let terminal_id = Uuid::new_v4().to_string();
            let pid = child.id();
            let output_buffer = Arc::new(TokioMutex::new(OutputBuffer::new(self.config.terminal_buffer_lines)));

            if let Some(stdout) = child.stdout.take() {
                tokio::spawn(pump_output(stdout, output_buffer.clone(), terminal_id.clone(), "stdout"));
            }
            if let Some(stderr) = child.stderr.take() {
                tokio::spawn(pump_output(stderr, output_buffer.clone(), terminal_id.clone(), "stderr"));
            }
            let stdin = child.stdin.take();

            let (state_tx, state_rx) = watch::channel(ProcessState::Running);
            let (kill_tx, kill_rx) = oneshot::channel();
            tokio::spawn(monitor_process(child, kill_rx, state_tx, terminal_id.clone()));

            let now = Utc::now();
            let session = Arc::new(TerminalSession {
                id: terminal_id.clone(),
                pid,
                workdir: workdir.clone(),
                shell: shell.clone(),
                description: params.description.clone(),
                created_at: now,
                last_activity: TokioMutex::new(now),
                stdin: TokioMutex::new(stdin),
                output_buffer,
                read_cursor: TokioMutex::new(0),
                state_rx,
                kill_tx: std::sync::Mutex::new(Some(kill_tx)),
            });
            sessions.insert(terminal_id, session.clone());
            session
        };

        info!(terminal_id = %session.id, pid = ?session.pid, shell = %session.shell, workdir = %session.workdir.display(), "Terminal created");

        if let Some(initial_command) = params.initial_command.as_deref().filter(|c| !c.is_empty()) {
            if let Err(e) = self.write_line(&session, initial_command).await {
                warn!(terminal_id = %session.id, error = %e, "Failed to send initial command");
            }
        }

        Ok(CreateTerminalResult { terminal_id: session.id.clone() })
    }

    /// Looks up a session, evicting it if its process has exited.
    async fn live_session(&self, terminal_id: &str) -> Result<Arc<TerminalSession>, AppError> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get(terminal_id)
            .cloned()
            .ok_or_else(|| AppError::SessionNotFound(terminal_id.to_string()))?;
        if let Some(code) = session.exit_state() {
            sessions.remove(terminal_id);
            warn!(terminal_id = %terminal_id, exit_code = ?code, "Evicted terminated terminal session");
            return Err(terminated_error(terminal_id, code));
        }
        Ok(session)
    }

    async fn evict(&self, terminal_id: &str) {
        if self.sessions.lock().await.remove(terminal_id).is_some() {
            warn!(terminal_id = %terminal_id, "Evicted terminal session with closed input");
        }
    }

    async fn write_line(&self, session: &TerminalSession, text: &str) -> Result<(), AppError> {
        let mut stdin_guard = session.stdin.lock().await;
        let stdin = stdin_guard
            .as_mut()
            .ok_or_else(|| AppError::SessionTerminated(format!("{} has no input stream", session.id)))?;
        let mut payload = String::with_capacity(text.len() + 1);
        payload.push_str(text);
        payload.push('\n');
        stdin.write_all(payload.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    #[instrument(skip(self, params), fields(terminal_id = %params.terminal_id))]
    pub async fn send_input(&self, params: &TerminalInputParams) -> Result<TerminalReadResult, AppError> {
        let (wait_timeout, max_lines) = validate_read_args(params.wait_timeout, params.max_lines)?;
        let session = self.live_session(&params.terminal_id).await?;
        session.touch().await;

        if let Err(e) = self.write_line(&session, &params.input).await {
            let closed = match &e {
                AppError::StdIoError(io) => io.kind() == std::io::ErrorKind::BrokenPipe,
                AppError::SessionTerminated(_) => true,
                _ => false,
            };
            if closed {
                self.evict(&session.id).await;
                return Err(terminated_error(&session.id, session.exit_state().flatten()));
            }
            return Err(e);
        }
        debug!(bytes = params.input.len() + 1, "Input written");

        Ok(self.read_window(&session, wait_timeout, max_lines).await)
    }

    #[instrument(skip(self, params), fields(terminal_id = %params.terminal_id))]
    pub async fn read_output(&self, params: &ReadTerminalOutputParams) -> Result<TerminalReadResult, AppError> {
        let (wait_timeout, max_lines) = validate_read_args(params.wait_timeout, params.max_lines)?;
        let session = self.live_session(&params.terminal_id).await?;
        Ok(self.read_window(&session, wait_timeout, max_lines).await)
    }

    /// Waits for output until the line cap, the idle timeout or the absolute timeout, whichever comes first.
    async fn read_window(&self, session: &TerminalSession, wait_timeout: Duration, max_lines: usize) -> TerminalReadResult {
        let mut cursor = session.read_cursor.lock().await;
        session.touch().await;

        let started = Instant::now();
        let deadline = started + wait_timeout;
        let idle_timeout = self.idle_timeout();
        let poll_interval = self.poll_interval();

        let mut last_growth = started;
        let mut seen_end = session.output_buffer.lock().await.end_seq();

        let end = loop {
            {
                let buffer = session.output_buffer.lock().await;
                if buffer.pending_since(*cursor) >= max_lines {
                    let chunk = buffer.read_from(*cursor, max_lines);
                    *cursor = chunk.next_seq;
                    drop(buffer);
                    debug!(terminal_id = %session.id, lines = chunk.lines.len(), "Read window hit line cap");
                    return TerminalReadResult {
                        output: chunk.lines.join("\n"),
                        line_count: chunk.lines.len(),
                        truncated: Some(true),
                        has_new_output: true,
                        lines_dropped: (chunk.dropped > 0).then_some(chunk.dropped),
                        ..Default::default()
                    };
                }
                let end_seq = buffer.end_seq();
                if end_seq > seen_end {
                    seen_end = end_seq;
                    last_growth = Instant::now();
                }
            }

            let now = Instant::now();
            let idle_at = last_growth + idle_timeout;
            if now >= idle_at || now >= deadline {
                let end = if idle_at <= deadline { WindowEnd::Idle } else { WindowEnd::Deadline };
                break end;
            }
            sleep_until(idle_at.min(deadline).min(now + poll_interval)).await;
        };

        let buffer = session.output_buffer.lock().await;
        let chunk = buffer.read_from(*cursor, max_lines);
        let lines_dropped = (chunk.dropped > 0).then_some(chunk.dropped);

        if chunk.lines.is_empty() {
            let snapshot = buffer.tail(SNAPSHOT_LINES);
            drop(buffer);
            debug!(terminal_id = %session.id, ?end, "Read window ended without new output");
            let mut result = TerminalReadResult {
                line_count: snapshot.len(),
                output: snapshot.join("\n"),
                has_new_output: false,
                lines_dropped,
                ..Default::default()
            };
            match end {
                WindowEnd::Idle => result.no_new_output = Some(true),
                WindowEnd::Deadline => result.timeout = Some(true),
            }
            return result;
        }

        *cursor = chunk.next_seq;
        drop(buffer);
        debug!(terminal_id = %session.id, ?end, lines = chunk.lines.len(), "Read window collected output");
        let mut result = TerminalReadResult {
            output: chunk.lines.join("\n"),
            line_count: chunk.lines.len(),
            has_new_output: true,
            lines_dropped,
            ..Default::default()
        };
        match end {
            WindowEnd::Idle => result.no_new_output_timeout = Some(true),
            WindowEnd::Deadline => result.timeout = Some(true),
        }
        result
    }

    #[instrument(skip(self, params), fields(terminal_id = %params.terminal_id))]
    pub async fn close_terminal(&self, params: &CloseTerminalParams) -> Result<CloseTerminalResult, AppError> {
        let session = self
            .sessions
            .lock()
            .await
            .remove(&params.terminal_id)
            .ok_or_else(|| AppError::SessionNotFound(params.terminal_id.clone()))?;
        session.request_kill();
        info!(terminal_id = %session.id, pid = ?session.pid, "Terminal closed");
        Ok(CloseTerminalResult { success: true })
    }

    #[instrument(skip(self))]
    pub async fn list_terminals(&self) -> Result<ListTerminalsResult, AppError> {
        let sessions: Vec<Arc<TerminalSession>> = self.sessions.lock().await.values().cloned().collect();
        let mut terminals = Vec::with_capacity(sessions.len());
        for session in &sessions {
            let last_activity = *session.last_activity.lock().await;
            terminals.push((
                session.created_at,
                TerminalSummary {
                    terminal_id: session.id.clone(),
                    pid: session.pid,
                    workdir: session.workdir.to_string_lossy().into_owned(),
                    shell: session.shell.clone(),
                    description: session.description.clone(),
                    created_at: session.created_at.to_rfc3339(),
                    last_activity: last_activity.to_rfc3339(),
                    is_running: session.exit_state().is_none(),
                },
            ));
        }
        terminals.sort_by(|a, b| a.0.cmp(&b.0));
        let terminals: Vec<TerminalSummary> = terminals.into_iter().map(|(_, summary)| summary).collect();
        Ok(ListTerminalsResult { count: terminals.len(), terminals })
    }

    /// Kills every tracked session.
    pub async fn close_all(&self) {
        let drained: Vec<Arc<TerminalSession>> = self.sessions.lock().await.drain().map(|(_, s)| s).collect();
        for session in drained {
            session.request_kill();
            info!(terminal_id = %session.id, "Terminal closed at shutdown");
        }
    }
}

fn terminated_error(terminal_id: &str, code: Option<i32>) -> AppError {
    match code {
        Some(code) => AppError::SessionTerminated(format!("{} (process exited with code {})", terminal_id, code)),
        None => AppError::SessionTerminated(format!("{} (process exited)", terminal_id)),
    }
}
