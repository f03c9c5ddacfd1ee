// Debuggee process management
//
// Starts the debuggee, drains its stdout/stderr on dedicated tasks (relaying
// each line through tracing and keeping a copy for failure reports), waits for
// its ready sentinel and observes its exit code.

use crate::protocol::{HarnessError, HarnessResult};
use crate::suspend::SuspendState;
use crate::sync::lock;
use serde::Serialize;
use std::collections::VecDeque;
use std::ffi::OsStr;
use std::fmt;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Exit status a debuggee reports when its checks passed
pub const STATUS_BASE: i32 = 95;
pub const PASSED: i32 = 0;
pub const FAILED: i32 = 2;

/// Default prefix of the line a debuggee prints once its transport listens
pub const DEFAULT_READY_SENTINEL: &str = "Listening for transport";

const MAX_CAPTURED_LINES: usize = 10_000;
const KILL_GRACE: Duration = Duration::from_secs(2);
const DRAIN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProcessState {
    Starting,
    Connected,
    Running,
    Exited,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputStream {
    Stdout,
    Stderr,
}

/// Everything the debuggee printed, attached to process-level failures.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CapturedOutput {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

impl CapturedOutput {
    pub fn is_empty(&self) -> bool {
        self.stdout.is_empty() && self.stderr.is_empty()
    }
}

impl fmt::Display for CapturedOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, lines) in [("stdout", &self.stdout), ("stderr", &self.stderr)] {
            if lines.is_empty() {
                continue;
            }
            write!(f, "\n--- debuggee {} ---", name)?;
            for line in lines {
                write!(f, "\n{}", line)?;
            }
        }
        Ok(())
    }
}

/// Observed exit of a debuggee.
#[derive(Debug, Clone, Serialize)]
pub struct ExitStatus {
    pub code: Option<i32>,
    pub output: CapturedOutput,
}

impl ExitStatus {
    pub fn passed(&self) -> bool {
        self.code == Some(STATUS_BASE + PASSED)
    }

    /// Anything but the pass status is a failure carrying the captured output.
    pub fn check(&self) -> HarnessResult<()> {
        if self.passed() {
            return Ok(());
        }
        Err(HarnessError::UnexpectedExit {
            code: self.code,
            expected: STATUS_BASE + PASSED,
            output: self.output.clone(),
        })
    }
}

#[derive(Default)]
struct Lines {
    stdout: VecDeque<String>,
    stderr: VecDeque<String>,
}

struct OutputLog {
    lines: Mutex<Lines>,
    tx: broadcast::Sender<String>,
}

impl OutputLog {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self {
            lines: Mutex::new(Lines::default()),
            tx,
        }
    }

    fn push(&self, stream: OutputStream, line: String) {
        {
            let mut lines = lock(&self.lines, "output push");
            let buf = match stream {
                OutputStream::Stdout => &mut lines.stdout,
                OutputStream::Stderr => &mut lines.stderr,
            };
            if buf.len() == MAX_CAPTURED_LINES {
                buf.pop_front();
            }
            buf.push_back(line.clone());
        }
        // No receivers is fine
        self.tx.send(line).ok();
    }

    fn find(&self, predicate: &impl Fn(&str) -> bool) -> Option<String> {
        let lines = lock(&self.lines, "output find");
        lines
            .stdout
            .iter()
            .chain(lines.stderr.iter())
            .find(|line| predicate(line))
            .cloned()
    }

    fn snapshot(&self) -> CapturedOutput {
        let lines = lock(&self.lines, "output snapshot");
        CapturedOutput {
            stdout: lines.stdout.iter().cloned().collect(),
            stderr: lines.stderr.iter().cloned().collect(),
        }
    }
}

fn spawn_drain<R>(reader: R, stream: OutputStream, log: Arc<OutputLog>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\n', '\r'])
                        .to_string();
                    match stream {
                        OutputStream::Stdout => info!(target: "debuggee::stdout", "{}", line),
                        OutputStream::Stderr => info!(target: "debuggee::stderr", "{}", line),
                    }
                    log.push(stream, line);
                }
                Err(e) => {
                    warn!("Failed to read debuggee {:?}: {}", stream, e);
                    break;
                }
            }
        }
    })
}

/// Extract the port from a sentinel such as
/// `Listening for transport dt_socket at address: 5005`.
pub fn parse_listen_port(line: &str) -> Option<u16> {
    let (_, address) = line.rsplit_once("address:")?;
    let address = address.trim();
    let port = address.rsplit_once(':').map_or(address, |(_, port)| port);
    port.parse().ok()
}

/// A running (or finished) debuggee.
pub struct DebuggeeProcess {
    command: String,
    pid: Option<u32>,
    child: tokio::sync::Mutex<Child>,
    state: Mutex<ProcessState>,
    output: Arc<OutputLog>,
    drains: Mutex<Vec<JoinHandle<()>>>,
    suspend: Arc<SuspendState>,
    ready_sentinel: String,
}

impl fmt::Debug for DebuggeeProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebuggeeProcess")
            .field("command", &self.command)
            .field("pid", &self.pid)
            .field("state", &self.state())
            .finish()
    }
}

impl DebuggeeProcess {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn state(&self) -> ProcessState {
        *lock(&self.state, "process state")
    }

    /// Suspend bookkeeping for this debuggee, shared with its session.
    pub fn suspend_state(&self) -> &Arc<SuspendState> {
        &self.suspend
    }

    /// Output captured so far.
    pub fn output(&self) -> CapturedOutput {
        self.output.snapshot()
    }

    fn transition(&self, from: &[ProcessState], to: ProcessState) -> HarnessResult<()> {
        let mut state = lock(&self.state, "process transition");
        if !from.contains(&state) {
            return Err(HarnessError::InvalidState { from: *state, to });
        }
        info!("Debuggee {:?} -> {:?}", *state, to);
        *state = to;
        Ok(())
    }

    fn fail(&self) {
        let mut state = lock(&self.state, "process fail");
        if *state != ProcessState::Exited {
            *state = ProcessState::Failed;
        }
    }

    /// Handshake complete: commands may now be sent.
    pub fn mark_connected(&self) -> HarnessResult<()> {
        self.transition(&[ProcessState::Starting], ProcessState::Connected)
    }

    /// The debuggee has been resumed.
    pub fn mark_running(&self) -> HarnessResult<()> {
        self.transition(&[ProcessState::Connected], ProcessState::Running)
    }

    /// Wait for a stdout/stderr line matching `predicate`. Lines printed
    /// before the call count too.
    pub async fn wait_for_line<P>(&self, predicate: P, timeout: Duration) -> HarnessResult<String>
    where
        P: Fn(&str) -> bool,
    {
        // Subscribe before scanning so no line slips between the two
        let mut rx = self.output.tx.subscribe();
        if let Some(line) = self.output.find(&predicate) {
            return Ok(line);
        }

        let deadline = tokio::time::Instant::now() + timeout;
        let mut child = self.child.lock().await;
        loop {
            tokio::select! {
                line = rx.recv() => match line {
                    Ok(line) if predicate(&line) => return Ok(line),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if let Some(line) = self.output.find(&predicate) {
                            return Ok(line);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(HarnessError::Protocol("Output relay closed".to_string()));
                    }
                },
                status = child.wait() => {
                    let code = status?.code();
                    drop(child);
                    self.join_drains().await;
                    if let Some(line) = self.output.find(&predicate) {
                        return Ok(line);
                    }
                    return Err(HarnessError::ExitedEarly {
                        code,
                        output: self.output.snapshot(),
                    });
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(HarnessError::timeout("debuggee output", timeout));
                }
            }
        }
    }

    /// Wait for the ready sentinel and return the transport port it names.
    pub async fn wait_ready(&self, timeout: Duration) -> HarnessResult<Option<u16>> {
        let sentinel = self.ready_sentinel.clone();
        let result = self
            .wait_for_line(move |line| line.contains(sentinel.as_str()), timeout)
            .await;

        match result {
            Ok(line) => {
                let port = parse_listen_port(&line);
                debug!("Debuggee ready: {:?} (port {:?})", line, port);
                Ok(port)
            }
            Err(HarnessError::Timeout { .. }) => {
                self.fail();
                Err(HarnessError::HandshakeTimeout {
                    after: timeout,
                    output: self.output.snapshot(),
                })
            }
            Err(e) => {
                self.fail();
                Err(e)
            }
        }
    }

    async fn join_drains(&self) {
        let drains = std::mem::take(&mut *lock(&self.drains, "join drains"));
        for mut drain in drains {
            if tokio::time::timeout(DRAIN_GRACE, &mut drain).await.is_err() {
                // A grandchild may still hold the pipe open
                warn!("Debuggee output drain did not finish; abandoning it");
                drain.abort();
            }
        }
    }
}

/// Starts debuggees and observes their lifecycle.
#[derive(Debug, Clone)]
pub struct ProcessHarness {
    ready_sentinel: String,
}

impl Default for ProcessHarness {
    fn default() -> Self {
        Self::new(DEFAULT_READY_SENTINEL)
    }
}

impl ProcessHarness {
    pub fn new(ready_sentinel: impl Into<String>) -> Self {
        Self {
            ready_sentinel: ready_sentinel.into(),
        }
    }

    /// Spawn the debuggee with piped output. The child is killed if its
    /// handle is dropped.
    pub fn start<I, K, V>(
        &self,
        command: &str,
        args: &[String],
        env: I,
    ) -> HarnessResult<DebuggeeProcess>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        info!("Starting debuggee: {} {}", command, args.join(" "));

        let mut child = Command::new(command)
            .args(args)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| HarnessError::Spawn {
                command: command.to_string(),
                source,
            })?;

        let output = Arc::new(OutputLog::new());
        let mut drains = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            drains.push(spawn_drain(stdout, OutputStream::Stdout, output.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            drains.push(spawn_drain(stderr, OutputStream::Stderr, output.clone()));
        }

        let pid = child.id();
        debug!("Debuggee pid {:?}", pid);

        Ok(DebuggeeProcess {
            command: command.to_string(),
            pid,
            child: tokio::sync::Mutex::new(child),
            state: Mutex::new(ProcessState::Starting),
            output,
            drains: Mutex::new(drains),
            suspend: Arc::new(SuspendState::new()),
            ready_sentinel: self.ready_sentinel.clone(),
        })
    }

    /// Wait for the debuggee to exit. On timeout it is killed and the wait
    /// fails; output draining continues throughout.
    pub async fn wait_for(
        &self,
        process: &DebuggeeProcess,
        timeout: Duration,
    ) -> HarnessResult<ExitStatus> {
        let status = {
            let mut child = process.child.lock().await;
            match tokio::time::timeout(timeout, child.wait()).await {
                Ok(status) => status?,
                Err(_) => {
                    warn!("Debuggee did not exit within {:?}; killing it", timeout);
                    child.start_kill().ok();
                    tokio::time::timeout(KILL_GRACE, child.wait()).await.ok();
                    drop(child);
                    process.join_drains().await;
                    process.fail();
                    return Err(HarnessError::timeout("debuggee exit", timeout));
                }
            }
        };

        process.join_drains().await;
        *lock(&process.state, "process exited") = ProcessState::Exited;

        let exit = ExitStatus {
            code: status.code(),
            output: process.output.snapshot(),
        };
        info!("Debuggee exited with {:?}", exit.code);
        Ok(exit)
    }

    /// Kill the debuggee and reap it.
    pub async fn kill(&self, process: &DebuggeeProcess) -> HarnessResult<()> {
        let mut child = process.child.lock().await;
        if child.try_wait()?.is_none() {
            info!("Killing debuggee {:?}", process.pid);
            child.start_kill()?;
            tokio::time::timeout(KILL_GRACE, child.wait())
                .await
                .map_err(|_| HarnessError::timeout("killed debuggee to exit", KILL_GRACE))??;
        }
        drop(child);
        process.join_drains().await;
        process.fail();
        Ok(())
    }
}
