// Test harness composition
//
// Holds one debuggee: its process, its signal pipe and its command session.
// Test bodies are plain async functions taking the harness by reference.

use crate::config::HarnessConfig;
use crate::events::{Event, EventKind};
use crate::iopipe::{IoPipe, IoPipeListener, Signal};
use crate::process::{DebuggeeProcess, ExitStatus, ProcessHarness, ProcessState};
use crate::protocol::{HarnessError, HarnessResult};
use crate::session::CommandSession;
use crate::transport::Transport;
use std::future::Future;
use std::pin::Pin;
use tracing::{error, info, warn};

/// Future returned by a test body.
pub type TestBody<'a> = Pin<Box<dyn Future<Output = HarnessResult<()>> + Send + 'a>>;

pub struct TestHarness {
    config: HarnessConfig,
    processes: ProcessHarness,
    process: DebuggeeProcess,
    session: CommandSession,
    listener: Option<IoPipeListener>,
    pipe: Option<IoPipe>,
}

impl std::fmt::Debug for TestHarness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestHarness")
            .field("process", &self.process)
            .field("session", &self.session)
            .field("pipe", &self.pipe)
            .finish()
    }
}

fn is_vm_start(event: &Event) -> bool {
    matches!(event.details, EventKind::VMStart { .. })
}

impl TestHarness {
    /// Start the debuggee and bring it to `Connected`.
    ///
    /// The pipe listener is bound first and its port passed as
    /// `-pipe.port=N`. The transport is attached only after the ready
    /// sentinel. A suspended debuggee is connected once VM_START arrives; a
    /// running one once it says `ready` on the pipe.
    pub async fn launch(config: HarnessConfig) -> HarnessResult<Self> {
        config.validate()?;
        let command = config
            .debuggee
            .command
            .clone()
            .ok_or_else(|| HarnessError::Config("No debuggee command configured".to_string()))?;

        let listener = IoPipeListener::bind(&config.pipe.host, config.pipe.port)
            .await?
            .with_max_line_length(config.pipe.max_line_length);
        let pipe_port = listener.local_addr()?.port();

        let mut args = config.debuggee.args.clone();
        args.push(format!("-pipe.port={}", pipe_port));

        let processes = ProcessHarness::new(config.debuggee.ready_sentinel.clone());
        let process = processes.start(&command, &args, &config.debuggee.env)?;

        let session = match Self::attach(&config, &process).await {
            Ok(session) => session,
            Err(e) => {
                error!("Debuggee launch failed: {}", e);
                processes.kill(&process).await.ok();
                return Err(e);
            }
        };

        let mut harness = Self {
            config,
            processes,
            process,
            session,
            listener: Some(listener),
            pipe: None,
        };

        let connected = if harness.config.debuggee.suspended_start {
            harness
                .session
                .dispatcher()
                .wait_event(is_vm_start, harness.config.handshake_timeout())
                .await
                .map(|event| info!("VM started (thread {:?})", event.thread()))
        } else {
            harness.pipe_handshake().await
        };

        if let Err(e) = connected.and_then(|_| harness.process.mark_connected()) {
            error!("Debuggee handshake failed: {}", e);
            harness.teardown().await;
            return Err(e);
        }
        Ok(harness)
    }

    async fn attach(config: &HarnessConfig, process: &DebuggeeProcess) -> HarnessResult<CommandSession> {
        let announced = process.wait_ready(config.handshake_timeout()).await?;
        let port = config.transport.port.or(announced).ok_or_else(|| {
            HarnessError::Config("Debuggee did not announce a transport port".to_string())
        })?;

        let transport = Transport::connect(
            format!("{}:{}", config.transport.host, port),
            config.handshake_timeout(),
            config.transport.max_packet_size,
        )
        .await?;

        Ok(CommandSession::start(
            transport,
            process.suspend_state().clone(),
            config.reply_timeout(),
            config.event_backlog,
        ))
    }

    /// Accept the debuggee's pipe and wait for `ready`.
    async fn pipe_handshake(&mut self) -> HarnessResult<()> {
        if self.pipe.is_some() {
            return Ok(());
        }
        let listener = self
            .listener
            .take()
            .ok_or_else(|| HarnessError::Protocol("Pipe listener already consumed".to_string()))?;

        let timeout = self.config.handshake_timeout();
        let pipe = listener.accept(timeout).await?;
        pipe.expect(&Signal::Ready, timeout).await?;
        self.pipe = Some(pipe);
        Ok(())
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn session(&self) -> &CommandSession {
        &self.session
    }

    pub fn process(&self) -> &DebuggeeProcess {
        &self.process
    }

    /// The signal pipe, once the debuggee has said `ready`.
    pub fn pipe(&self) -> HarnessResult<&IoPipe> {
        self.pipe
            .as_ref()
            .ok_or_else(|| HarnessError::Protocol("Pipe handshake has not completed".to_string()))
    }

    /// Resume the debuggee (`Connected` -> `Running`) and complete the pipe
    /// handshake if it is still outstanding.
    pub async fn resume(&mut self) -> HarnessResult<()> {
        if self.process.state() != ProcessState::Connected {
            return Err(HarnessError::InvalidState {
                from: self.process.state(),
                to: ProcessState::Running,
            });
        }
        self.session.resume_all().await?;
        self.process.mark_running()?;
        self.pipe_handshake().await
    }

    /// Send a choreography signal to the debuggee.
    pub async fn signal(&self, signal: Signal) -> HarnessResult<()> {
        self.pipe()?.send(&signal).await
    }

    /// Wait for an event with the configured event timeout.
    pub async fn wait_event<P>(&self, predicate: P) -> HarnessResult<Event>
    where
        P: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        self.session
            .dispatcher()
            .wait_event(predicate, self.config.event_timeout())
            .await
    }

    /// Tell the debuggee to quit and check its exit status.
    pub async fn quit(&mut self) -> HarnessResult<ExitStatus> {
        self.signal(Signal::Quit).await?;
        let status = self
            .processes
            .wait_for(&self.process, self.config.exit_timeout())
            .await?;
        status.check()?;
        Ok(status)
    }

    /// Release everything; safe to call in any state.
    pub async fn teardown(&mut self) {
        self.session.close().await;
        if let Some(pipe) = self.pipe.take() {
            pipe.close().await;
        }
        self.listener = None;

        if self.process.state() != ProcessState::Exited {
            if let Err(e) = self.processes.kill(&self.process).await {
                warn!("Failed to kill debuggee: {}", e);
            }
        }
    }

    /// Launch, run `body`, quit and always tear down.
    ///
    /// A body that leaves the debuggee `Connected` gets it resumed before the
    /// quit signal.
    pub async fn run<F>(config: HarnessConfig, body: F) -> HarnessResult<ExitStatus>
    where
        F: for<'h> FnOnce(&'h mut TestHarness) -> TestBody<'h>,
    {
        let mut harness = Self::launch(config).await?;

        let result = async {
            body(&mut harness).await?;
            if harness.process.state() == ProcessState::Connected {
                harness.resume().await?;
            }
            harness.quit().await
        }
        .await;

        harness.teardown().await;
        match &result {
            Ok(status) => info!("Test passed (exit {:?})", status.code),
            Err(e) => error!("Test failed ({:?}): {}", e.category(), e),
        }
        result
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::eventrequest::SuspendPolicy;
    use crate::events::EventSet;
    use crate::mock::{MockVmConfig, MockVmListener};
    use crate::protocol::FailureCategory;
    use crate::types::Location;
    use std::path::Path;
    use std::time::Duration;

    // Announces the mock VM's port, joins the pipe, says ready and exits
    // with $2 when told to quit. The harness appends -pipe.port=N as $3.
    const DEBUGGEE: &str = r#"
port=$1
status=$2
pipe=${3#-pipe.port=}
echo "Listening for transport dt_socket at address: $port"
exec 3<>/dev/tcp/127.0.0.1/$pipe
echo ready >&3
while read -r line <&3; do
  case "$line" in
    quit) echo "debuggee exiting" >&2; exit $status ;;
  esac
done
exit 1
"#;

    async fn config_for(vm: &MockVmListener, status: i32) -> HarnessConfig {
        let port = vm.local_addr().unwrap().port();
        let mut config = HarnessConfig {
            wait_time: 1,
            ..HarnessConfig::default()
        };
        config.debuggee.command = Some("/bin/bash".to_string());
        config.debuggee.args = vec![
            "-c".to_string(),
            DEBUGGEE.to_string(),
            "debuggee".to_string(),
            port.to_string(),
            status.to_string(),
        ];
        config
    }

    fn mock_vm() -> MockVmConfig {
        MockVmConfig::default()
            .with_thread(1, "main")
            .with_event_on_connect(EventSet::new(
                SuspendPolicy::All,
                vec![Event::new(0, EventKind::VMStart { thread: 1 })],
            ))
    }

    #[tokio::test]
    async fn test_full_session_passes() {
        if !Path::new("/bin/bash").exists() {
            return;
        }
        let listener = MockVmListener::bind(mock_vm()).await.unwrap();
        let config = config_for(&listener, 95).await;
        let vm = tokio::spawn(listener.accept(Duration::from_secs(30)));

        let status = TestHarness::run(config, |h| {
            Box::pin(async move {
                assert_eq!(h.process().state(), ProcessState::Connected);
                assert!(h.session().suspend_state().is_suspended(1));

                let location = Location {
                    type_tag: 1,
                    class_id: 2,
                    method_id: 3,
                    index: 0,
                };
                h.session()
                    .set_breakpoint(location, SuspendPolicy::EventThread)
                    .await?;

                h.resume().await?;
                assert_eq!(h.process().state(), ProcessState::Running);
                assert!(!h.session().suspend_state().is_suspended(1));
                h.signal(Signal::Go).await?;
                Ok(())
            })
        })
        .await
        .unwrap();

        assert!(status.passed());
        assert_eq!(status.output.stderr, vec!["debuggee exiting".to_string()]);
        drop(vm);
    }

    #[tokio::test]
    async fn test_failing_debuggee_is_test_failure() {
        if !Path::new("/bin/bash").exists() {
            return;
        }
        let listener = MockVmListener::bind(mock_vm()).await.unwrap();
        let config = config_for(&listener, 97).await;
        let _vm = tokio::spawn(listener.accept(Duration::from_secs(30)));

        let err = TestHarness::run(config, |_| Box::pin(async { Ok(()) }))
            .await
            .unwrap_err();

        assert_eq!(err.category(), FailureCategory::TestFailure);
        match err {
            HarnessError::UnexpectedExit { code, output, .. } => {
                assert_eq!(code, Some(97));
                assert!(output.stderr.contains(&"debuggee exiting".to_string()));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_command_is_config_error() {
        let err = TestHarness::launch(HarnessConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::Config(_)));
        assert_eq!(err.category(), FailureCategory::Infrastructure);
    }
}
