// Scripted debuggee for tests
//
// Answers a small subset of commands from canned configuration so the session,
// the typed wrappers and the harness can be exercised without a real VM.

use crate::codec::event_packet;
use crate::commands::{
    command_sets, event_commands, reference_type_commands, thread_commands, vm_commands,
};
use crate::dispatcher::DEFAULT_EVENT_BACKLOG;
use crate::events::EventSet;
use crate::protocol::*;
use crate::reader::{read_i32, read_string, read_u64, read_u8, read_value};
use crate::session::CommandSession;
use crate::suspend::SuspendState;
use crate::sync::lock;
use crate::transport::Transport;
use crate::types::{ObjectId, ReferenceTypeId, Tag, ThreadId, ThreadStatus};
use bytes::BufMut;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct MockVmConfig {
    pub description: String,
    pub threads: Vec<(ThreadId, String)>,
    pub classes: Vec<(ReferenceTypeId, String)>,
    pub instances: HashMap<ReferenceTypeId, Vec<ObjectId>>,
    /// Commands that are recorded but never answered
    pub silent: HashSet<(u8, u8)>,
    /// Event sets sent as soon as the debugger attaches
    pub on_connect: Vec<EventSet>,
}

impl Default for MockVmConfig {
    fn default() -> Self {
        Self {
            description: "Mock VM".to_string(),
            threads: Vec::new(),
            classes: Vec::new(),
            instances: HashMap::new(),
            silent: HashSet::new(),
            on_connect: Vec::new(),
        }
    }
}

impl MockVmConfig {
    pub fn with_thread(mut self, id: ThreadId, name: &str) -> Self {
        self.threads.push((id, name.to_string()));
        self
    }

    pub fn with_class(mut self, id: ReferenceTypeId, signature: &str) -> Self {
        self.classes.push((id, signature.to_string()));
        self
    }

    pub fn with_instances(mut self, id: ReferenceTypeId, objects: Vec<ObjectId>) -> Self {
        self.instances.insert(id, objects);
        self
    }

    pub fn with_event_on_connect(mut self, set: EventSet) -> Self {
        self.on_connect.push(set);
        self
    }
}

#[derive(Default)]
struct Recorded {
    requests: Vec<(u8, u8, Vec<u8>)>,
    next_request_id: i32,
}

struct MockState {
    config: MockVmConfig,
    recorded: Mutex<Recorded>,
    suspend: SuspendState,
    next_event_id: AtomicU32,
}

enum After {
    Continue,
    Disconnect,
}

struct Answer {
    error: ErrorCode,
    data: Vec<u8>,
    after: After,
}

impl Answer {
    fn ok(data: Vec<u8>) -> Self {
        Self {
            error: ErrorCode::None,
            data,
            after: After::Continue,
        }
    }

    fn error(error: ErrorCode) -> Self {
        Self {
            error,
            data: Vec::new(),
            after: After::Continue,
        }
    }
}

fn put_string(buf: &mut Vec<u8>, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

/// Debuggee end of a mock connection.
pub struct MockVm {
    transport: Transport,
    state: Arc<MockState>,
}

impl MockVm {
    /// A session wired to a mock VM over an in-memory stream.
    pub fn pair(config: MockVmConfig) -> (CommandSession, MockVm) {
        let (debugger, debuggee) = tokio::io::duplex(64 * 1024);
        let session = CommandSession::start(
            Transport::from_stream(debugger, "mock-vm", MAX_PACKET_SIZE),
            Arc::new(SuspendState::new()),
            Duration::from_secs(10),
            DEFAULT_EVENT_BACKLOG,
        );
        let vm = Self::serve(
            Transport::from_stream(debuggee, "mock-debugger", MAX_PACKET_SIZE),
            config,
        );
        (session, vm)
    }

    /// Serve commands arriving on `transport` until it closes.
    pub fn serve(transport: Transport, config: MockVmConfig) -> MockVm {
        let state = Arc::new(MockState {
            config,
            recorded: Mutex::new(Recorded::default()),
            suspend: SuspendState::new(),
            next_event_id: AtomicU32::new(0x4000_0000),
        });
        tokio::spawn(serve_loop(transport.clone(), state.clone()));
        MockVm { transport, state }
    }

    /// Send an event set to the debugger.
    pub async fn emit(&self, set: EventSet) -> HarnessResult<()> {
        let id = self.state.next_event_id.fetch_add(1, Ordering::SeqCst);
        self.transport.send(&event_packet(id, &set).into()).await
    }

    /// Command set/command pairs received so far, in order.
    pub fn requests(&self) -> Vec<(u8, u8)> {
        lock(&self.state.recorded, "mock requests")
            .requests
            .iter()
            .map(|(set, cmd, _)| (*set, *cmd))
            .collect()
    }

    /// Payload of the most recent command with this set/command pair.
    pub fn last_payload(&self, command_set: u8, command: u8) -> Option<Vec<u8>> {
        lock(&self.state.recorded, "mock payload")
            .requests
            .iter()
            .rev()
            .find(|(set, cmd, _)| *set == command_set && *cmd == command)
            .map(|(_, _, data)| data.clone())
    }

    /// Drop the connection as a crashing debuggee would.
    pub async fn disconnect(&self) {
        self.transport.close().await;
    }
}

/// TCP listener that serves a mock VM to the first debugger that attaches.
pub struct MockVmListener {
    listener: TcpListener,
    config: MockVmConfig,
}

impl MockVmListener {
    pub async fn bind(config: MockVmConfig) -> HarnessResult<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        Ok(Self { listener, config })
    }

    pub fn local_addr(&self) -> HarnessResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn accept(self, timeout: Duration) -> HarnessResult<MockVm> {
        let transport = Transport::accept(&self.listener, timeout, MAX_PACKET_SIZE).await?;
        Ok(MockVm::serve(transport, self.config))
    }
}

async fn serve_loop(transport: Transport, state: Arc<MockState>) {
    for set in state.config.on_connect.clone() {
        let id = state.next_event_id.fetch_add(1, Ordering::SeqCst);
        if transport.send(&event_packet(id, &set).into()).await.is_err() {
            return;
        }
    }

    loop {
        let cmd = match transport.receive().await {
            Ok(Packet::Command(cmd)) => cmd,
            Ok(Packet::Reply(reply)) => {
                debug!("Mock VM ignoring reply id={}", reply.id);
                continue;
            }
            Err(e) => {
                debug!("Mock VM stopped: {}", e);
                return;
            }
        };

        lock(&state.recorded, "mock record")
            .requests
            .push((cmd.command_set, cmd.command, cmd.data.clone()));
        if state.config.silent.contains(&(cmd.command_set, cmd.command)) {
            continue;
        }

        let answer = state.answer(&cmd).unwrap_or_else(|e| {
            debug!("Mock VM could not parse command {}: {}", cmd.id, e);
            Answer::error(ErrorCode::IllegalArgument)
        });
        let reply = ReplyPacket::new(cmd.id, answer.error.code(), answer.data);
        if transport.send(&reply.into()).await.is_err() {
            return;
        }
        if let After::Disconnect = answer.after {
            transport.close().await;
            return;
        }
    }
}

impl MockState {
    fn thread_name(&self, thread: ThreadId) -> Option<&str> {
        self.config
            .threads
            .iter()
            .find(|(id, _)| *id == thread)
            .map(|(_, name)| name.as_str())
    }

    fn class_signature(&self, ref_type: ReferenceTypeId) -> Option<&str> {
        self.config
            .classes
            .iter()
            .find(|(id, _)| *id == ref_type)
            .map(|(_, sig)| sig.as_str())
    }

    fn answer(&self, cmd: &CommandPacket) -> HarnessResult<Answer> {
        let mut args = cmd.data.as_slice();
        let mut out = Vec::new();

        let answer = match (cmd.command_set, cmd.command) {
            (command_sets::VIRTUAL_MACHINE, vm_commands::VERSION) => {
                put_string(&mut out, &self.config.description);
                out.put_i32(1);
                out.put_i32(8);
                put_string(&mut out, "1.0-mock");
                put_string(&mut out, "Mock VM");
                Answer::ok(out)
            }
            (command_sets::VIRTUAL_MACHINE, vm_commands::ID_SIZES) => {
                for _ in 0..5 {
                    out.put_i32(8);
                }
                Answer::ok(out)
            }
            (command_sets::VIRTUAL_MACHINE, vm_commands::ALL_THREADS) => {
                out.put_i32(self.config.threads.len() as i32);
                for (id, _) in &self.config.threads {
                    out.put_u64(*id);
                }
                Answer::ok(out)
            }
            (command_sets::VIRTUAL_MACHINE, vm_commands::CLASSES_BY_SIGNATURE) => {
                let signature = read_string(&mut args)?;
                let matching: Vec<_> = self
                    .config
                    .classes
                    .iter()
                    .filter(|(_, sig)| *sig == signature)
                    .collect();
                out.put_i32(matching.len() as i32);
                for (id, _) in matching {
                    out.put_u8(1);
                    out.put_u64(*id);
                    out.put_i32(7); // VERIFIED | PREPARED | INITIALIZED
                }
                Answer::ok(out)
            }
            (command_sets::VIRTUAL_MACHINE, vm_commands::SUSPEND) => {
                self.suspend.suspend_all();
                Answer::ok(out)
            }
            (command_sets::VIRTUAL_MACHINE, vm_commands::RESUME) => {
                self.suspend.resume_all();
                Answer::ok(out)
            }
            (command_sets::VIRTUAL_MACHINE, vm_commands::EXIT)
            | (command_sets::VIRTUAL_MACHINE, vm_commands::DISPOSE) => Answer {
                error: ErrorCode::None,
                data: out,
                after: After::Disconnect,
            },

            (command_sets::THREAD_REFERENCE, command) => {
                let thread = read_u64(&mut args)?;
                let Some(name) = self.thread_name(thread) else {
                    return Ok(Answer::error(ErrorCode::InvalidThread));
                };
                match command {
                    thread_commands::NAME => {
                        put_string(&mut out, name);
                        Answer::ok(out)
                    }
                    thread_commands::SUSPEND => {
                        self.suspend.suspend_thread(thread);
                        Answer::ok(out)
                    }
                    thread_commands::RESUME => {
                        self.suspend.resume_thread(thread);
                        Answer::ok(out)
                    }
                    thread_commands::STATUS => {
                        out.put_i32(ThreadStatus::Running as i32);
                        out.put_i32(i32::from(self.suspend.is_suspended(thread)));
                        Answer::ok(out)
                    }
                    thread_commands::SUSPEND_COUNT => {
                        out.put_i32(self.suspend.suspend_count(thread) as i32);
                        Answer::ok(out)
                    }
                    thread_commands::STOP => {
                        if read_u64(&mut args)? == 0 {
                            Answer::error(ErrorCode::InvalidObject)
                        } else {
                            Answer::ok(out)
                        }
                    }
                    thread_commands::FORCE_EARLY_RETURN => {
                        read_value(&mut args)?;
                        if self.suspend.is_suspended(thread) {
                            Answer::ok(out)
                        } else {
                            Answer::error(ErrorCode::ThreadNotSuspended)
                        }
                    }
                    _ => Answer::error(ErrorCode::NotImplemented),
                }
            }

            (command_sets::REFERENCE_TYPE, reference_type_commands::SIGNATURE) => {
                let ref_type = read_u64(&mut args)?;
                match self.class_signature(ref_type) {
                    Some(signature) => {
                        put_string(&mut out, signature);
                        Answer::ok(out)
                    }
                    None => Answer::error(ErrorCode::InvalidClass),
                }
            }
            (command_sets::REFERENCE_TYPE, reference_type_commands::INSTANCES) => {
                let ref_type = read_u64(&mut args)?;
                let max = read_i32(&mut args)?;
                if max < 0 {
                    return Ok(Answer::error(ErrorCode::IllegalArgument));
                }
                if self.class_signature(ref_type).is_none() {
                    return Ok(Answer::error(ErrorCode::InvalidClass));
                }

                let objects = self
                    .config
                    .instances
                    .get(&ref_type)
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                let take = if max == 0 {
                    objects.len()
                } else {
                    objects.len().min(max as usize)
                };
                out.put_i32(take as i32);
                for id in &objects[..take] {
                    out.put_u8(Tag::Object as u8);
                    out.put_u64(*id);
                }
                Answer::ok(out)
            }

            (command_sets::EVENT_REQUEST, event_commands::SET) => {
                let _kind = read_u8(&mut args)?;
                let _policy = read_u8(&mut args)?;
                let mut recorded = lock(&self.recorded, "mock event request");
                recorded.next_request_id += 1;
                out.put_i32(recorded.next_request_id);
                Answer::ok(out)
            }
            (command_sets::EVENT_REQUEST, event_commands::CLEAR)
            | (command_sets::EVENT_REQUEST, event_commands::CLEAR_ALL_BREAKPOINTS) => {
                Answer::ok(out)
            }

            _ => Answer::error(ErrorCode::NotImplemented),
        };

        Ok(answer)
    }
}
