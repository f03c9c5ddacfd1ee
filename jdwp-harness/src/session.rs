// Command session
//
// Correlates command packets with their replies and demultiplexes everything
// else the debuggee sends. One reader task owns the receive side of the
// transport: replies go to the waiter registered under their id, event sets go
// to the dispatcher.

use crate::codec::PacketBody;
use crate::dispatcher::EventDispatcher;
use crate::protocol::*;
use crate::suspend::SuspendState;
use crate::sync::lock;
use crate::transport::Transport;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Id of an in-flight command; the reply carries the same id.
pub type CorrelationId = u32;

type ReplySender = oneshot::Sender<HarnessResult<ReplyPacket>>;
type ReplyReceiver = oneshot::Receiver<HarnessResult<ReplyPacket>>;

/// A command that has been sent and is awaiting its reply
struct PendingCommand {
    id: CorrelationId,
    command_set: u8,
    command: u8,
    sent_at: Instant,
    waiter: ReplySender,
}

/// Receiving end of a pending command, claimed by `receive_reply_for`
struct Outstanding {
    rx: ReplyReceiver,
    command_set: u8,
    command: u8,
}

#[derive(Default)]
struct Table {
    pending: HashMap<CorrelationId, PendingCommand>,
    outstanding: HashMap<CorrelationId, Outstanding>,
    /// Set once the reader has stopped; carries whether it was an explicit close
    terminated: Option<bool>,
}

fn terminal_error(closed: bool) -> HarnessError {
    if closed {
        HarnessError::Closed
    } else {
        HarnessError::Disconnected
    }
}

struct Inner {
    transport: Transport,
    table: Mutex<Table>,
    next_id: AtomicU32,
    dispatcher: EventDispatcher,
    suspend: Arc<SuspendState>,
    reply_timeout: Duration,
    shutdown: CancellationToken,
    /// Set when a reply payload failed to decode
    aborted: AtomicBool,
}

/// Command/reply session over one transport.
#[derive(Clone)]
pub struct CommandSession {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CommandSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandSession")
            .field("peer", &self.inner.transport.peer())
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl CommandSession {
    /// Start a session on an attached transport and spawn its reader task.
    pub fn start(
        transport: Transport,
        suspend: Arc<SuspendState>,
        reply_timeout: Duration,
        event_backlog: usize,
    ) -> Self {
        let dispatcher = EventDispatcher::new(suspend.clone(), event_backlog);
        let session = Self {
            inner: Arc::new(Inner {
                transport,
                table: Mutex::new(Table::default()),
                next_id: AtomicU32::new(1),
                dispatcher,
                suspend,
                reply_timeout,
                shutdown: CancellationToken::new(),
                aborted: AtomicBool::new(false),
            }),
        };

        session.inner.dispatcher.start_listening();
        tokio::spawn(read_loop(session.inner.clone()));
        session
    }

    /// Generate the next packet id. Zero and ids whose reply is still
    /// pending or unclaimed are skipped.
    pub fn next_id(&self) -> CorrelationId {
        loop {
            let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
            if id == 0 {
                continue;
            }
            let table = lock(&self.inner.table, "next_id");
            if !table.pending.contains_key(&id) && !table.outstanding.contains_key(&id) {
                return id;
            }
        }
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.inner.dispatcher
    }

    pub fn suspend_state(&self) -> &Arc<SuspendState> {
        &self.inner.suspend
    }

    pub fn reply_timeout(&self) -> Duration {
        self.inner.reply_timeout
    }

    /// Number of commands still awaiting a reply.
    pub fn pending_count(&self) -> usize {
        lock(&self.inner.table, "pending_count").pending.len()
    }

    /// Cancelled once the reader task has stopped for any reason.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Register a command and write it to the transport.
    ///
    /// The pending entry exists before the first byte is written, so a fast
    /// reply always finds its waiter. Every successful `send` must be paired
    /// with a `receive_reply_for` on the returned id; until then the id stays
    /// reserved.
    pub async fn send(&self, packet: CommandPacket) -> HarnessResult<CorrelationId> {
        let id = packet.id;
        {
            let mut table = lock(&self.inner.table, "send");
            if let Some(closed) = table.terminated {
                return Err(terminal_error(closed));
            }
            if table.pending.contains_key(&id) || table.outstanding.contains_key(&id) {
                return Err(HarnessError::Protocol(format!(
                    "Command id {} is already pending",
                    id
                )));
            }

            let (tx, rx) = oneshot::channel();
            table.pending.insert(
                id,
                PendingCommand {
                    id,
                    command_set: packet.command_set,
                    command: packet.command,
                    sent_at: Instant::now(),
                    waiter: tx,
                },
            );
            table.outstanding.insert(
                id,
                Outstanding {
                    rx,
                    command_set: packet.command_set,
                    command: packet.command,
                },
            );
        }

        debug!(
            "Sending command id={} set={} cmd={} len={}",
            id,
            packet.command_set,
            packet.command,
            packet.data.len()
        );

        if let Err(e) = self.inner.transport.send(&Packet::Command(packet)).await {
            let mut table = lock(&self.inner.table, "send failure");
            table.pending.remove(&id);
            table.outstanding.remove(&id);
            return Err(e);
        }

        Ok(id)
    }

    /// Wait for the reply to a sent command.
    ///
    /// A non-zero error code comes back as `ErrorReply`, never as a transport
    /// failure. On timeout the pending entry is removed so a late reply is
    /// discarded by the reader.
    pub async fn receive_reply_for(
        &self,
        id: CorrelationId,
        timeout: Duration,
    ) -> HarnessResult<ReplyPacket> {
        let Outstanding {
            mut rx,
            command_set,
            command,
        } = lock(&self.inner.table, "receive_reply_for")
            .outstanding
            .remove(&id)
            .ok_or(HarnessError::UnknownCorrelation(id))?;

        let result = match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(HarnessError::Disconnected),
            Err(_) => {
                let removed = lock(&self.inner.table, "reply timeout")
                    .pending
                    .remove(&id)
                    .is_some();
                if removed {
                    warn!(
                        "Command id={} ({}/{}) timed out after {:?}",
                        id, command_set, command, timeout
                    );
                    return Err(HarnessError::timeout(
                        format!("reply to command {}", id),
                        timeout,
                    ));
                }
                // The reader claimed the entry just before the deadline
                rx.try_recv()
                    .unwrap_or(Err(HarnessError::Disconnected))
            }
        };

        let reply = result?;
        reply.check_error(command_set, command)?;
        Ok(reply)
    }

    /// Send a command and wait for its reply with the session's reply timeout.
    pub async fn command(&self, packet: CommandPacket) -> HarnessResult<ReplyPacket> {
        let id = self.send(packet).await?;
        self.receive_reply_for(id, self.inner.reply_timeout).await
    }

    /// Pass through a reply payload decode result. Malformed wire data aborts
    /// the connection: pending waiters fail with `Disconnected`.
    pub(crate) async fn decoded<T>(&self, result: HarnessResult<T>) -> HarnessResult<T> {
        if let Err(e) = &result {
            if e.is_decode_error() {
                self.abort(e).await;
            }
        }
        result
    }

    async fn abort(&self, reason: &HarnessError) {
        error!(
            "Aborting session to {}: {}",
            self.inner.transport.peer(),
            reason
        );
        self.inner.aborted.store(true, Ordering::SeqCst);
        self.inner.transport.close().await;
        self.inner.shutdown.cancelled().await;
    }

    /// Close the session. Pending waiters fail with `Closed`.
    pub async fn close(&self) {
        info!("Closing command session to {}", self.inner.transport.peer());
        self.inner.transport.close().await;
        self.inner.shutdown.cancelled().await;
    }
}

impl Inner {
    fn route_reply(&self, reply: ReplyPacket) {
        let pending = lock(&self.table, "route_reply").pending.remove(&reply.id);
        match pending {
            Some(cmd) => {
                debug!(
                    "Reply id={} for {}/{} after {:?} (error={})",
                    cmd.id,
                    cmd.command_set,
                    cmd.command,
                    cmd.sent_at.elapsed(),
                    reply.error_code
                );
                // A dropped receiver only means nobody is listening any more
                cmd.waiter.send(Ok(reply)).ok();
            }
            None => {
                warn!(
                    "Discarding reply id={} with no pending command (error={})",
                    reply.id, reply.error_code
                );
            }
        }
    }

    /// Fail every pending command and mark the table terminated.
    fn fail_pending(&self, closed: bool) {
        let pending: Vec<PendingCommand> = {
            let mut table = lock(&self.table, "fail_pending");
            table.terminated = Some(closed);
            table.pending.drain().map(|(_, cmd)| cmd).collect()
        };

        if !pending.is_empty() {
            info!("Failing {} pending command(s)", pending.len());
        }
        for cmd in pending {
            cmd.waiter.send(Err(terminal_error(closed))).ok();
        }
    }
}

/// Reader task: decode and route until the transport fails or is closed.
async fn read_loop(inner: Arc<Inner>) {
    info!("Session reader started for {}", inner.transport.peer());

    let reason = loop {
        let packet = match inner.transport.receive().await {
            Ok(packet) => packet,
            Err(e) => break e,
        };

        match packet.into_body() {
            Ok(PacketBody::Reply(reply)) => inner.route_reply(reply),
            Ok(PacketBody::Events(set)) => {
                debug!(
                    "Event set: {} event(s), suspend_policy={:?}",
                    set.events.len(),
                    set.suspend_policy
                );
                inner.dispatcher.dispatch(set);
            }
            Ok(PacketBody::Command(cmd)) => {
                debug!(
                    "Ignoring debuggee command id={} set={} cmd={}",
                    cmd.id, cmd.command_set, cmd.command
                );
            }
            Err(e) => break e,
        }
    };

    let closed =
        matches!(reason, HarnessError::Closed) && !inner.aborted.load(Ordering::SeqCst);
    match &reason {
        HarnessError::Closed => info!("Session reader stopped: transport closed"),
        HarnessError::Disconnected => warn!("Session reader stopped: debuggee disconnected"),
        other => error!("Session reader stopped: {}", other),
    }

    // Decode errors are fatal to the connection
    inner.transport.close().await;
    inner.fail_pending(closed);
    inner.dispatcher.disconnect();
    inner.shutdown.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::event_packet;
    use crate::commands::{command_sets, reference_type_commands, vm_commands};
    use crate::eventrequest::SuspendPolicy;
    use crate::events::{Event, EventKind, EventSet};
    use crate::mock::{MockVm, MockVmConfig};
    use std::collections::HashSet;

    fn raw_pair() -> (CommandSession, Transport) {
        let (a, b) = tokio::io::duplex(4096);
        let debugger = Transport::from_stream(a, "debugger", MAX_PACKET_SIZE);
        let debuggee = Transport::from_stream(b, "debuggee", MAX_PACKET_SIZE);
        let session = CommandSession::start(
            debugger,
            Arc::new(SuspendState::new()),
            Duration::from_secs(5),
            16,
        );
        (session, debuggee)
    }

    #[tokio::test]
    async fn test_reply_routed_by_id() {
        let (session, vm) = raw_pair();

        let id = session
            .send(CommandPacket::new(7, command_sets::VIRTUAL_MACHINE, vm_commands::VERSION))
            .await
            .unwrap();
        assert_eq!(id, 7);
        assert_eq!(session.pending_count(), 1);

        let request = vm.receive().await.unwrap();
        assert_eq!(request.id(), 7);
        vm.send(&ReplyPacket::new(7, 0, vec![1, 2, 3]).into())
            .await
            .unwrap();

        let reply = session
            .receive_reply_for(7, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(reply.data(), &[1, 2, 3]);
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_replies_out_of_order() {
        let (session, vm) = raw_pair();
        session.send(CommandPacket::new(1, 1, 1)).await.unwrap();
        session.send(CommandPacket::new(2, 1, 1)).await.unwrap();
        vm.receive().await.unwrap();
        vm.receive().await.unwrap();

        vm.send(&ReplyPacket::new(2, 0, vec![2]).into()).await.unwrap();
        vm.send(&ReplyPacket::new(1, 0, vec![1]).into()).await.unwrap();

        let timeout = Duration::from_secs(5);
        assert_eq!(session.receive_reply_for(1, timeout).await.unwrap().data(), &[1]);
        assert_eq!(session.receive_reply_for(2, timeout).await.unwrap().data(), &[2]);
    }

    #[tokio::test]
    async fn test_negative_max_instances_is_typed_error() {
        let (session, _vm) = MockVm::pair(MockVmConfig::default());

        let err = session.instances(1, -1).await.unwrap_err();
        assert_eq!(err.error_code(), Some(ErrorCode::IllegalArgument));
        assert!(matches!(
            err,
            HarnessError::ErrorReply {
                command_set: command_sets::REFERENCE_TYPE,
                command: reference_type_commands::INSTANCES,
                ..
            }
        ));
        // The session survives an error reply
        assert!(session.version().await.is_ok());
    }

    #[tokio::test]
    async fn test_disconnect_unblocks_reply_and_event_waiters() {
        let (session, vm) = raw_pair();
        let id = session.send(CommandPacket::new(5, 1, 1)).await.unwrap();

        let reply_waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.receive_reply_for(id, Duration::from_secs(30)).await })
        };
        let event_waiter = {
            let session = session.clone();
            tokio::spawn(async move {
                session
                    .dispatcher()
                    .wait_event(|_| true, Duration::from_secs(30))
                    .await
            })
        };
        while session.dispatcher().waiter_count() == 0 {
            tokio::task::yield_now().await;
        }

        drop(vm);

        assert!(matches!(
            reply_waiter.await.unwrap(),
            Err(HarnessError::Disconnected)
        ));
        assert!(matches!(
            event_waiter.await.unwrap(),
            Err(HarnessError::Disconnected)
        ));
        session.shutdown_token().cancelled().await;
        assert!(matches!(
            session.send(CommandPacket::new(6, 1, 1)).await,
            Err(HarnessError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_close_fails_pending_with_closed() {
        let (session, _vm) = raw_pair();
        let id = session.send(CommandPacket::new(3, 1, 1)).await.unwrap();

        session.close().await;

        assert!(matches!(
            session.receive_reply_for(id, Duration::from_secs(5)).await,
            Err(HarnessError::Closed)
        ));
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_pending_ids_are_unique() {
        let mut config = MockVmConfig::default();
        config
            .silent
            .insert((command_sets::VIRTUAL_MACHINE, vm_commands::VERSION));
        let (session, _vm) = MockVm::pair(config);

        let sends: Vec<_> = (0..50)
            .map(|_| {
                let session = session.clone();
                tokio::spawn(async move {
                    let packet = CommandPacket::new(
                        session.next_id(),
                        command_sets::VIRTUAL_MACHINE,
                        vm_commands::VERSION,
                    );
                    session.send(packet).await
                })
            })
            .collect();

        let mut ids = HashSet::new();
        for send in sends {
            assert!(ids.insert(send.await.unwrap().unwrap()));
        }
        assert_eq!(session.pending_count(), 50);

        let dup = session.send(CommandPacket::new(*ids.iter().next().unwrap(), 1, 1)).await;
        assert!(matches!(dup, Err(HarnessError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_late_reply_is_discarded() {
        let (session, vm) = raw_pair();
        let id = session.send(CommandPacket::new(11, 1, 1)).await.unwrap();

        let started = Instant::now();
        let timeout = Duration::from_millis(100);
        let result = session.receive_reply_for(id, timeout).await;
        assert!(matches!(result, Err(HarnessError::Timeout { .. })));
        assert!(started.elapsed() >= timeout);
        assert!(started.elapsed() < timeout + Duration::from_secs(1));
        assert_eq!(session.pending_count(), 0);

        // The late reply finds no waiter; the session keeps working
        vm.receive().await.unwrap();
        vm.send(&ReplyPacket::new(11, 0, Vec::new()).into())
            .await
            .unwrap();

        let next = session.send(CommandPacket::new(12, 1, 1)).await.unwrap();
        vm.receive().await.unwrap();
        vm.send(&ReplyPacket::new(12, 0, vec![42]).into()).await.unwrap();
        let reply = session
            .receive_reply_for(next, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(reply.data(), &[42]);
        assert!(matches!(
            session.receive_reply_for(11, timeout).await,
            Err(HarnessError::UnknownCorrelation(11))
        ));
    }

    #[tokio::test]
    async fn test_events_reach_dispatcher_suspended() {
        let (session, vm) = raw_pair();
        let set = EventSet::new(
            SuspendPolicy::EventThread,
            vec![Event::new(4, EventKind::ThreadStart { thread: 21 })],
        );
        vm.send(&event_packet(100, &set).into()).await.unwrap();

        let event = session
            .dispatcher()
            .wait_event(
                |e| matches!(e.details, EventKind::ThreadStart { .. }),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(event.thread(), Some(21));
        assert!(session.suspend_state().is_suspended(21));
    }

    #[tokio::test]
    async fn test_malformed_packet_aborts_connection() {
        let (a, mut raw) = tokio::io::duplex(256);
        let session = CommandSession::start(
            Transport::from_stream(a, "debugger", MAX_PACKET_SIZE),
            Arc::new(SuspendState::new()),
            Duration::from_secs(5),
            16,
        );
        let id = session.send(CommandPacket::new(1, 1, 1)).await.unwrap();

        use tokio::io::AsyncWriteExt;
        raw.write_all(&[0, 0, 0, 3, 0, 0, 0, 1, 0x80, 0, 0]).await.unwrap();

        assert!(matches!(
            session.receive_reply_for(id, Duration::from_secs(5)).await,
            Err(HarnessError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_unknown_value_tag_in_reply_aborts_connection() {
        let (session, vm) = raw_pair();
        let other = session.send(CommandPacket::new(900, 1, 1)).await.unwrap();
        vm.receive().await.unwrap();

        let call = {
            let session = session.clone();
            tokio::spawn(async move { session.instances(1, 0).await })
        };
        let request = vm.receive().await.unwrap();
        let mut data = vec![0, 0, 0, 1, b'Q'];
        data.extend_from_slice(&[0; 8]);
        vm.send(&ReplyPacket::new(request.id(), 0, data).into())
            .await
            .unwrap();

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, HarnessError::UnknownValueTag(b'Q')));
        assert!(session.is_closed());
        assert!(matches!(
            session.receive_reply_for(other, Duration::from_secs(5)).await,
            Err(HarnessError::Disconnected)
        ));
        assert!(matches!(
            session.send(CommandPacket::new(901, 1, 1)).await,
            Err(HarnessError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_unclaimed_reply_keeps_id_reserved() {
        let (session, vm) = raw_pair();
        session.send(CommandPacket::new(3, 1, 1)).await.unwrap();
        vm.receive().await.unwrap();
        vm.send(&ReplyPacket::new(3, 0, Vec::new()).into())
            .await
            .unwrap();
        while session.pending_count() > 0 {
            tokio::task::yield_now().await;
        }

        let ids: Vec<_> = (0..4).map(|_| session.next_id()).collect();
        assert_eq!(ids, vec![1, 2, 4, 5]);

        session
            .receive_reply_for(3, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(session.next_id(), 6);
    }
}
