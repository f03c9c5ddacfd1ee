// Event dispatch
//
// Receives decoded event sets from the session's reader task, applies their
// suspend policy, then hands each event to registered listeners and waiters in
// receipt order.

use crate::events::{Event, EventSet};
use crate::protocol::{HarnessError, HarnessResult};
use crate::suspend::SuspendState;
use crate::sync::lock;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Default number of unclaimed events kept for later waiters
pub const DEFAULT_EVENT_BACKLOG: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Idle,
    Listening,
    Delivering,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Predicate = Box<dyn Fn(&Event) -> bool + Send + Sync>;

struct Listener {
    id: u64,
    predicate: Predicate,
    queue: mpsc::UnboundedSender<Event>,
}

struct Waiter {
    id: u64,
    predicate: Predicate,
    tx: oneshot::Sender<HarnessResult<Event>>,
}

struct Table {
    state: DispatcherState,
    disconnected: bool,
    next_id: u64,
    listeners: Vec<Listener>,
    waiters: Vec<Waiter>,
    backlog: VecDeque<Event>,
}

struct Inner {
    table: Mutex<Table>,
    suspend: Arc<SuspendState>,
    backlog_limit: usize,
}

/// Routes asynchronous events to whoever is waiting for them.
#[derive(Clone)]
pub struct EventDispatcher {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("state", &self.state())
            .finish()
    }
}

impl EventDispatcher {
    pub fn new(suspend: Arc<SuspendState>, backlog_limit: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                table: Mutex::new(Table {
                    state: DispatcherState::Idle,
                    disconnected: false,
                    next_id: 1,
                    listeners: Vec::new(),
                    waiters: Vec::new(),
                    backlog: VecDeque::new(),
                }),
                suspend,
                backlog_limit,
            }),
        }
    }

    pub fn state(&self) -> DispatcherState {
        lock(&self.inner.table, "dispatcher state").state
    }

    pub fn suspend_state(&self) -> &Arc<SuspendState> {
        &self.inner.suspend
    }

    /// Mark the dispatcher as fed by a live receiver.
    pub(crate) fn start_listening(&self) {
        let mut table = lock(&self.inner.table, "start_listening");
        if table.disconnected {
            warn!("Dispatcher already saw a disconnect; not listening again");
            return;
        }
        table.state = DispatcherState::Listening;
        info!("Event dispatcher listening");
    }

    /// Register a listener that receives a copy of every matching event.
    pub fn add_listener<P>(&self, predicate: P, queue: mpsc::UnboundedSender<Event>) -> ListenerId
    where
        P: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        let mut table = lock(&self.inner.table, "add_listener");
        let id = table.next_id;
        table.next_id += 1;
        table.listeners.push(Listener {
            id,
            predicate: Box::new(predicate),
            queue,
        });
        ListenerId(id)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut table = lock(&self.inner.table, "remove_listener");
        let before = table.listeners.len();
        table.listeners.retain(|l| l.id != id.0);
        table.listeners.len() != before
    }

    /// Wait for the first event matching `predicate`.
    ///
    /// An unclaimed matching event that arrived earlier is returned at once.
    /// On timeout the waiter is unregistered, so a late event is kept for
    /// whoever asks for it next rather than handed to this caller.
    pub async fn wait_event<P>(&self, predicate: P, timeout: Duration) -> HarnessResult<Event>
    where
        P: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        let (tx, mut rx) = oneshot::channel();
        let id = {
            let mut table = lock(&self.inner.table, "wait_event");
            if let Some(pos) = table.backlog.iter().position(|e| predicate(e)) {
                if let Some(event) = table.backlog.remove(pos) {
                    debug!("Event kind={} taken from backlog", event.kind);
                    return Ok(event);
                }
            }
            if table.disconnected {
                return Err(HarnessError::Disconnected);
            }

            let id = table.next_id;
            table.next_id += 1;
            table.waiters.push(Waiter {
                id,
                predicate: Box::new(predicate),
                tx,
            });
            id
        };

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(HarnessError::Disconnected),
            Err(_) => {
                let removed = {
                    let mut table = lock(&self.inner.table, "wait_event timeout");
                    let before = table.waiters.len();
                    table.waiters.retain(|w| w.id != id);
                    table.waiters.len() != before
                };
                if removed {
                    return Err(HarnessError::timeout("event", timeout));
                }
                // Delivered between the deadline and unregistering
                match rx.try_recv() {
                    Ok(result) => result,
                    Err(_) => Err(HarnessError::timeout("event", timeout)),
                }
            }
        }
    }

    /// Number of registered waiters, for diagnostics.
    pub fn waiter_count(&self) -> usize {
        lock(&self.inner.table, "waiter_count").waiters.len()
    }

    /// Deliver one event set. Suspension is recorded before any waiter can
    /// observe the events.
    pub(crate) fn dispatch(&self, set: EventSet) {
        self.inner
            .suspend
            .record_event(set.suspend_policy, set.thread());

        let mut table = lock(&self.inner.table, "dispatch");
        let resume_state = table.state;
        table.state = DispatcherState::Delivering;

        for event in set.events {
            debug!(
                "Delivering event kind={} request_id={} thread={:?}",
                event.kind,
                event.request_id,
                event.thread()
            );

            table.listeners.retain(|listener| {
                if !(listener.predicate)(&event) {
                    return true;
                }
                listener.queue.send(event.clone()).is_ok()
            });

            let mut pending = Some(event);
            while let Some(event) = pending.take() {
                let Some(pos) = table.waiters.iter().position(|w| (w.predicate)(&event)) else {
                    pending = Some(event);
                    break;
                };
                let waiter = table.waiters.remove(pos);
                if let Err(Ok(event)) = waiter.tx.send(Ok(event)) {
                    // Waiter gave up concurrently; try the next one
                    pending = Some(event);
                }
            }

            if let Some(event) = pending {
                if table.backlog.len() >= self.inner.backlog_limit {
                    if let Some(dropped) = table.backlog.pop_front() {
                        warn!(
                            "Event backlog full, dropping oldest event kind={}",
                            dropped.kind
                        );
                    }
                }
                table.backlog.push_back(event);
            }
        }

        table.state = resume_state;
    }

    /// The event source is gone: fail every waiter and stop listening.
    pub(crate) fn disconnect(&self) {
        let waiters = {
            let mut table = lock(&self.inner.table, "disconnect");
            table.state = DispatcherState::Idle;
            table.disconnected = true;
            table.listeners.clear();
            std::mem::take(&mut table.waiters)
        };

        if !waiters.is_empty() {
            info!("Failing {} event waiter(s) after disconnect", waiters.len());
        }
        for waiter in waiters {
            waiter.tx.send(Err(HarnessError::Disconnected)).ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventrequest::SuspendPolicy;
    use crate::events::EventKind;
    use crate::types::Location;

    fn dispatcher() -> EventDispatcher {
        let d = EventDispatcher::new(Arc::new(SuspendState::new()), DEFAULT_EVENT_BACKLOG);
        d.start_listening();
        d
    }

    fn breakpoint(thread: u64, index: u64) -> Event {
        Event::new(
            1,
            EventKind::Breakpoint {
                thread,
                location: Location {
                    type_tag: 1,
                    class_id: 2,
                    method_id: 3,
                    index,
                },
            },
        )
    }

    fn is_breakpoint(e: &Event) -> bool {
        matches!(e.details, EventKind::Breakpoint { .. })
    }

    #[tokio::test]
    async fn test_waiter_receives_matching_event() {
        let d = dispatcher();
        let waiter = {
            let d = d.clone();
            tokio::spawn(async move { d.wait_event(is_breakpoint, Duration::from_secs(5)).await })
        };
        while d.waiter_count() == 0 {
            tokio::task::yield_now().await;
        }

        d.dispatch(EventSet::new(
            SuspendPolicy::None,
            vec![Event::new(0, EventKind::ThreadStart { thread: 1 }), breakpoint(1, 5)],
        ));

        let event = waiter.await.unwrap().unwrap();
        assert_eq!(event.location().map(|l| l.index), Some(5));
        assert_eq!(d.state(), DispatcherState::Listening);
    }

    #[tokio::test]
    async fn test_suspension_recorded_before_delivery() {
        let d = dispatcher();
        let suspend = d.suspend_state().clone();
        let (tx, mut rx) = mpsc::unbounded_channel();
        d.add_listener(
            move |e| {
                // Runs during delivery; suspension must already be visible
                assert!(suspend.is_suspended(e.thread().unwrap_or_default()));
                true
            },
            tx,
        );

        d.dispatch(EventSet::new(SuspendPolicy::EventThread, vec![breakpoint(9, 1)]));
        let event = d
            .wait_event(is_breakpoint, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(d.suspend_state().is_suspended(9));
        assert!(!d.suspend_state().is_suspended(10));
        assert_eq!(rx.recv().await.unwrap(), event);

        d.dispatch(EventSet::new(SuspendPolicy::All, vec![breakpoint(10, 2)]));
        d.wait_event(is_breakpoint, Duration::from_secs(1)).await.unwrap();
        assert!(d.suspend_state().is_suspended(10));
        assert_eq!(d.suspend_state().suspend_count(9), 2);
    }

    #[tokio::test]
    async fn test_same_thread_events_keep_order() {
        let d = dispatcher();
        for index in 0..10 {
            d.dispatch(EventSet::new(SuspendPolicy::None, vec![breakpoint(3, index)]));
        }
        for index in 0..10 {
            let event = d
                .wait_event(is_breakpoint, Duration::from_secs(1))
                .await
                .unwrap();
            assert_eq!(event.location().unwrap().index, index);
        }
    }

    #[tokio::test]
    async fn test_wait_times_out_and_unregisters() {
        let d = dispatcher();
        let started = tokio::time::Instant::now();
        let result = d.wait_event(is_breakpoint, Duration::from_millis(50)).await;

        assert!(matches!(result, Err(HarnessError::Timeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(d.waiter_count(), 0);
    }

    #[tokio::test]
    async fn test_late_event_not_given_to_unrelated_waiter() {
        let d = dispatcher();
        assert!(d
            .wait_event(is_breakpoint, Duration::from_millis(20))
            .await
            .is_err());

        // Arrives after its waiter gave up
        d.dispatch(EventSet::new(SuspendPolicy::None, vec![breakpoint(1, 1)]));

        let unrelated = d
            .wait_event(
                |e| matches!(e.details, EventKind::ThreadDeath { .. }),
                Duration::from_millis(20),
            )
            .await;
        assert!(matches!(unrelated, Err(HarnessError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_disconnect_fails_blocked_waiters() {
        let d = dispatcher();
        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let d = d.clone();
                tokio::spawn(async move { d.wait_event(is_breakpoint, Duration::from_secs(30)).await })
            })
            .collect();
        while d.waiter_count() < 2 {
            tokio::task::yield_now().await;
        }

        d.disconnect();

        for waiter in waiters {
            assert!(matches!(
                waiter.await.unwrap(),
                Err(HarnessError::Disconnected)
            ));
        }
        assert_eq!(d.state(), DispatcherState::Idle);
        assert!(matches!(
            d.wait_event(is_breakpoint, Duration::from_secs(1)).await,
            Err(HarnessError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_removed_listener_gets_nothing() {
        let d = dispatcher();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = d.add_listener(|_| true, tx);
        assert!(d.remove_listener(id));

        d.dispatch(EventSet::new(SuspendPolicy::None, vec![breakpoint(1, 1)]));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_backlog_is_bounded() {
        let d = EventDispatcher::new(Arc::new(SuspendState::new()), 2);
        d.start_listening();
        for index in 0..3 {
            d.dispatch(EventSet::new(SuspendPolicy::None, vec![breakpoint(1, index)]));
        }
        let first = d
            .wait_event(is_breakpoint, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(first.location().unwrap().index, 1);
    }
}
