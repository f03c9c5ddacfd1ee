// Event handling
//
// Events are sent from the debuggee to notify about breakpoints, steps, thread
// lifecycle, class unloading and VM death. They arrive as composite command
// packets (command set 64, command 100).

use crate::commands::{event_kinds, modifier_kinds};
use crate::eventrequest::SuspendPolicy;
use crate::protocol::HarnessResult;
use crate::reader::{read_i32, read_location, read_string, read_u64, read_u8};
use crate::types::*;
use bytes::BufMut;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Composite event packet (can contain multiple events)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSet {
    pub suspend_policy: SuspendPolicy,
    pub events: Vec<Event>,
}

/// Single event within an event set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub kind: u8,
    pub request_id: i32,
    /// Policy of the set this event arrived in.
    pub suspend_policy: SuspendPolicy,
    pub details: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventKind {
    VMStart {
        thread: ThreadId,
    },
    VMDeath,
    ThreadStart {
        thread: ThreadId,
    },
    ThreadDeath {
        thread: ThreadId,
    },
    ClassPrepare {
        thread: ThreadId,
        ref_type_tag: u8,
        ref_type: ReferenceTypeId,
        signature: String,
        status: i32,
    },
    ClassUnload {
        signature: String,
    },
    Breakpoint {
        thread: ThreadId,
        location: Location,
    },
    Step {
        thread: ThreadId,
        location: Location,
    },
    Exception {
        thread: ThreadId,
        location: Location,
        exception: ObjectId,
        catch_location: Option<Location>,
    },
    MethodEntry {
        thread: ThreadId,
        location: Location,
    },
    MethodExit {
        thread: ThreadId,
        location: Location,
    },
    Unknown {
        kind: u8,
    },
}

impl Event {
    pub fn new(request_id: i32, details: EventKind) -> Self {
        Self {
            kind: details.kind(),
            request_id,
            suspend_policy: SuspendPolicy::None,
            details,
        }
    }

    /// Thread the event happened on, if it has one.
    pub fn thread(&self) -> Option<ThreadId> {
        match &self.details {
            EventKind::VMStart { thread }
            | EventKind::ThreadStart { thread }
            | EventKind::ThreadDeath { thread }
            | EventKind::ClassPrepare { thread, .. }
            | EventKind::Breakpoint { thread, .. }
            | EventKind::Step { thread, .. }
            | EventKind::Exception { thread, .. }
            | EventKind::MethodEntry { thread, .. }
            | EventKind::MethodExit { thread, .. } => Some(*thread),
            EventKind::VMDeath | EventKind::ClassUnload { .. } | EventKind::Unknown { .. } => None,
        }
    }

    pub fn location(&self) -> Option<&Location> {
        match &self.details {
            EventKind::Breakpoint { location, .. }
            | EventKind::Step { location, .. }
            | EventKind::Exception { location, .. }
            | EventKind::MethodEntry { location, .. }
            | EventKind::MethodExit { location, .. } => Some(location),
            _ => None,
        }
    }
}

impl EventKind {
    pub fn kind(&self) -> u8 {
        match self {
            EventKind::VMStart { .. } => event_kinds::VM_START,
            EventKind::VMDeath => event_kinds::VM_DEATH,
            EventKind::ThreadStart { .. } => event_kinds::THREAD_START,
            EventKind::ThreadDeath { .. } => event_kinds::THREAD_DEATH,
            EventKind::ClassPrepare { .. } => event_kinds::CLASS_PREPARE,
            EventKind::ClassUnload { .. } => event_kinds::CLASS_UNLOAD,
            EventKind::Breakpoint { .. } => event_kinds::BREAKPOINT,
            EventKind::Step { .. } => event_kinds::SINGLE_STEP,
            EventKind::Exception { .. } => event_kinds::EXCEPTION,
            EventKind::MethodEntry { .. } => event_kinds::METHOD_ENTRY,
            EventKind::MethodExit { .. } => event_kinds::METHOD_EXIT,
            EventKind::Unknown { kind } => *kind,
        }
    }
}

impl EventSet {
    pub fn new(suspend_policy: SuspendPolicy, events: Vec<Event>) -> Self {
        let events = events
            .into_iter()
            .map(|mut e| {
                e.suspend_policy = suspend_policy;
                e
            })
            .collect();
        Self {
            suspend_policy,
            events,
        }
    }

    /// Thread whose suspension an event-thread policy refers to.
    pub fn thread(&self) -> Option<ThreadId> {
        self.events.iter().find_map(Event::thread)
    }

    /// Serialize the composite payload (used by the debuggee side).
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.put_u8(self.suspend_policy as u8);
        buf.put_i32(self.events.len() as i32);

        for event in &self.events {
            buf.put_u8(event.details.kind());
            buf.put_i32(event.request_id);
            match &event.details {
                EventKind::VMStart { thread }
                | EventKind::ThreadStart { thread }
                | EventKind::ThreadDeath { thread } => buf.put_u64(*thread),
                EventKind::VMDeath | EventKind::Unknown { .. } => {}
                EventKind::ClassPrepare {
                    thread,
                    ref_type_tag,
                    ref_type,
                    signature,
                    status,
                } => {
                    buf.put_u64(*thread);
                    buf.put_u8(*ref_type_tag);
                    buf.put_u64(*ref_type);
                    put_string(&mut buf, signature);
                    buf.put_i32(*status);
                }
                EventKind::ClassUnload { signature } => put_string(&mut buf, signature),
                EventKind::Breakpoint { thread, location }
                | EventKind::Step { thread, location }
                | EventKind::MethodEntry { thread, location }
                | EventKind::MethodExit { thread, location } => {
                    buf.put_u64(*thread);
                    location.write(&mut buf);
                }
                EventKind::Exception {
                    thread,
                    location,
                    exception,
                    catch_location,
                } => {
                    buf.put_u64(*thread);
                    location.write(&mut buf);
                    buf.put_u8(b'L');
                    buf.put_u64(*exception);
                    match catch_location {
                        Some(catch) => catch.write(&mut buf),
                        None => buf.put_bytes(0, 25),
                    }
                }
            }
        }

        buf
    }
}

fn put_string(buf: &mut Vec<u8>, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

// Event request modifiers
#[derive(Debug, Clone)]
pub enum EventModifier {
    Count(i32),
    ThreadOnly(ThreadId),
    ClassOnly(ReferenceTypeId),
    ClassMatch(String),
    ClassExclude(String),
    LocationOnly(Location),
    ExceptionOnly {
        ref_type: ReferenceTypeId,
        caught: bool,
        uncaught: bool,
    },
    Step {
        thread: ThreadId,
        size: i32,
        depth: i32,
    },
    InstanceOnly(ObjectId),
}

impl EventModifier {
    pub(crate) fn write(&self, buf: &mut Vec<u8>) {
        match self {
            EventModifier::Count(count) => {
                buf.put_u8(modifier_kinds::COUNT);
                buf.put_i32(*count);
            }
            EventModifier::ThreadOnly(thread) => {
                buf.put_u8(modifier_kinds::THREAD_ONLY);
                buf.put_u64(*thread);
            }
            EventModifier::ClassOnly(ref_type) => {
                buf.put_u8(modifier_kinds::CLASS_ONLY);
                buf.put_u64(*ref_type);
            }
            EventModifier::ClassMatch(pattern) => {
                buf.put_u8(modifier_kinds::CLASS_MATCH);
                put_string(buf, pattern);
            }
            EventModifier::ClassExclude(pattern) => {
                buf.put_u8(modifier_kinds::CLASS_EXCLUDE);
                put_string(buf, pattern);
            }
            EventModifier::LocationOnly(location) => {
                buf.put_u8(modifier_kinds::LOCATION_ONLY);
                location.write(buf);
            }
            EventModifier::ExceptionOnly {
                ref_type,
                caught,
                uncaught,
            } => {
                buf.put_u8(modifier_kinds::EXCEPTION_ONLY);
                buf.put_u64(*ref_type);
                buf.put_u8(u8::from(*caught));
                buf.put_u8(u8::from(*uncaught));
            }
            EventModifier::Step {
                thread,
                size,
                depth,
            } => {
                buf.put_u8(modifier_kinds::STEP);
                buf.put_u64(*thread);
                buf.put_i32(*size);
                buf.put_i32(*depth);
            }
            EventModifier::InstanceOnly(object) => {
                buf.put_u8(modifier_kinds::INSTANCE_ONLY);
                buf.put_u64(*object);
            }
        }
    }
}

/// Parse a composite event packet payload
pub fn parse_event_packet(data: &[u8]) -> HarnessResult<EventSet> {
    let mut buf = data;

    let suspend_policy = SuspendPolicy::try_from(read_u8(&mut buf)?)?;
    let event_count = read_i32(&mut buf)?;

    let mut events = Vec::with_capacity(event_count.clamp(0, 64) as usize);

    for _ in 0..event_count {
        let kind = read_u8(&mut buf)?;
        let request_id = read_i32(&mut buf)?;

        let details = match kind {
            event_kinds::BREAKPOINT => {
                let thread = read_u64(&mut buf)?;
                let location = read_location(&mut buf)?;
                EventKind::Breakpoint { thread, location }
            }
            event_kinds::SINGLE_STEP => {
                let thread = read_u64(&mut buf)?;
                let location = read_location(&mut buf)?;
                EventKind::Step { thread, location }
            }
            event_kinds::METHOD_ENTRY => {
                let thread = read_u64(&mut buf)?;
                let location = read_location(&mut buf)?;
                EventKind::MethodEntry { thread, location }
            }
            event_kinds::METHOD_EXIT => {
                let thread = read_u64(&mut buf)?;
                let location = read_location(&mut buf)?;
                EventKind::MethodExit { thread, location }
            }
            event_kinds::EXCEPTION => {
                let thread = read_u64(&mut buf)?;
                let location = read_location(&mut buf)?;
                let _tag = read_u8(&mut buf)?;
                let exception = read_u64(&mut buf)?;
                let catch = read_location(&mut buf)?;
                EventKind::Exception {
                    thread,
                    location,
                    exception,
                    catch_location: if catch.is_null() { None } else { Some(catch) },
                }
            }
            event_kinds::VM_START => {
                let thread = read_u64(&mut buf)?;
                EventKind::VMStart { thread }
            }
            event_kinds::VM_DEATH => EventKind::VMDeath,
            event_kinds::THREAD_START => {
                let thread = read_u64(&mut buf)?;
                EventKind::ThreadStart { thread }
            }
            event_kinds::THREAD_DEATH => {
                let thread = read_u64(&mut buf)?;
                EventKind::ThreadDeath { thread }
            }
            event_kinds::CLASS_PREPARE => {
                let thread = read_u64(&mut buf)?;
                let ref_type_tag = read_u8(&mut buf)?;
                let ref_type = read_u64(&mut buf)?;
                let signature = read_string(&mut buf)?;
                let status = read_i32(&mut buf)?;
                EventKind::ClassPrepare {
                    thread,
                    ref_type_tag,
                    ref_type,
                    signature,
                    status,
                }
            }
            event_kinds::CLASS_UNLOAD => {
                let signature = read_string(&mut buf)?;
                EventKind::ClassUnload { signature }
            }
            _ => {
                // The body length of an unknown kind is unknown, so nothing after it can be parsed
                warn!("Unsupported event kind: {}, skipping rest of event set", kind);
                events.push(Event {
                    kind,
                    request_id,
                    suspend_policy,
                    details: EventKind::Unknown { kind },
                });
                break;
            }
        };

        events.push(Event {
            kind,
            request_id,
            suspend_policy,
            details,
        });
    }

    Ok(EventSet {
        suspend_policy,
        events,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location(index: u64) -> Location {
        Location {
            type_tag: 1,
            class_id: 0x10,
            method_id: 0x20,
            index,
        }
    }

    #[test]
    fn test_parse_encoded_event_set() {
        let set = EventSet::new(
            SuspendPolicy::EventThread,
            vec![
                Event::new(
                    3,
                    EventKind::Breakpoint {
                        thread: 7,
                        location: location(4),
                    },
                ),
                Event::new(
                    4,
                    EventKind::Exception {
                        thread: 7,
                        location: location(9),
                        exception: 0x99,
                        catch_location: None,
                    },
                ),
                Event::new(
                    0,
                    EventKind::ClassUnload {
                        signature: "LFoo;".to_string(),
                    },
                ),
                Event::new(0, EventKind::VMDeath),
            ],
        );

        let parsed = parse_event_packet(&set.encode()).unwrap();
        assert_eq!(parsed, set);
        assert_eq!(parsed.thread(), Some(7));
        assert_eq!(parsed.events[0].location(), Some(&location(4)));
        assert_eq!(parsed.events[2].thread(), None);
        assert!(parsed
            .events
            .iter()
            .all(|e| e.suspend_policy == SuspendPolicy::EventThread));
    }

    #[test]
    fn test_unknown_kind_stops_parsing() {
        let mut data = vec![0u8]; // suspend policy NONE
        data.extend_from_slice(&2i32.to_be_bytes());
        data.push(77); // unknown kind
        data.extend_from_slice(&1i32.to_be_bytes());
        data.extend_from_slice(&[1, 2, 3]);

        let parsed = parse_event_packet(&data).unwrap();
        assert_eq!(parsed.events.len(), 1);
        assert_eq!(parsed.events[0].details, EventKind::Unknown { kind: 77 });
    }

    #[test]
    fn test_invalid_suspend_policy() {
        let data = [9u8, 0, 0, 0, 0];
        assert!(parse_event_packet(&data).is_err());
    }

    #[test]
    fn test_modifier_layout() {
        let mut buf = Vec::new();
        EventModifier::Count(2).write(&mut buf);
        EventModifier::LocationOnly(location(1)).write(&mut buf);
        assert_eq!(buf[0], modifier_kinds::COUNT);
        assert_eq!(&buf[1..5], &[0, 0, 0, 2]);
        assert_eq!(buf[5], modifier_kinds::LOCATION_ONLY);
        assert_eq!(buf.len(), 5 + 1 + 25);
    }
}
