// EventRequest command implementations
//
// Set up event requests (breakpoints, steps, exceptions, etc.)

use crate::commands::{command_sets, event_commands, event_kinds};
use crate::events::EventModifier;
use crate::protocol::{CommandPacket, HarnessError, HarnessResult};
use crate::reader::read_i32;
use crate::session::CommandSession;
use crate::types::{Location, ThreadId};
use bytes::BufMut;
use serde::{Deserialize, Serialize};

/// Suspend policy for events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SuspendPolicy {
    None = 0,
    EventThread = 1,
    All = 2,
}

impl TryFrom<u8> for SuspendPolicy {
    type Error = HarnessError;

    fn try_from(raw: u8) -> HarnessResult<Self> {
        match raw {
            0 => Ok(SuspendPolicy::None),
            1 => Ok(SuspendPolicy::EventThread),
            2 => Ok(SuspendPolicy::All),
            other => Err(HarnessError::Protocol(format!(
                "Invalid suspend policy: {}",
                other
            ))),
        }
    }
}

impl CommandSession {
    /// Register an event request (EventRequest.Set command)
    /// Returns the request ID assigned by the debuggee
    pub async fn set_event_request(
        &self,
        event_kind: u8,
        suspend_policy: SuspendPolicy,
        modifiers: &[EventModifier],
    ) -> HarnessResult<i32> {
        let mut packet =
            CommandPacket::new(self.next_id(), command_sets::EVENT_REQUEST, event_commands::SET);

        packet.data.put_u8(event_kind);
        packet.data.put_u8(suspend_policy as u8);
        packet.data.put_i32(modifiers.len() as i32);
        for modifier in modifiers {
            modifier.write(&mut packet.data);
        }

        let reply = self.command(packet).await?;
        let mut data = reply.data();
        read_i32(&mut data)
    }

    /// Set a breakpoint at a specific location
    pub async fn set_breakpoint(
        &self,
        location: Location,
        suspend_policy: SuspendPolicy,
    ) -> HarnessResult<i32> {
        self.set_event_request(
            event_kinds::BREAKPOINT,
            suspend_policy,
            &[EventModifier::LocationOnly(location)],
        )
        .await
    }

    /// Request a single step on a thread; the request fires once
    pub async fn set_step(
        &self,
        thread: ThreadId,
        size: i32,
        depth: i32,
        suspend_policy: SuspendPolicy,
    ) -> HarnessResult<i32> {
        self.set_event_request(
            event_kinds::SINGLE_STEP,
            suspend_policy,
            &[
                EventModifier::Step {
                    thread,
                    size,
                    depth,
                },
                EventModifier::Count(1),
            ],
        )
        .await
    }

    /// Clear an event request by kind and request ID (EventRequest.Clear command)
    pub async fn clear_event_request(&self, event_kind: u8, request_id: i32) -> HarnessResult<()> {
        let mut packet =
            CommandPacket::new(self.next_id(), command_sets::EVENT_REQUEST, event_commands::CLEAR);

        packet.data.put_u8(event_kind);
        packet.data.put_i32(request_id);

        self.command(packet).await?;
        Ok(())
    }

    /// Clear every breakpoint (EventRequest.ClearAllBreakpoints command)
    pub async fn clear_all_breakpoints(&self) -> HarnessResult<()> {
        let packet = CommandPacket::new(
            self.next_id(),
            command_sets::EVENT_REQUEST,
            event_commands::CLEAR_ALL_BREAKPOINTS,
        );
        self.command(packet).await?;
        Ok(())
    }
}
