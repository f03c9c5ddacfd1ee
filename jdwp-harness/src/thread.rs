// ThreadReference command implementations
//
// Commands for working with threads (name, status, suspend/resume, stop,
// early return)

use crate::commands::{command_sets, thread_commands};
use crate::protocol::{CommandPacket, HarnessResult};
use crate::reader::{read_i32, read_string};
use crate::session::CommandSession;
use crate::types::{ObjectId, ThreadId, ThreadStatus, Value};
use bytes::BufMut;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Reply of ThreadReference.Status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadState {
    pub status: ThreadStatus,
    pub suspended: bool,
}

impl CommandSession {
    fn thread_command(&self, command: u8, thread_id: ThreadId) -> CommandPacket {
        let mut packet = CommandPacket::new(self.next_id(), command_sets::THREAD_REFERENCE, command);
        packet.data.put_u64(thread_id);
        packet
    }

    /// Get a thread's name (ThreadReference.Name)
    pub async fn thread_name(&self, thread_id: ThreadId) -> HarnessResult<String> {
        let reply = self
            .command(self.thread_command(thread_commands::NAME, thread_id))
            .await?;
        let mut data = reply.data();
        read_string(&mut data)
    }

    /// Suspend one thread (ThreadReference.Suspend)
    pub async fn suspend_thread(&self, thread_id: ThreadId) -> HarnessResult<()> {
        self.command(self.thread_command(thread_commands::SUSPEND, thread_id))
            .await?;
        self.suspend_state().suspend_thread(thread_id);
        Ok(())
    }

    /// Resume one thread (ThreadReference.Resume)
    pub async fn resume_thread(&self, thread_id: ThreadId) -> HarnessResult<()> {
        // Count first, so a suspending event right after the resume adds to it
        let decremented = self.suspend_state().resume_thread(thread_id);
        if !decremented {
            debug!("Resuming thread {} that is not recorded as suspended", thread_id);
        }

        if let Err(e) = self
            .command(self.thread_command(thread_commands::RESUME, thread_id))
            .await
        {
            if decremented {
                self.suspend_state().suspend_thread(thread_id);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Get thread and suspend status (ThreadReference.Status)
    pub async fn thread_status(&self, thread_id: ThreadId) -> HarnessResult<ThreadState> {
        let reply = self
            .command(self.thread_command(thread_commands::STATUS, thread_id))
            .await?;
        let mut data = reply.data();

        let status = ThreadStatus::try_from(read_i32(&mut data)?)?;
        let suspend_status = read_i32(&mut data)?;

        Ok(ThreadState {
            status,
            // SUSPEND_STATUS_SUSPENDED
            suspended: suspend_status & 0x1 != 0,
        })
    }

    /// How many times the debuggee has the thread suspended (ThreadReference.SuspendCount)
    pub async fn thread_suspend_count(&self, thread_id: ThreadId) -> HarnessResult<i32> {
        let reply = self
            .command(self.thread_command(thread_commands::SUSPEND_COUNT, thread_id))
            .await?;
        let mut data = reply.data();
        read_i32(&mut data)
    }

    /// Kill a thread by throwing `exception` in it (ThreadReference.Stop)
    pub async fn stop_thread(&self, thread_id: ThreadId, exception: ObjectId) -> HarnessResult<()> {
        let mut packet = self.thread_command(thread_commands::STOP, thread_id);
        packet.data.put_u64(exception);
        self.command(packet).await?;
        Ok(())
    }

    /// Pop the current frame returning `value` (ThreadReference.ForceEarlyReturn)
    ///
    /// The thread must be suspended; otherwise the debuggee answers with
    /// THREAD_NOT_SUSPENDED.
    pub async fn force_early_return(&self, thread_id: ThreadId, value: &Value) -> HarnessResult<()> {
        let mut packet = self.thread_command(thread_commands::FORCE_EARLY_RETURN, thread_id);
        value.write_tagged(&mut packet.data);
        self.command(packet).await?;
        Ok(())
    }
}
