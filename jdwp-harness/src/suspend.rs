// Suspend/resume bookkeeping for one debuggee
//
// Counts mirror the debuggee's own: a thread suspended n times must be resumed
// n times. The VM-wide count applies to every thread without an entry of its
// own; suspending or resuming the whole VM moves every entry as well.

use crate::eventrequest::SuspendPolicy;
use crate::sync::lock;
use crate::types::ThreadId;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct Counts {
    vm: u32,
    threads: HashMap<ThreadId, u32>,
}

impl Counts {
    fn thread(&self, thread: ThreadId) -> u32 {
        self.threads.get(&thread).copied().unwrap_or(self.vm)
    }
}

/// Counts lowered by one `resume_all`, so a failed resume can be undone
/// exactly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResumedCounts {
    vm: bool,
    threads: Vec<ThreadId>,
}

impl ResumedCounts {
    /// Nothing was suspended.
    pub fn is_empty(&self) -> bool {
        !self.vm && self.threads.is_empty()
    }
}

/// Monitor-guarded suspend counts shared by the command session and the
/// event dispatcher.
#[derive(Debug, Default)]
pub struct SuspendState {
    counts: Mutex<Counts>,
}

impl SuspendState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply the suspension an event set's policy implies.
    pub fn record_event(&self, policy: SuspendPolicy, thread: Option<ThreadId>) {
        match (policy, thread) {
            (SuspendPolicy::None, _) => {}
            (SuspendPolicy::All, _) => self.suspend_all(),
            (SuspendPolicy::EventThread, Some(thread)) => self.suspend_thread(thread),
            (SuspendPolicy::EventThread, None) => {
                warn!("Event-thread suspend policy on an event without a thread");
            }
        }
    }

    pub fn suspend_all(&self) {
        let mut counts = lock(&self.counts, "suspend_all");
        counts.vm += 1;
        for count in counts.threads.values_mut() {
            *count += 1;
        }
        debug!("VM suspended (count={})", counts.vm);
    }

    /// Resume every thread once, returning what was actually lowered.
    pub fn resume_all(&self) -> ResumedCounts {
        let mut counts = lock(&self.counts, "resume_all");
        let mut resumed = ResumedCounts {
            vm: counts.vm > 0,
            threads: Vec::new(),
        };
        counts.vm = counts.vm.saturating_sub(1);
        for (thread, count) in counts.threads.iter_mut() {
            if *count > 0 {
                *count -= 1;
                resumed.threads.push(*thread);
            }
        }
        debug!("VM resumed (count={})", counts.vm);
        resumed
    }

    /// Undo a `resume_all` whose command never took effect.
    pub fn restore_resume_all(&self, resumed: &ResumedCounts) {
        let mut counts = lock(&self.counts, "restore_resume_all");
        if resumed.vm {
            counts.vm += 1;
        }
        for thread in &resumed.threads {
            *counts.threads.entry(*thread).or_insert(0) += 1;
        }
        debug!("VM resume undone (count={})", counts.vm);
    }

    pub fn suspend_thread(&self, thread: ThreadId) {
        let mut counts = lock(&self.counts, "suspend_thread");
        let vm = counts.vm;
        *counts.threads.entry(thread).or_insert(vm) += 1;
    }

    /// Resume one thread once. Returns false if it was not suspended.
    pub fn resume_thread(&self, thread: ThreadId) -> bool {
        let mut counts = lock(&self.counts, "resume_thread");
        let vm = counts.vm;
        let count = counts.threads.entry(thread).or_insert(vm);
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }

    pub fn suspend_count(&self, thread: ThreadId) -> u32 {
        lock(&self.counts, "suspend_count").thread(thread)
    }

    pub fn is_suspended(&self, thread: ThreadId) -> bool {
        self.suspend_count(thread) > 0
    }

    pub fn vm_suspend_count(&self) -> u32 {
        lock(&self.counts, "vm_suspend_count").vm
    }

    /// Forget everything, e.g. after the VM died.
    pub fn reset(&self) {
        let mut counts = lock(&self.counts, "reset");
        counts.vm = 0;
        counts.threads.clear();
    }
}
