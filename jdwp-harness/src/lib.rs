// Debugger/debuggee control protocol and synchronization harness
//
// Implements the pieces a debugger test is built from:
// - Packet framing and a reliable packet transport
// - Command/reply correlation with asynchronous event dispatch
// - Suspend-policy bookkeeping shared by events and resume commands
// - A line-oriented signal pipe for ready/go/quit choreography
// - Debuggee process lifecycle with output capture

pub mod codec;
pub mod commands;
pub mod config;
pub mod dispatcher;
pub mod eventrequest;
pub mod events;
pub mod harness;
pub mod iopipe;
pub mod process;
pub mod protocol;
pub mod reader;
pub mod reftype;
pub mod session;
pub mod suspend;
pub mod thread;
pub mod transport;
pub mod types;
pub mod vm;

mod sync;

#[cfg(any(test, feature = "test-support"))]
pub mod mock;

pub use codec::{PacketBody, PacketCodec};
pub use config::HarnessConfig;
pub use dispatcher::{DispatcherState, EventDispatcher};
pub use eventrequest::SuspendPolicy;
pub use events::{Event, EventKind, EventSet};
pub use harness::{TestBody, TestHarness};
pub use iopipe::{IoPipe, IoPipeListener, Signal};
pub use process::{DebuggeeProcess, ExitStatus, ProcessHarness, ProcessState};
pub use protocol::{ErrorCode, FailureCategory, HarnessError, HarnessResult, Packet};
pub use session::{CommandSession, CorrelationId};
pub use suspend::{ResumedCounts, SuspendState};
pub use transport::Transport;
