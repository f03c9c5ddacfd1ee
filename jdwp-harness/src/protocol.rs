// JDWP-style protocol definitions: packets, error codes and the harness error taxonomy
//
// Reference: https://docs.oracle.com/javase/8/docs/platform/jpda/jdwp/jdwp-protocol.html

use crate::process::{CapturedOutput, ProcessState};
use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;

// All multi-byte values are big-endian (network byte order)

pub type HarnessResult<T> = Result<T, HarnessError>;

/// Which side of the fence a failure lands on when a test is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCategory {
    /// The harness could not establish or maintain the protocol session.
    Infrastructure,
    /// The command or debuggee under test produced an unexpected result.
    TestFailure,
}

#[derive(Debug, Error)]
pub enum HarnessError {
    // Transport level
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection disconnected")]
    Disconnected,

    #[error("Connection closed")]
    Closed,

    #[error("Timed out after {after:?} waiting for {waiting_for}")]
    Timeout {
        waiting_for: String,
        after: Duration,
    },

    #[error("Invalid handshake")]
    InvalidHandshake,

    // Protocol level
    #[error("Truncated packet: need {needed} more bytes")]
    Truncated { needed: usize },

    #[error("Malformed packet header: {0}")]
    MalformedHeader(String),

    #[error("Unknown value tag: {0:#x}")]
    UnknownValueTag(u8),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("No pending command with id {0}")]
    UnknownCorrelation(u32),

    // Application level
    #[error("Error reply {code} to command {command_set}/{command}")]
    ErrorReply {
        code: ErrorCode,
        command_set: u8,
        command: u8,
    },

    #[error("Test failed: {0}")]
    TestFailed(String),

    // Process level
    #[error("Failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Debuggee did not report ready within {after:?}{output}")]
    HandshakeTimeout {
        after: Duration,
        output: CapturedOutput,
    },

    #[error("Debuggee exited early with {code:?}{output}")]
    ExitedEarly {
        code: Option<i32>,
        output: CapturedOutput,
    },

    #[error("Debuggee exited with {code:?}, expected {expected}{output}")]
    UnexpectedExit {
        code: Option<i32>,
        expected: i32,
        output: CapturedOutput,
    },

    #[error("Invalid debuggee state transition {from:?} -> {to:?}")]
    InvalidState { from: ProcessState, to: ProcessState },

    // Signal channel
    #[error("Expected signal '{expected}', got '{got}'")]
    UnexpectedSignal { expected: String, got: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl HarnessError {
    pub(crate) fn timeout(waiting_for: impl Into<String>, after: Duration) -> Self {
        HarnessError::Timeout {
            waiting_for: waiting_for.into(),
            after,
        }
    }

    pub fn category(&self) -> FailureCategory {
        match self {
            HarnessError::ErrorReply { .. }
            | HarnessError::TestFailed(_)
            | HarnessError::UnexpectedExit { .. } => FailureCategory::TestFailure,
            _ => FailureCategory::Infrastructure,
        }
    }

    /// Malformed wire data; fatal to the connection it arrived on.
    pub fn is_decode_error(&self) -> bool {
        matches!(
            self,
            HarnessError::Truncated { .. }
                | HarnessError::MalformedHeader(_)
                | HarnessError::UnknownValueTag(_)
        )
    }

    /// Error code of an error reply, if this is one.
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            HarnessError::ErrorReply { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Exit code of a debuggee whose exit caused this failure.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            HarnessError::ExitedEarly { code, .. } | HarnessError::UnexpectedExit { code, .. } => {
                *code
            }
            _ => None,
        }
    }

    /// Debuggee output attached to a process-level failure.
    pub fn captured_output(&self) -> Option<&CapturedOutput> {
        match self {
            HarnessError::HandshakeTimeout { output, .. }
            | HarnessError::ExitedEarly { output, .. }
            | HarnessError::UnexpectedExit { output, .. } => Some(output),
            _ => None,
        }
    }
}

// Handshake string exchanged right after the socket connects
pub const JDWP_HANDSHAKE: &[u8] = b"JDWP-Handshake";

// Packet structure:
// length (4 bytes) - includes header
// id (4 bytes)
// flags (1 byte) - 0x00 = command, 0x80 = reply
// [Command packet: command set (1 byte) + command (1 byte)]
// [Reply packet: error code (2 bytes)]
// data (variable)

pub const HEADER_SIZE: usize = 11;
pub const COMMAND_FLAG: u8 = 0x00;
pub const REPLY_FLAG: u8 = 0x80;

/// Maximum allowed packet size (10MB)
/// This prevents memory exhaustion from malicious or buggy peers
pub const MAX_PACKET_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPacket {
    pub id: u32,
    pub flags: u8,
    pub command_set: u8,
    pub command: u8,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyPacket {
    pub id: u32,
    pub flags: u8,
    pub error_code: u16,
    pub data: Bytes,
}

/// A decoded unit off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Command(CommandPacket),
    Reply(ReplyPacket),
}

impl Packet {
    pub fn id(&self) -> u32 {
        match self {
            Packet::Command(p) => p.id,
            Packet::Reply(p) => p.id,
        }
    }

    /// Total serialized size, header included.
    pub fn length(&self) -> usize {
        HEADER_SIZE
            + match self {
                Packet::Command(p) => p.data.len(),
                Packet::Reply(p) => p.data.len(),
            }
    }
}

impl From<CommandPacket> for Packet {
    fn from(p: CommandPacket) -> Self {
        Packet::Command(p)
    }
}

impl From<ReplyPacket> for Packet {
    fn from(p: ReplyPacket) -> Self {
        Packet::Reply(p)
    }
}

impl CommandPacket {
    pub fn new(id: u32, command_set: u8, command: u8) -> Self {
        Self {
            id,
            flags: COMMAND_FLAG,
            command_set,
            command,
            data: Vec::new(),
        }
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }
}

impl ReplyPacket {
    pub fn new(id: u32, error_code: u16, data: impl Into<Bytes>) -> Self {
        Self {
            id,
            flags: REPLY_FLAG,
            error_code,
            data: data.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error_code != 0
    }

    pub fn code(&self) -> ErrorCode {
        ErrorCode::from(self.error_code)
    }

    /// Turn a non-zero error code into a typed error, keeping the command for context.
    pub fn check_error(&self, command_set: u8, command: u8) -> HarnessResult<()> {
        if self.is_error() {
            Err(HarnessError::ErrorReply {
                code: self.code(),
                command_set,
                command,
            })
        } else {
            Ok(())
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// Error codes carried by reply packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    None,
    InvalidThread,
    InvalidThreadGroup,
    InvalidPriority,
    ThreadNotSuspended,
    ThreadSuspended,
    InvalidObject,
    InvalidClass,
    ClassNotPrepared,
    InvalidMethodId,
    InvalidLocation,
    InvalidFieldId,
    InvalidFrameId,
    NoMoreFrames,
    OpaqueFrame,
    NotCurrentFrame,
    TypeMismatch,
    InvalidSlot,
    Duplicate,
    NotFound,
    InvalidMonitor,
    NotMonitorOwner,
    Interrupt,
    NotImplemented,
    NullPointer,
    AbsentInformation,
    InvalidEventType,
    IllegalArgument,
    OutOfMemory,
    AccessDenied,
    VmDead,
    Internal,
    UnattachedThread,
    InvalidTag,
    AlreadyInvoking,
    InvalidIndex,
    InvalidLength,
    InvalidString,
    InvalidClassLoader,
    InvalidArray,
    InvalidCount,
    Other(u16),
}

const ERROR_CODES: &[(u16, ErrorCode, &str)] = &[
    (0, ErrorCode::None, "NONE"),
    (10, ErrorCode::InvalidThread, "INVALID_THREAD"),
    (11, ErrorCode::InvalidThreadGroup, "INVALID_THREAD_GROUP"),
    (12, ErrorCode::InvalidPriority, "INVALID_PRIORITY"),
    (13, ErrorCode::ThreadNotSuspended, "THREAD_NOT_SUSPENDED"),
    (14, ErrorCode::ThreadSuspended, "THREAD_SUSPENDED"),
    (20, ErrorCode::InvalidObject, "INVALID_OBJECT"),
    (21, ErrorCode::InvalidClass, "INVALID_CLASS"),
    (22, ErrorCode::ClassNotPrepared, "CLASS_NOT_PREPARED"),
    (23, ErrorCode::InvalidMethodId, "INVALID_METHODID"),
    (24, ErrorCode::InvalidLocation, "INVALID_LOCATION"),
    (25, ErrorCode::InvalidFieldId, "INVALID_FIELDID"),
    (30, ErrorCode::InvalidFrameId, "INVALID_FRAMEID"),
    (31, ErrorCode::NoMoreFrames, "NO_MORE_FRAMES"),
    (32, ErrorCode::OpaqueFrame, "OPAQUE_FRAME"),
    (33, ErrorCode::NotCurrentFrame, "NOT_CURRENT_FRAME"),
    (34, ErrorCode::TypeMismatch, "TYPE_MISMATCH"),
    (35, ErrorCode::InvalidSlot, "INVALID_SLOT"),
    (40, ErrorCode::Duplicate, "DUPLICATE"),
    (41, ErrorCode::NotFound, "NOT_FOUND"),
    (50, ErrorCode::InvalidMonitor, "INVALID_MONITOR"),
    (51, ErrorCode::NotMonitorOwner, "NOT_MONITOR_OWNER"),
    (52, ErrorCode::Interrupt, "INTERRUPT"),
    (99, ErrorCode::NotImplemented, "NOT_IMPLEMENTED"),
    (100, ErrorCode::NullPointer, "NULL_POINTER"),
    (101, ErrorCode::AbsentInformation, "ABSENT_INFORMATION"),
    (102, ErrorCode::InvalidEventType, "INVALID_EVENT_TYPE"),
    (103, ErrorCode::IllegalArgument, "ILLEGAL_ARGUMENT"),
    (110, ErrorCode::OutOfMemory, "OUT_OF_MEMORY"),
    (111, ErrorCode::AccessDenied, "ACCESS_DENIED"),
    (112, ErrorCode::VmDead, "VM_DEAD"),
    (113, ErrorCode::Internal, "INTERNAL"),
    (115, ErrorCode::UnattachedThread, "UNATTACHED_THREAD"),
    (500, ErrorCode::InvalidTag, "INVALID_TAG"),
    (502, ErrorCode::AlreadyInvoking, "ALREADY_INVOKING"),
    (503, ErrorCode::InvalidIndex, "INVALID_INDEX"),
    (504, ErrorCode::InvalidLength, "INVALID_LENGTH"),
    (506, ErrorCode::InvalidString, "INVALID_STRING"),
    (507, ErrorCode::InvalidClassLoader, "INVALID_CLASS_LOADER"),
    (508, ErrorCode::InvalidArray, "INVALID_ARRAY"),
    (512, ErrorCode::InvalidCount, "INVALID_COUNT"),
];

impl ErrorCode {
    pub fn code(self) -> u16 {
        if let ErrorCode::Other(code) = self {
            return code;
        }
        ERROR_CODES
            .iter()
            .find(|(_, known, _)| *known == self)
            .map(|(code, _, _)| *code)
            .unwrap_or_default()
    }

    pub fn name(self) -> &'static str {
        ERROR_CODES
            .iter()
            .find(|(_, known, _)| *known == self)
            .map(|(_, _, name)| *name)
            .unwrap_or("UNKNOWN_ERROR")
    }
}

impl From<u16> for ErrorCode {
    fn from(code: u16) -> Self {
        ERROR_CODES
            .iter()
            .find(|(known, _, _)| *known == code)
            .map(|(_, variant, _)| *variant)
            .unwrap_or(ErrorCode::Other(code))
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name(), self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(ErrorCode::from(103), ErrorCode::IllegalArgument);
        assert_eq!(ErrorCode::IllegalArgument.code(), 103);
        assert_eq!(ErrorCode::from(11).name(), "INVALID_THREAD_GROUP");
        assert_eq!(ErrorCode::from(20), ErrorCode::InvalidObject);
        assert_eq!(ErrorCode::from(21), ErrorCode::InvalidClass);

        let unknown = ErrorCode::from(4242);
        assert_eq!(unknown, ErrorCode::Other(4242));
        assert_eq!(unknown.code(), 4242);
        assert_eq!(unknown.name(), "UNKNOWN_ERROR");
    }

    #[test]
    fn test_reply_check_error() {
        let ok = ReplyPacket::new(1, 0, Vec::new());
        assert!(ok.check_error(2, 16).is_ok());

        let failed = ReplyPacket::new(2, 103, Vec::new());
        let err = failed.check_error(2, 16).unwrap_err();
        assert_eq!(err.error_code(), Some(ErrorCode::IllegalArgument));
        assert_eq!(err.category(), FailureCategory::TestFailure);
    }

    #[test]
    fn test_failure_categories() {
        assert_eq!(
            HarnessError::Disconnected.category(),
            FailureCategory::Infrastructure
        );
        assert_eq!(
            HarnessError::timeout("reply", Duration::from_secs(1)).category(),
            FailureCategory::Infrastructure
        );
        assert_eq!(
            HarnessError::TestFailed("bad value".to_string()).category(),
            FailureCategory::TestFailure
        );
    }

    #[test]
    fn test_packet_length_includes_header() {
        let packet = Packet::from(CommandPacket::new(1, 1, 1).with_data(vec![1, 2, 3]));
        assert_eq!(packet.length(), HEADER_SIZE + 3);
        assert_eq!(packet.id(), 1);
    }
}
