// Protocol type definitions
//
// Common types used across commands, replies and events

use crate::protocol::{HarnessError, HarnessResult};
use bytes::BufMut;
use serde::{Deserialize, Serialize};

// Object IDs are 8 bytes on the wire
pub type ObjectId = u64;
pub type ThreadId = ObjectId;
pub type ThreadGroupId = ObjectId;
pub type StringId = ObjectId;

pub type ReferenceTypeId = u64;
pub type ClassId = ReferenceTypeId;

pub type MethodId = u64;
pub type FieldId = u64;
pub type FrameId = u64;

// Location identifies a code position
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub type_tag: u8, // 1=class, 2=interface, 3=array
    pub class_id: ReferenceTypeId,
    pub method_id: MethodId,
    pub index: u64, // bytecode index (PC)
}

impl Location {
    pub(crate) fn write(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.type_tag);
        buf.put_u64(self.class_id);
        buf.put_u64(self.method_id);
        buf.put_u64(self.index);
    }

    /// The all-zero location some events use for "absent".
    pub fn is_null(&self) -> bool {
        self.type_tag == 0 && self.class_id == 0 && self.method_id == 0 && self.index == 0
    }
}

// Thread status values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum ThreadStatus {
    Zombie = 0,
    Running = 1,
    Sleeping = 2,
    Monitor = 3,
    Wait = 4,
}

impl TryFrom<i32> for ThreadStatus {
    type Error = HarnessError;

    fn try_from(raw: i32) -> HarnessResult<Self> {
        match raw {
            0 => Ok(ThreadStatus::Zombie),
            1 => Ok(ThreadStatus::Running),
            2 => Ok(ThreadStatus::Sleeping),
            3 => Ok(ThreadStatus::Monitor),
            4 => Ok(ThreadStatus::Wait),
            other => Err(HarnessError::Protocol(format!(
                "Unknown thread status: {}",
                other
            ))),
        }
    }
}

// Type tags for values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Tag {
    Array = 91,        // '['
    Byte = 66,         // 'B'
    Char = 67,         // 'C'
    Object = 76,       // 'L'
    Float = 70,        // 'F'
    Double = 68,       // 'D'
    Int = 73,          // 'I'
    Long = 74,         // 'J'
    Short = 83,        // 'S'
    Void = 86,         // 'V'
    Boolean = 90,      // 'Z'
    String = 115,      // 's'
    Thread = 116,      // 't'
    ThreadGroup = 103, // 'g'
    ClassLoader = 108, // 'l'
    ClassObject = 99,  // 'c'
}

impl Tag {
    /// Tags whose payload is an 8-byte object id.
    pub fn is_reference(self) -> bool {
        matches!(
            self,
            Tag::Array
                | Tag::Object
                | Tag::Thread
                | Tag::ThreadGroup
                | Tag::ClassLoader
                | Tag::ClassObject
        )
    }
}

impl TryFrom<u8> for Tag {
    type Error = HarnessError;

    fn try_from(raw: u8) -> HarnessResult<Self> {
        let tag = match raw {
            b'[' => Tag::Array,
            b'B' => Tag::Byte,
            b'C' => Tag::Char,
            b'L' => Tag::Object,
            b'F' => Tag::Float,
            b'D' => Tag::Double,
            b'I' => Tag::Int,
            b'J' => Tag::Long,
            b'S' => Tag::Short,
            b'V' => Tag::Void,
            b'Z' => Tag::Boolean,
            b's' => Tag::String,
            b't' => Tag::Thread,
            b'g' => Tag::ThreadGroup,
            b'l' => Tag::ClassLoader,
            b'c' => Tag::ClassObject,
            other => return Err(HarnessError::UnknownValueTag(other)),
        };
        Ok(tag)
    }
}

/// Tagged value: a remote reference, a primitive or a string.
///
/// On the wire a value is its one-byte [`Tag`] followed by the tag-specific
/// body: an 8-byte id for references, the natural width for primitives and a
/// `u32` length plus UTF-8 bytes for strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Value {
    Byte(i8),
    Char(u16),
    Float(f32),
    Double(f64),
    Int(i32),
    Long(i64),
    Short(i16),
    Boolean(bool),
    Void,
    String(String),
    Reference { tag: Tag, id: ObjectId },
}

impl Value {
    pub fn object(id: ObjectId) -> Self {
        Value::Reference {
            tag: Tag::Object,
            id,
        }
    }

    pub fn thread(id: ThreadId) -> Self {
        Value::Reference {
            tag: Tag::Thread,
            id,
        }
    }

    /// Referenced object id, for reference values.
    pub fn object_id(&self) -> Option<ObjectId> {
        match self {
            Value::Reference { id, .. } => Some(*id),
            _ => None,
        }
    }

    pub fn tag(&self) -> Tag {
        match self {
            Value::Byte(_) => Tag::Byte,
            Value::Char(_) => Tag::Char,
            Value::Float(_) => Tag::Float,
            Value::Double(_) => Tag::Double,
            Value::Int(_) => Tag::Int,
            Value::Long(_) => Tag::Long,
            Value::Short(_) => Tag::Short,
            Value::Boolean(_) => Tag::Boolean,
            Value::Void => Tag::Void,
            Value::String(_) => Tag::String,
            Value::Reference { tag, .. } => *tag,
        }
    }

    /// Write the tag byte followed by the body.
    pub fn write_tagged(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.tag() as u8);
        self.write_untagged(buf);
    }

    /// Write only the body; the reader must already know the tag.
    pub fn write_untagged(&self, buf: &mut impl BufMut) {
        match self {
            Value::Byte(v) => buf.put_i8(*v),
            Value::Char(v) => buf.put_u16(*v),
            Value::Float(v) => buf.put_f32(*v),
            Value::Double(v) => buf.put_f64(*v),
            Value::Int(v) => buf.put_i32(*v),
            Value::Long(v) => buf.put_i64(*v),
            Value::Short(v) => buf.put_i16(*v),
            Value::Boolean(v) => buf.put_u8(u8::from(*v)),
            Value::Void => {}
            Value::String(s) => {
                buf.put_u32(s.len() as u32);
                buf.put_slice(s.as_bytes());
            }
            Value::Reference { id, .. } => buf.put_u64(*id),
        }
    }

    /// Format value for display
    pub fn format(&self) -> String {
        match self {
            Value::Byte(v) => format!("(byte) {}", v),
            Value::Char(v) => format!("(char) '{}'", char::from_u32(*v as u32).unwrap_or('?')),
            Value::Float(v) => format!("(float) {}", v),
            Value::Double(v) => format!("(double) {}", v),
            Value::Int(v) => format!("(int) {}", v),
            Value::Long(v) => format!("(long) {}", v),
            Value::Short(v) => format!("(short) {}", v),
            Value::Boolean(v) => format!("(boolean) {}", v),
            Value::Void => "(void)".to_string(),
            Value::String(s) => format!("(string) \"{}\"", s),
            Value::Reference { id, .. } => {
                if *id == 0 {
                    "(object) null".to_string()
                } else {
                    format!("(object) @{:x}", id)
                }
            }
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.format())
    }
}
