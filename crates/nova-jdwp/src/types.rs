use std::io;

use thiserror::Error;

pub type ObjectId = u64;
pub type ThreadId = u64;
pub type ReferenceTypeId = u64;
pub type MethodId = u64;
pub type FieldId = u64;
pub type FrameId = u64;

#[derive(Debug, Error)]
pub enum JdwpError {
    #[error("JDWP protocol error: {0}")]
    Protocol(String),
    #[error("invalid JDWP value tag {0:#04x}")]
    InvalidTag(u8),
    #[error("JDWP handshake failed")]
    HandshakeFailed,
    #[error("JDWP operation timed out")]
    Timeout,
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T, E = JdwpError> = std::result::Result<T, E>;

/// Identifier widths negotiated through `VirtualMachine.IDSizes`.
///
/// The agent picks these once per session; every id written or read during the
/// session uses the same widths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JdwpIdSizes {
    pub field_id: usize,
    pub method_id: usize,
    pub object_id: usize,
    pub reference_type_id: usize,
    pub frame_id: usize,
}

impl JdwpIdSizes {
    pub const fn uniform(size: usize) -> Self {
        Self {
            field_id: size,
            method_id: size,
            object_id: size,
            reference_type_id: size,
            frame_id: size,
        }
    }

    pub fn is_valid(&self) -> bool {
        [
            self.field_id,
            self.method_id,
            self.object_id,
            self.reference_type_id,
            self.frame_id,
        ]
        .iter()
        .all(|size| matches!(size, 1..=8))
    }
}

impl Default for JdwpIdSizes {
    fn default() -> Self {
        Self::uniform(8)
    }
}

/// An executable position: `(type tag, class, method, code index)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Location {
    pub type_tag: u8,
    pub class_id: ReferenceTypeId,
    pub method_id: MethodId,
    pub index: u64,
}

impl Location {
    /// The all-zero location JDWP uses for "no location" (e.g. an uncaught
    /// exception's catch location).
    pub const NONE: Location = Location {
        type_tag: 0,
        class_id: 0,
        method_id: 0,
        index: 0,
    };
}

/// A tagged JDWP value as it appears in commands, replies and events.
#[derive(Clone, Debug, PartialEq)]
pub enum JdwpValue {
    Void,
    Boolean(bool),
    Byte(i8),
    Char(u16),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    /// Any reference value. `tag` is one of the reference tags (`L`, `s`, `[`,
    /// `t`, `g`, `l`, `c`); `id == 0` is `null`.
    Object { tag: u8, id: ObjectId },
}

impl JdwpValue {
    pub const fn null() -> Self {
        JdwpValue::Object {
            tag: TAG_OBJECT,
            id: 0,
        }
    }

    pub fn tag(&self) -> u8 {
        match *self {
            JdwpValue::Void => TAG_VOID,
            JdwpValue::Boolean(_) => TAG_BOOLEAN,
            JdwpValue::Byte(_) => TAG_BYTE,
            JdwpValue::Char(_) => TAG_CHAR,
            JdwpValue::Short(_) => TAG_SHORT,
            JdwpValue::Int(_) => TAG_INT,
            JdwpValue::Long(_) => TAG_LONG,
            JdwpValue::Float(_) => TAG_FLOAT,
            JdwpValue::Double(_) => TAG_DOUBLE,
            JdwpValue::Object { tag, .. } => tag,
        }
    }

    pub fn object_id(&self) -> Option<ObjectId> {
        match *self {
            JdwpValue::Object { id, .. } => Some(id),
            _ => None,
        }
    }
}

// Value tags (JDWP `Tag` constants).
pub const TAG_ARRAY: u8 = b'[';
pub const TAG_BYTE: u8 = b'B';
pub const TAG_CHAR: u8 = b'C';
pub const TAG_OBJECT: u8 = b'L';
pub const TAG_FLOAT: u8 = b'F';
pub const TAG_DOUBLE: u8 = b'D';
pub const TAG_INT: u8 = b'I';
pub const TAG_LONG: u8 = b'J';
pub const TAG_SHORT: u8 = b'S';
pub const TAG_VOID: u8 = b'V';
pub const TAG_BOOLEAN: u8 = b'Z';
pub const TAG_STRING: u8 = b's';
pub const TAG_THREAD: u8 = b't';
pub const TAG_THREAD_GROUP: u8 = b'g';
pub const TAG_CLASS_LOADER: u8 = b'l';
pub const TAG_CLASS_OBJECT: u8 = b'c';

pub fn is_primitive_tag(tag: u8) -> bool {
    matches!(
        tag,
        TAG_BYTE | TAG_CHAR | TAG_FLOAT | TAG_DOUBLE | TAG_INT | TAG_LONG | TAG_SHORT | TAG_BOOLEAN
    )
}

pub fn is_reference_tag(tag: u8) -> bool {
    matches!(
        tag,
        TAG_ARRAY
            | TAG_OBJECT
            | TAG_STRING
            | TAG_THREAD
            | TAG_THREAD_GROUP
            | TAG_CLASS_LOADER
            | TAG_CLASS_OBJECT
    )
}

// `TypeTag` constants.
pub const TYPE_TAG_CLASS: u8 = 1;
pub const TYPE_TAG_INTERFACE: u8 = 2;
pub const TYPE_TAG_ARRAY: u8 = 3;

// Command sets.
pub const COMMAND_SET_VIRTUAL_MACHINE: u8 = 1;
pub const COMMAND_SET_REFERENCE_TYPE: u8 = 2;
pub const COMMAND_SET_CLASS_TYPE: u8 = 3;
pub const COMMAND_SET_METHOD: u8 = 6;
pub const COMMAND_SET_OBJECT_REFERENCE: u8 = 9;
pub const COMMAND_SET_STRING_REFERENCE: u8 = 10;
pub const COMMAND_SET_THREAD_REFERENCE: u8 = 11;
pub const COMMAND_SET_EVENT_REQUEST: u8 = 15;
pub const COMMAND_SET_STACK_FRAME: u8 = 16;
pub const COMMAND_SET_EVENT: u8 = 64;
pub const COMMAND_EVENT_COMPOSITE: u8 = 100;
pub const COMMAND_SET_DDM: u8 = 199;
pub const COMMAND_DDM_CHUNK: u8 = 1;

// Event kinds.
pub const EVENT_KIND_SINGLE_STEP: u8 = 1;
pub const EVENT_KIND_BREAKPOINT: u8 = 2;
pub const EVENT_KIND_FRAME_POP: u8 = 3;
pub const EVENT_KIND_EXCEPTION: u8 = 4;
pub const EVENT_KIND_USER_DEFINED: u8 = 5;
pub const EVENT_KIND_THREAD_START: u8 = 6;
pub const EVENT_KIND_THREAD_DEATH: u8 = 7;
pub const EVENT_KIND_CLASS_PREPARE: u8 = 8;
pub const EVENT_KIND_CLASS_UNLOAD: u8 = 9;
pub const EVENT_KIND_CLASS_LOAD: u8 = 10;
pub const EVENT_KIND_FIELD_ACCESS: u8 = 20;
pub const EVENT_KIND_FIELD_MODIFICATION: u8 = 21;
pub const EVENT_KIND_EXCEPTION_CATCH: u8 = 30;
pub const EVENT_KIND_METHOD_ENTRY: u8 = 40;
pub const EVENT_KIND_METHOD_EXIT: u8 = 41;
pub const EVENT_KIND_METHOD_EXIT_WITH_RETURN_VALUE: u8 = 42;
pub const EVENT_KIND_VM_START: u8 = 90;
pub const EVENT_KIND_VM_DEATH: u8 = 99;
pub const EVENT_KIND_VM_DISCONNECT: u8 = 100;

// Event request modifier kinds.
pub const EVENT_MODIFIER_KIND_COUNT: u8 = 1;
pub const EVENT_MODIFIER_KIND_CONDITIONAL: u8 = 2;
pub const EVENT_MODIFIER_KIND_THREAD_ONLY: u8 = 3;
pub const EVENT_MODIFIER_KIND_CLASS_ONLY: u8 = 4;
pub const EVENT_MODIFIER_KIND_CLASS_MATCH: u8 = 5;
pub const EVENT_MODIFIER_KIND_CLASS_EXCLUDE: u8 = 6;
pub const EVENT_MODIFIER_KIND_LOCATION_ONLY: u8 = 7;
pub const EVENT_MODIFIER_KIND_EXCEPTION_ONLY: u8 = 8;
pub const EVENT_MODIFIER_KIND_FIELD_ONLY: u8 = 9;
pub const EVENT_MODIFIER_KIND_STEP: u8 = 10;
pub const EVENT_MODIFIER_KIND_INSTANCE_ONLY: u8 = 11;
pub const EVENT_MODIFIER_KIND_SOURCE_NAME_MATCH: u8 = 12;

// Suspend policies, ordered by strength.
pub const SUSPEND_POLICY_NONE: u8 = 0;
pub const SUSPEND_POLICY_EVENT_THREAD: u8 = 1;
pub const SUSPEND_POLICY_ALL: u8 = 2;

pub const STEP_SIZE_MIN: u32 = 0;
pub const STEP_SIZE_LINE: u32 = 1;
pub const STEP_DEPTH_INTO: u32 = 0;
pub const STEP_DEPTH_OVER: u32 = 1;
pub const STEP_DEPTH_OUT: u32 = 2;

pub const THREAD_STATUS_ZOMBIE: u32 = 0;
pub const THREAD_STATUS_RUNNING: u32 = 1;
pub const THREAD_STATUS_SLEEPING: u32 = 2;
pub const THREAD_STATUS_MONITOR: u32 = 3;
pub const THREAD_STATUS_WAIT: u32 = 4;
pub const SUSPEND_STATUS_SUSPENDED: u32 = 1;

pub const CLASS_STATUS_VERIFIED: u32 = 1;
pub const CLASS_STATUS_PREPARED: u32 = 2;
pub const CLASS_STATUS_INITIALIZED: u32 = 4;
pub const CLASS_STATUS_ERROR: u32 = 8;

pub const INVOKE_SINGLE_THREADED: u32 = 0x01;
pub const INVOKE_NONVIRTUAL: u32 = 0x02;

// Access flags reported in `modBits`.
pub const ACC_PUBLIC: u32 = 0x0001;
pub const ACC_PRIVATE: u32 = 0x0002;
pub const ACC_STATIC: u32 = 0x0008;
pub const ACC_FINAL: u32 = 0x0010;
pub const ACC_NATIVE: u32 = 0x0100;
pub const ACC_ABSTRACT: u32 = 0x0400;

// JDWP error codes.
pub const ERROR_NONE: u16 = 0;
pub const ERROR_INVALID_THREAD: u16 = 10;
pub const ERROR_THREAD_NOT_SUSPENDED: u16 = 13;
pub const ERROR_THREAD_SUSPENDED: u16 = 14;
pub const ERROR_THREAD_NOT_ALIVE: u16 = 15;
pub const ERROR_INVALID_OBJECT: u16 = 20;
pub const ERROR_INVALID_CLASS: u16 = 21;
pub const ERROR_INVALID_METHODID: u16 = 23;
pub const ERROR_INVALID_LOCATION: u16 = 24;
pub const ERROR_INVALID_FIELDID: u16 = 25;
pub const ERROR_INVALID_FRAMEID: u16 = 30;
pub const ERROR_NO_MORE_FRAMES: u16 = 31;
pub const ERROR_TYPE_MISMATCH: u16 = 34;
pub const ERROR_INVALID_SLOT: u16 = 35;
pub const ERROR_DUPLICATE: u16 = 40;
pub const ERROR_NOT_FOUND: u16 = 41;
pub const ERROR_NOT_IMPLEMENTED: u16 = 99;
pub const ERROR_ABSENT_INFORMATION: u16 = 101;
pub const ERROR_INVALID_EVENT_TYPE: u16 = 102;
pub const ERROR_ILLEGAL_ARGUMENT: u16 = 103;
pub const ERROR_OUT_OF_MEMORY: u16 = 110;
pub const ERROR_VM_DEAD: u16 = 112;
pub const ERROR_INTERNAL: u16 = 113;
pub const ERROR_INVALID_TAG: u16 = 500;
pub const ERROR_ALREADY_INVOKING: u16 = 502;
pub const ERROR_INVALID_LENGTH: u16 = 504;
