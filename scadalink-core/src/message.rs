//! Message type for the scadalink wire protocol
//!
//! A `Message` is the opaque unit exchanged between peers: a command code
//! identifying its request/response semantics, a per-connection sequence
//! number, a reply sequence correlating it to an earlier request (0 for
//! unsolicited messages), and a string-keyed map of typed field values.
//!
//! Messages are built by the caller and treated as immutable once handed to
//! the runtime for sending or once received from the transport.

use std::collections::HashMap;
use std::fmt;

/// Administrative command codes understood by the runtime itself
///
/// Everything outside this range belongs to the application protocols built
/// on top of the runtime and is routed through registered push handlers.
pub mod codes {
    /// Positive acknowledgement of a request
    pub const ACK: u32 = 0x0001;
    /// Negative acknowledgement; carries an `error-info` field
    pub const FAILED: u32 = 0x0002;
    /// The peer did not recognize the command code of our message
    pub const UNKNOWN_COMMAND: u32 = 0x0003;
    /// Session establishment handshake; carries a `version` field
    pub const CREATE_SESSION: u32 = 0x0010;
    /// Keepalive probe
    pub const PING: u32 = 0x0011;
}

/// Well-known field names
pub mod fields {
    /// Error detail attached to a `FAILED` reply
    pub const ERROR_INFO: &str = "error-info";
    /// Protocol version string sent with `CREATE_SESSION`
    pub const VERSION: &str = "version";
}

/// Typed value stored in a message field map
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// No payload
    Void,
    /// Boolean value
    Boolean(bool),
    /// Integer 32-bit
    Integer(i32),
    /// Integer 64-bit
    Long(i64),
    /// Float 64-bit
    Double(f64),
    /// UTF-8 string
    String(String),
}

impl Value {
    /// Return the string content if this value is a string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Void => write!(f, "void"),
            Value::Boolean(v) => write!(f, "{}", v),
            Value::Integer(v) => write!(f, "{}", v),
            Value::Long(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::String(v) => write!(f, "{}", v),
        }
    }
}

/// One wire unit of the scadalink protocol
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    command_code: u32,
    sequence: u64,
    reply_sequence: u64,
    values: HashMap<String, Value>,
}

impl Message {
    /// Create a new unsolicited message with the given command code
    ///
    /// The sequence is assigned by the transport channel when the message is
    /// sent; until then it is 0.
    pub fn new(command_code: u32) -> Self {
        Self {
            command_code,
            sequence: 0,
            reply_sequence: 0,
            values: HashMap::new(),
        }
    }

    /// Create a reply to `request` with the given command code
    ///
    /// The reply sequence is taken from the request's sequence so the peer's
    /// correlation engine can match it to the outstanding request.
    pub fn reply_to(request: &Message, command_code: u32) -> Self {
        Self {
            command_code,
            sequence: 0,
            reply_sequence: request.sequence,
            values: HashMap::new(),
        }
    }

    /// Reassemble a message from decoded wire parts
    pub fn from_parts(command_code: u32, sequence: u64, reply_sequence: u64) -> Self {
        Self {
            command_code,
            sequence,
            reply_sequence,
            values: HashMap::new(),
        }
    }

    /// Builder-style field setter
    pub fn with_field(mut self, name: &str, value: Value) -> Self {
        self.values.insert(name.to_string(), value);
        self
    }

    /// Command code identifying the request/response semantics
    pub fn command_code(&self) -> u32 {
        self.command_code
    }

    /// Per-connection sequence number (0 until assigned by the transport)
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Assign the sequence number
    ///
    /// Called exactly once by the sending side, with a value produced by the
    /// transport channel.
    pub fn set_sequence(&mut self, sequence: u64) {
        self.sequence = sequence;
    }

    /// Sequence of the request this message answers, or 0 if unsolicited
    pub fn reply_sequence(&self) -> u64 {
        self.reply_sequence
    }

    /// True if this message does not answer an earlier request
    pub fn is_unsolicited(&self) -> bool {
        self.reply_sequence == 0
    }

    /// Look up a field value by name
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// All fields, for encoding
    pub fn values(&self) -> &HashMap<String, Value> {
        &self.values
    }

    /// Insert a field value
    pub fn set_field(&mut self, name: &str, value: Value) {
        self.values.insert(name.to_string(), value);
    }

    /// The `error-info` field as text, if present
    ///
    /// A reply carrying this field is a failure regardless of its command
    /// code.
    pub fn error_info(&self) -> Option<&str> {
        self.values.get(fields::ERROR_INFO).and_then(Value::as_str)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Message[cc=0x{:04X} seq={} reply={} fields={}]",
            self.command_code,
            self.sequence,
            self.reply_sequence,
            self.values.len()
        )
    }
}
