//! Resumable parser for the header block of an event-stream message.
//!
//! Header bytes may arrive split at any offset. The parser keeps its cursor
//! (phase plus partially read field) between calls, so feeding a header block
//! one byte at a time yields the same headers as feeding it whole.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, warn};

/// Widest name the one-byte length field can describe
pub const MAX_HEADER_NAME_LEN: usize = u8::MAX as usize;
/// Widest byte/string value the two-byte length field can describe
pub const MAX_HEADER_VALUE_LEN: usize = u16::MAX as usize;

pub const MESSAGE_TYPE: &str = ":message-type";
pub const EVENT_TYPE: &str = ":event-type";
pub const CONTENT_TYPE: &str = ":content-type";
pub const ERROR_CODE: &str = ":error-code";
pub const ERROR_MESSAGE: &str = ":error-message";
pub const EXCEPTION_TYPE: &str = ":exception-type";

/// Typed header value
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Bool(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Bytes(Bytes),
    String(String),
    Timestamp(i64),
    Uuid([u8; 16]),
}

impl HeaderValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::String(s) => Some(s),
            _ => None,
        }
    }

    fn type_id(&self) -> u8 {
        match self {
            HeaderValue::Bool(true) => 0,
            HeaderValue::Bool(false) => 1,
            HeaderValue::Byte(_) => 2,
            HeaderValue::Short(_) => 3,
            HeaderValue::Int(_) => 4,
            HeaderValue::Long(_) => 5,
            HeaderValue::Bytes(_) => 6,
            HeaderValue::String(_) => 7,
            HeaderValue::Timestamp(_) => 8,
            HeaderValue::Uuid(_) => 9,
        }
    }

    /// Append the wire form (type byte + value) to `buf`
    pub(crate) fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.type_id());
        match self {
            HeaderValue::Bool(_) => {}
            HeaderValue::Byte(v) => buf.put_i8(*v),
            HeaderValue::Short(v) => buf.put_i16(*v),
            HeaderValue::Int(v) => buf.put_i32(*v),
            HeaderValue::Long(v) | HeaderValue::Timestamp(v) => buf.put_i64(*v),
            HeaderValue::Bytes(v) => {
                debug_assert!(v.len() <= MAX_HEADER_VALUE_LEN);
                buf.put_u16(v.len() as u16);
                buf.put_slice(v);
            }
            HeaderValue::String(v) => {
                debug_assert!(v.len() <= MAX_HEADER_VALUE_LEN);
                buf.put_u16(v.len() as u16);
                buf.put_slice(v.as_bytes());
            }
            HeaderValue::Uuid(v) => buf.put_slice(v),
        }
    }
}

/// Ordered header mapping of one framed message
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Headers {
    entries: Vec<(String, HeaderValue)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a header
    pub fn insert(&mut self, name: impl Into<String>, value: HeaderValue) {
        let name = name.into();
        if let Some(entry) = self.entries.iter_mut().find(|(n, _)| *n == name) {
            entry.1 = value;
        } else {
            self.entries.push((name, value));
        }
    }

    pub fn with_str(mut self, name: &str, value: &str) -> Self {
        self.insert(name, HeaderValue::String(value.to_string()));
        self
    }

    pub fn get(&self, name: &str) -> Option<&HeaderValue> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(HeaderValue::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &HeaderValue)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }
}

/// Field the parser is currently reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderPhase {
    NameLength,
    Name,
    ValueType,
    ValueLength,
    Value,
}

/// Resumable header block parser
#[derive(Debug)]
pub struct HeaderParser {
    phase: HeaderPhase,
    headers: Headers,
    headers_parsed: usize,
    name_len: usize,
    name: Vec<u8>,
    value_type: u8,
    value_len: usize,
    scratch: Vec<u8>,
    /// Unknown value type seen; the rest of the block cannot be delimited
    abandoned: bool,
    stalls: u32,
    stall_threshold: u32,
    errors: usize,
}

impl HeaderParser {
    pub fn new(stall_threshold: u32) -> Self {
        Self {
            phase: HeaderPhase::NameLength,
            headers: Headers::new(),
            headers_parsed: 0,
            name_len: 0,
            name: Vec::new(),
            value_type: 0,
            value_len: 0,
            scratch: Vec::new(),
            abandoned: false,
            stalls: 0,
            stall_threshold: stall_threshold.max(1),
            errors: 0,
        }
    }

    pub fn phase(&self) -> HeaderPhase {
        self.phase
    }

    pub fn headers_parsed(&self) -> usize {
        self.headers_parsed
    }

    /// Number of headers dropped because of malformed fields
    pub fn errors(&self) -> usize {
        self.errors
    }

    /// Whether the parser sits at a header boundary with nothing buffered
    pub fn at_boundary(&self) -> bool {
        self.abandoned
            || (self.phase == HeaderPhase::NameLength
                && self.scratch.is_empty()
                && self.name.is_empty())
    }

    /// Record a feed that delivered no bytes while the block is incomplete
    pub fn note_stall(&mut self) {
        self.stalls += 1;
        debug!(
            phase = ?self.phase,
            stalls = self.stalls,
            "Header parser made no progress"
        );
    }

    pub fn is_stalled(&self) -> bool {
        self.stalls >= self.stall_threshold
    }

    /// Consume header block bytes, advancing through as many fields as possible
    pub fn feed(&mut self, mut data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.stalls = 0;

        if self.abandoned {
            return;
        }

        while !data.is_empty() {
            match self.phase {
                HeaderPhase::NameLength => {
                    let len = data[0] as usize;
                    data = &data[1..];
                    if len == 0 {
                        self.errors += 1;
                        warn!("Header name length 0 is out of bounds, skipping byte");
                        continue;
                    }
                    self.name_len = len;
                    self.name.clear();
                    self.phase = HeaderPhase::Name;
                }
                HeaderPhase::Name => {
                    let take = (self.name_len - self.name.len()).min(data.len());
                    self.name.extend_from_slice(&data[..take]);
                    data = &data[take..];
                    if self.name.len() == self.name_len {
                        self.phase = HeaderPhase::ValueType;
                    }
                }
                HeaderPhase::ValueType => {
                    self.value_type = data[0];
                    data = &data[1..];
                    self.scratch.clear();
                    match self.value_type {
                        0 | 1 => self.push_header(HeaderValue::Bool(self.value_type == 0)),
                        2 => self.begin_value(1),
                        3 => self.begin_value(2),
                        4 => self.begin_value(4),
                        5 | 8 => self.begin_value(8),
                        6 | 7 => self.phase = HeaderPhase::ValueLength,
                        9 => self.begin_value(16),
                        other => {
                            self.errors += 1;
                            warn!(
                                value_type = other,
                                header = %String::from_utf8_lossy(&self.name),
                                "Unknown header value type, skipping rest of header block"
                            );
                            self.abandoned = true;
                            self.reset_field();
                            return;
                        }
                    }
                }
                HeaderPhase::ValueLength => {
                    let take = (2 - self.scratch.len()).min(data.len());
                    self.scratch.extend_from_slice(&data[..take]);
                    data = &data[take..];
                    if self.scratch.len() == 2 {
                        // the field width already bounds this by MAX_HEADER_VALUE_LEN
                        let len = u16::from_be_bytes([self.scratch[0], self.scratch[1]]) as usize;
                        self.scratch.clear();
                        if len == 0 {
                            self.complete_value();
                        } else {
                            self.begin_value(len);
                        }
                    }
                }
                HeaderPhase::Value => {
                    let take = (self.value_len - self.scratch.len()).min(data.len());
                    self.scratch.extend_from_slice(&data[..take]);
                    data = &data[take..];
                    if self.scratch.len() == self.value_len {
                        self.complete_value();
                    }
                }
            }
        }
    }

    /// Finish the block once every header byte was delivered
    pub fn finish(&mut self) -> Headers {
        if !self.at_boundary() {
            warn!(
                phase = ?self.phase,
                headers_parsed = self.headers_parsed,
                "Header block ended mid-field"
            );
            return self.force_complete();
        }
        let mut headers = std::mem::take(&mut self.headers);
        if !headers.contains(MESSAGE_TYPE) {
            headers.insert(MESSAGE_TYPE, HeaderValue::String("event".to_string()));
        }
        self.reset();
        headers
    }

    /// Give up on the current block and synthesize a minimal valid header set
    pub fn force_complete(&mut self) -> Headers {
        warn!(
            phase = ?self.phase,
            headers_parsed = self.headers_parsed,
            stalls = self.stalls,
            "Forcing header completion"
        );
        let mut headers = std::mem::take(&mut self.headers);
        if !headers.contains(MESSAGE_TYPE) {
            headers.insert(MESSAGE_TYPE, HeaderValue::String("event".to_string()));
        }
        if !headers.contains(CONTENT_TYPE) {
            headers.insert(
                CONTENT_TYPE,
                HeaderValue::String("application/json".to_string()),
            );
        }
        self.reset();
        headers
    }

    /// Prepare for the next message
    pub fn reset(&mut self) {
        self.headers = Headers::new();
        self.headers_parsed = 0;
        self.abandoned = false;
        self.stalls = 0;
        self.reset_field();
    }

    fn reset_field(&mut self) {
        self.phase = HeaderPhase::NameLength;
        self.name.clear();
        self.name_len = 0;
        self.value_len = 0;
        self.scratch.clear();
    }

    fn begin_value(&mut self, len: usize) {
        self.value_len = len;
        self.scratch.clear();
        self.phase = HeaderPhase::Value;
    }

    fn complete_value(&mut self) {
        let raw = std::mem::take(&mut self.scratch);
        let value = match self.value_type {
            2 => Some(HeaderValue::Byte(raw[0] as i8)),
            3 => Some(HeaderValue::Short(i16::from_be_bytes([raw[0], raw[1]]))),
            4 => raw
                .as_slice()
                .try_into()
                .ok()
                .map(|b| HeaderValue::Int(i32::from_be_bytes(b))),
            5 => raw
                .as_slice()
                .try_into()
                .ok()
                .map(|b| HeaderValue::Long(i64::from_be_bytes(b))),
            6 => Some(HeaderValue::Bytes(Bytes::from(raw))),
            7 => match String::from_utf8(raw) {
                Ok(s) => Some(HeaderValue::String(s)),
                Err(e) => {
                    warn!(error = %e, "Header string value is not valid UTF-8");
                    None
                }
            },
            8 => raw
                .as_slice()
                .try_into()
                .ok()
                .map(|b| HeaderValue::Timestamp(i64::from_be_bytes(b))),
            9 => raw.as_slice().try_into().ok().map(HeaderValue::Uuid),
            _ => None,
        };

        match value {
            Some(value) => self.push_header(value),
            None => {
                self.errors += 1;
                self.reset_field();
            }
        }
    }

    fn push_header(&mut self, value: HeaderValue) {
        let name = String::from_utf8_lossy(&self.name).into_owned();
        self.headers.insert(name, value);
        self.headers_parsed += 1;
        self.reset_field();
    }
}
