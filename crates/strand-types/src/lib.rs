// Decoded protocol events and the message model shared between the wire
// codec and the client core. The codec owns byte-level framing and header
// compression; everything here is already decoded and scoped to a stream.
use bytes::Bytes;

pub type Result<T> = std::result::Result<T, ExchangeError>;

/// Stream identifier assigned by the codec. Unique within a connection at
/// any instant; odd ids are client-initiated, even ids are server pushes.
/// The parity rule is protocol-defined and never re-derived here.
pub type StreamId = u32;

/// Status substituted when a response carries an unparseable `:status`
/// field. The response is still delivered, marked degraded by this code.
pub const FALLBACK_STATUS: u16 = 502;

/// Header fields as decoded by the codec, in wire order. Pseudo-header
/// fields keep their `:` prefix.
pub type HeaderFields = Vec<(String, String)>;

/// Peer-supplied stream/connection error code, kept opaque.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode(pub u32);

impl ErrorCode {
    pub const NO_ERROR: ErrorCode = ErrorCode(0x0);
    pub const PROTOCOL_ERROR: ErrorCode = ErrorCode(0x1);
    pub const INTERNAL_ERROR: ErrorCode = ErrorCode(0x2);
    pub const FLOW_CONTROL_ERROR: ErrorCode = ErrorCode(0x3);
    pub const STREAM_CLOSED: ErrorCode = ErrorCode(0x5);
    pub const REFUSED_STREAM: ErrorCode = ErrorCode(0x7);
    pub const CANCEL: ErrorCode = ErrorCode(0x8);
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match *self {
            ErrorCode::NO_ERROR => "NO_ERROR",
            ErrorCode::PROTOCOL_ERROR => "PROTOCOL_ERROR",
            ErrorCode::INTERNAL_ERROR => "INTERNAL_ERROR",
            ErrorCode::FLOW_CONTROL_ERROR => "FLOW_CONTROL_ERROR",
            ErrorCode::STREAM_CLOSED => "STREAM_CLOSED",
            ErrorCode::REFUSED_STREAM => "REFUSED_STREAM",
            ErrorCode::CANCEL => "CANCEL",
            ErrorCode(other) => return write!(f, "code {other:#x}"),
        };
        f.write_str(name)
    }
}

/// Remote settings as decoded from a settings frame. Fields absent from
/// the frame stay `None`. Recorded for inspection; flow-control and frame
/// sizing enforcement live in the codec.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SettingsUpdate {
    pub header_table_size: Option<u32>,
    pub enable_push: Option<bool>,
    pub max_concurrent_streams: Option<u32>,
    pub initial_window_size: Option<u32>,
    pub max_frame_size: Option<u32>,
}

/// One decoded inbound event, scoped to a connection by the channel it
/// arrives on and to a stream by `stream_id`.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Response or trailer header block for a stream.
    Headers {
        stream_id: StreamId,
        fields: HeaderFields,
        end_stream: bool,
    },
    /// Response body chunk for a stream, in receipt order.
    Data {
        stream_id: StreamId,
        data: Bytes,
        end_stream: bool,
    },
    /// Server push announcement on `stream_id` reserving `promised_stream_id`.
    PushPromise {
        stream_id: StreamId,
        promised_stream_id: StreamId,
        fields: HeaderFields,
    },
    /// Stream reset by the peer.
    Reset {
        stream_id: StreamId,
        error_code: ErrorCode,
    },
    /// Remote settings received.
    Settings(SettingsUpdate),
    /// Connection termination signal from the peer.
    GoAway {
        last_stream_id: StreamId,
        error_code: ErrorCode,
    },
}

impl ConnectionEvent {
    /// The stream this event is scoped to, if it is stream-scoped.
    pub fn stream_id(&self) -> Option<StreamId> {
        match self {
            ConnectionEvent::Headers { stream_id, .. }
            | ConnectionEvent::Data { stream_id, .. }
            | ConnectionEvent::PushPromise { stream_id, .. }
            | ConnectionEvent::Reset { stream_id, .. } => Some(*stream_id),
            ConnectionEvent::Settings(_) | ConnectionEvent::GoAway { .. } => None,
        }
    }
}

/// Request line and headers of an outbound request. Immutable once
/// submitted; also reconstructed from the header block of a push promise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub scheme: String,
    pub authority: String,
    pub headers: HeaderFields,
}

impl RequestHead {
    pub fn new(
        method: impl Into<String>,
        path: impl Into<String>,
        scheme: impl Into<String>,
        authority: impl Into<String>,
    ) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            scheme: scheme.into(),
            authority: authority.into(),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Reconstruct the promised request from a push-promise header block.
    ///
    /// `:method` and `:path` are required; unknown pseudo-header fields are
    /// a translation failure.
    pub fn from_push_fields(
        fields: &[(String, String)],
    ) -> std::result::Result<Self, HeaderTranslationError> {
        let mut head = RequestHead::new("", "", "", "");
        for (name, value) in fields {
            match name.as_str() {
                ":method" => head.method = value.clone(),
                ":path" => head.path = value.clone(),
                ":scheme" => head.scheme = value.clone(),
                ":authority" => head.authority = value.clone(),
                other if other.starts_with(':') => {
                    return Err(HeaderTranslationError {
                        reason: format!("unknown pseudo-header field {other:?} in push promise"),
                    });
                }
                _ => head.headers.push((name.clone(), value.clone())),
            }
        }
        if head.method.is_empty() || head.path.is_empty() {
            return Err(HeaderTranslationError {
                reason: "push promise missing :method or :path".into(),
            });
        }
        Ok(head)
    }
}

/// A complete response, immutable once assembled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub headers: HeaderFields,
    pub body: Bytes,
    pub trailers: HeaderFields,
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    pub fn trailer(&self, name: &str) -> Option<&str> {
        header_value(&self.trailers, name)
    }
}

/// First value for `name` in a decoded header list (case-insensitive).
pub fn header_value<'a>(fields: &'a [(String, String)], name: &str) -> Option<&'a str> {
    fields
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Parse the `:status` pseudo-header from a response header block.
pub fn parse_status(fields: &[(String, String)]) -> std::result::Result<u16, StatusParseError> {
    let value = header_value(fields, ":status").ok_or_else(|| StatusParseError {
        value: "<missing>".into(),
    })?;
    value
        .parse::<u16>()
        .ok()
        .filter(|s| (100..1000).contains(s))
        .ok_or_else(|| StatusParseError {
            value: value.to_string(),
        })
}

/// Unparseable `:status` field. Never surfaced to callers: the assembler
/// substitutes [`FALLBACK_STATUS`] and delivers the response anyway.
#[derive(thiserror::Error, Debug, Clone)]
#[error("unparseable :status field {value:?}")]
pub struct StatusParseError {
    pub value: String,
}

/// Failure translating a decoded header block into the message model.
#[derive(thiserror::Error, Debug, Clone)]
#[error("{reason}")]
pub struct HeaderTranslationError {
    pub reason: String,
}

/// Errors surfaced through an exchange's response future. Each fails
/// exactly the futures its scope covers: stream-scoped errors fail one
/// exchange, connection-scoped errors fail every exchange still registered
/// on that connection. Nothing here is fatal to the process.
#[derive(thiserror::Error, Debug, Clone)]
pub enum ExchangeError {
    #[error("stream {stream_id} reset by the remote peer ({code})")]
    StreamReset { stream_id: StreamId, code: ErrorCode },
    #[error("header translation failed on stream {stream_id}: {source}")]
    HeaderTranslation {
        stream_id: StreamId,
        #[source]
        source: HeaderTranslationError,
    },
    #[error("connection closed: {reason}")]
    ConnectionClosed { reason: String },
    #[error("connection invalidated by the pool: {reason}")]
    PoolInvalidated { reason: String },
}

impl ExchangeError {
    pub fn connection_closed(reason: impl Into<String>) -> Self {
        ExchangeError::ConnectionClosed {
            reason: reason.into(),
        }
    }
}
