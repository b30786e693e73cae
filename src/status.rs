//! gRPC status codes and the `Status` error type.

use std::fmt;

use bytes::Bytes;

/// The 17-value gRPC status enumeration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Code {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl Code {
    pub fn from_i32(value: i32) -> Self {
        match value {
            0 => Self::Ok,
            1 => Self::Cancelled,
            2 => Self::Unknown,
            3 => Self::InvalidArgument,
            4 => Self::DeadlineExceeded,
            5 => Self::NotFound,
            6 => Self::AlreadyExists,
            7 => Self::PermissionDenied,
            8 => Self::ResourceExhausted,
            9 => Self::FailedPrecondition,
            10 => Self::Aborted,
            11 => Self::OutOfRange,
            12 => Self::Unimplemented,
            13 => Self::Internal,
            14 => Self::Unavailable,
            15 => Self::DataLoss,
            16 => Self::Unauthenticated,
            _ => Self::Unknown,
        }
    }

    /// gRPC status -> HTTP status, for shim layers that look at `:status`.
    pub fn to_http_status(self) -> u16 {
        match self {
            Code::Ok => 200,
            Code::InvalidArgument => 400,
            Code::Unauthenticated => 401,
            Code::PermissionDenied => 403,
            Code::NotFound => 404,
            Code::AlreadyExists => 409,
            Code::ResourceExhausted => 429,
            Code::Cancelled => 499,
            Code::Unimplemented => 501,
            Code::Unavailable => 503,
            Code::DeadlineExceeded => 504,
            _ => 500,
        }
    }

    /// HTTP/2 RST_STREAM error code -> gRPC status, for translating peer resets.
    pub fn from_h2_error(h2_code: u32) -> Self {
        match h2_code {
            0x8 => Code::Cancelled,
            0x7 => Code::Unavailable,
            0xb => Code::ResourceExhausted,
            0xc => Code::PermissionDenied,
            _ => Code::Internal,
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Code::Ok => "OK",
            Code::Cancelled => "CANCELLED",
            Code::Unknown => "UNKNOWN",
            Code::InvalidArgument => "INVALID_ARGUMENT",
            Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Code::NotFound => "NOT_FOUND",
            Code::AlreadyExists => "ALREADY_EXISTS",
            Code::PermissionDenied => "PERMISSION_DENIED",
            Code::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Code::FailedPrecondition => "FAILED_PRECONDITION",
            Code::Aborted => "ABORTED",
            Code::OutOfRange => "OUT_OF_RANGE",
            Code::Unimplemented => "UNIMPLEMENTED",
            Code::Internal => "INTERNAL",
            Code::Unavailable => "UNAVAILABLE",
            Code::DataLoss => "DATA_LOSS",
            Code::Unauthenticated => "UNAUTHENTICATED",
        };
        f.write_str(name)
    }
}

/// A gRPC status: the terminal result of every RPC.
///
/// Carries the code, an optional human message, and optional opaque binary
/// details (`grpc-status-details-bin`, set by handlers — the runtime never
/// produces this field itself).
#[derive(Clone, Debug)]
pub struct Status {
    code: Code,
    message: String,
    details: Option<Bytes>,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn ok() -> Self {
        Self::new(Code::Ok, "")
    }

    pub fn with_details(mut self, details: Bytes) -> Self {
        self.details = Some(details);
        self
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn details(&self) -> Option<&Bytes> {
        self.details.as_ref()
    }

    pub fn is_ok(&self) -> bool {
        matches!(self.code, Code::Ok)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(Code::Cancelled, message)
    }
    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(Code::Unknown, message)
    }
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }
    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(Code::DeadlineExceeded, message)
    }
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Code::NotFound, message)
    }
    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(Code::AlreadyExists, message)
    }
    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(Code::PermissionDenied, message)
    }
    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new(Code::ResourceExhausted, message)
    }
    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::new(Code::FailedPrecondition, message)
    }
    pub fn aborted(message: impl Into<String>) -> Self {
        Self::new(Code::Aborted, message)
    }
    pub fn out_of_range(message: impl Into<String>) -> Self {
        Self::new(Code::OutOfRange, message)
    }
    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::new(Code::Unimplemented, message)
    }
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(Code::Unavailable, message)
    }
    pub fn data_loss(message: impl Into<String>) -> Self {
        Self::new(Code::DataLoss, message)
    }
    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(Code::Unauthenticated, message)
    }

    /// Percent-encode `message` for the `grpc-message` trailer.
    pub fn encode_message(message: &str) -> String {
        use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
        // NON_ALPHANUMERIC over-escapes relative to the unreserved set
        // (`-_.~` are also unreserved); carve those back out.
        const UNRESERVED_EXTRA: &[char] = &['-', '_', '.', '~'];
        let mut out = String::new();
        for ch in message.chars() {
            if ch.is_ascii_alphanumeric() || UNRESERVED_EXTRA.contains(&ch) {
                out.push(ch);
            } else {
                let mut buf = [0u8; 4];
                let bytes = ch.encode_utf8(&mut buf).as_bytes();
                out.push_str(&utf8_percent_encode(
                    std::str::from_utf8(bytes).unwrap(),
                    NON_ALPHANUMERIC,
                )
                .to_string());
            }
        }
        out
    }

    pub fn decode_message(message: &str) -> String {
        percent_encoding::percent_decode_str(message)
            .decode_utf8_lossy()
            .into_owned()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "status: {}, message: {:?}", self.code, self.message)
    }
}

impl std::error::Error for Status {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_values_match_spec() {
        let pairs = [
            (Code::Ok, 0),
            (Code::Cancelled, 1),
            (Code::Unknown, 2),
            (Code::InvalidArgument, 3),
            (Code::DeadlineExceeded, 4),
            (Code::NotFound, 5),
            (Code::AlreadyExists, 6),
            (Code::PermissionDenied, 7),
            (Code::ResourceExhausted, 8),
            (Code::FailedPrecondition, 9),
            (Code::Aborted, 10),
            (Code::OutOfRange, 11),
            (Code::Unimplemented, 12),
            (Code::Internal, 13),
            (Code::Unavailable, 14),
            (Code::DataLoss, 15),
            (Code::Unauthenticated, 16),
        ];
        for (code, value) in pairs {
            assert_eq!(code as u32, value);
            assert_eq!(Code::from_i32(value), code);
        }
    }

    #[test]
    fn h2_error_mapping() {
        assert_eq!(Code::from_h2_error(0x8), Code::Cancelled);
        assert_eq!(Code::from_h2_error(0x7), Code::Unavailable);
        assert_eq!(Code::from_h2_error(0xb), Code::ResourceExhausted);
        assert_eq!(Code::from_h2_error(0xc), Code::PermissionDenied);
        assert_eq!(Code::from_h2_error(0x1), Code::Internal);
    }

    #[test]
    fn message_percent_round_trip() {
        let msg = "Method not found: /test.Unknown/X";
        let encoded = Status::encode_message(msg);
        assert_eq!(encoded, "Method%20not%20found%3A%20%2Ftest.Unknown%2FX");
        assert_eq!(Status::decode_message(&encoded), msg);
    }

    #[test]
    fn http_status_mapping() {
        assert_eq!(Code::Ok.to_http_status(), 200);
        assert_eq!(Code::NotFound.to_http_status(), 404);
        assert_eq!(Code::DeadlineExceeded.to_http_status(), 504);
    }
}
