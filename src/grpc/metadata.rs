//! Metadata rules: reserved-name filtering, `-bin` binary
//! header base64 coding.

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;

use crate::stream::HeaderList;

/// Reserved header names that are never surfaced as application metadata.
fn is_reserved(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower == "te"
        || lower == "content-type"
        || lower == "user-agent"
        || lower.starts_with(':')
        || lower.starts_with("grpc-")
}

/// Filter a raw header list down to application-visible request metadata,
/// base64-decoding `-bin` values. Individual fields that fail
/// to decode are dropped rather than failing the whole request.
pub fn extract_request_metadata(headers: &HeaderList) -> HeaderList {
    let mut metadata = HeaderList::new();
    for (name, value) in headers.iter() {
        if is_reserved(name) {
            continue;
        }
        let lower = name.to_ascii_lowercase();
        if lower.ends_with("-bin") {
            match STANDARD_NO_PAD.decode(value.trim_end_matches('=')) {
                Ok(decoded) => {
                    metadata.push(lower, String::from_utf8_lossy(&decoded).into_owned())
                }
                Err(_) => continue,
            }
        } else {
            metadata.push(lower, value.clone());
        }
    }
    metadata
}

/// Encode one response metadata field the way it must appear on the wire:
/// `-bin` names get base64-encoded values.
pub fn encode_metadata_field(name: &str, value: &str) -> (String, String) {
    let lower = name.to_ascii_lowercase();
    if lower.ends_with("-bin") {
        (lower, STANDARD_NO_PAD.encode(value.as_bytes()))
    } else {
        (lower, value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_headers_are_filtered() {
        let mut headers = HeaderList::new();
        headers.push("te".into(), "trailers".into());
        headers.push("content-type".into(), "application/grpc".into());
        headers.push("grpc-timeout".into(), "100m".into());
        headers.push("x-request-id".into(), "abc".into());
        let metadata = extract_request_metadata(&headers);
        assert_eq!(metadata.get("x-request-id"), Some("abc"));
        assert_eq!(metadata.get("te"), None);
        assert_eq!(metadata.get("content-type"), None);
        assert_eq!(metadata.get("grpc-timeout"), None);
    }

    #[test]
    fn binary_headers_round_trip() {
        let (name, encoded) = encode_metadata_field("x-trace-bin", "hello");
        assert_eq!(name, "x-trace-bin");
        let mut headers = HeaderList::new();
        headers.push(name, encoded);
        let metadata = extract_request_metadata(&headers);
        assert_eq!(metadata.get("x-trace-bin"), Some("hello"));
    }
}
