//! Request-header acceptance rules.

use crate::status::Status;
use crate::stream::HeaderList;

/// Content-type prefixes accepted for a gRPC request.
const ACCEPTED_CONTENT_TYPE_PREFIXES: [&str; 2] = ["application/grpc+", "application/grpc;"];

pub struct ParsedPath {
    pub service: String,
    pub method: String,
}

/// Outcome of validating the `:method` pseudo-header: a mismatch here never
/// produces a gRPC trailer, since the request isn't gRPC at all yet.
pub fn validate_http_method(method: Option<&str>) -> bool {
    method == Some("POST")
}

/// Parse `:path` into `/SERVICE/METHOD`, requiring exactly one slash after
/// the leading one.
pub fn parse_path(path: &str) -> Result<ParsedPath, Status> {
    let stripped = path.strip_prefix('/').ok_or_else(|| malformed_path(path))?;
    let mut parts = stripped.splitn(2, '/');
    let service = parts.next().filter(|s| !s.is_empty());
    let method = parts.next().filter(|s| !s.is_empty() && !s.contains('/'));
    match (service, method) {
        (Some(service), Some(method)) => Ok(ParsedPath {
            service: service.to_string(),
            method: method.to_string(),
        }),
        _ => Err(malformed_path(path)),
    }
}

fn malformed_path(path: &str) -> Status {
    Status::unimplemented(format!("malformed method path: {path}"))
}

/// Validate `content-type` is a recognized gRPC content-type.
/// A mismatch here is surfaced as `INTERNAL` from the gRPC view, since the
/// request reached an HTTP/2-level 415-equivalent condition.
pub fn validate_content_type(content_type: Option<&str>) -> Result<(), Status> {
    match content_type {
        Some("application/grpc") => Ok(()),
        Some(ct) if ACCEPTED_CONTENT_TYPE_PREFIXES.iter().any(|p| ct.starts_with(p)) => Ok(()),
        _ => Err(Status::internal("unsupported content-type")),
    }
}

/// `te: trailers` is recommended, not required; its absence only warrants a
/// warning log.
pub fn has_trailers_te(headers: &HeaderList) -> bool {
    headers
        .get_all("te")
        .any(|v| v.split(',').any(|tok| tok.trim() == "trailers"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_path() {
        let parsed = parse_path("/test.Greeter/Hello").unwrap();
        assert_eq!(parsed.service, "test.Greeter");
        assert_eq!(parsed.method, "Hello");
    }

    #[test]
    fn rejects_extra_slashes() {
        assert!(parse_path("/test.Greeter/Hello/Extra").is_err());
    }

    #[test]
    fn rejects_missing_leading_slash() {
        assert!(parse_path("test.Greeter/Hello").is_err());
    }

    #[test]
    fn accepts_grpc_content_type_variants() {
        assert!(validate_content_type(Some("application/grpc")).is_ok());
        assert!(validate_content_type(Some("application/grpc+proto")).is_ok());
        assert!(validate_content_type(Some("application/grpc+json")).is_ok());
        assert!(validate_content_type(Some("application/grpc;foo=bar")).is_ok());
        assert!(validate_content_type(Some("text/plain")).is_err());
        assert!(validate_content_type(None).is_err());
    }

    #[test]
    fn detects_trailers_te_token() {
        let mut headers = HeaderList::new();
        headers.push("te".into(), "trailers".into());
        assert!(has_trailers_te(&headers));

        let empty = HeaderList::new();
        assert!(!has_trailers_te(&empty));
    }
}
