//! gRPC framing layer over HTTP/2.

mod framer;
mod metadata;
mod validation;

pub use framer::{encode_message, Codec, MessageReassembler, RawMessage};
pub use metadata::{encode_metadata_field, extract_request_metadata};
pub use validation::{has_trailers_te, parse_path, validate_content_type, validate_http_method, ParsedPath};
