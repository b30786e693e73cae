//! External message codec collaborator: the runtime only
//! ever sees opaque bytes and a type name; Protocol Buffers (or any other
//! wire format) is plugged in by the embedding application.

use std::any::Any;

use bytes::Bytes;

use crate::status::Status;

/// A decoded application message, type-erased at the registry boundary.
/// Registration carries a `(type_name, decode/encode)` pair; dispatch
/// downcasts it back to the handler's concrete request type, which is
/// known at registration time.
pub type BoxMessage = Box<dyn Any + Send + Sync>;

/// The decode/encode collaborator the dispatcher invokes by `type_name`.
pub trait MessageCodec: Send + Sync {
    fn decode(&self, type_name: &str, bytes: &[u8]) -> Result<BoxMessage, Status>;
    fn encode(&self, type_name: &str, message: &(dyn Any + Send + Sync)) -> Result<Bytes, Status>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoCodec;

    impl MessageCodec for EchoCodec {
        fn decode(&self, _type_name: &str, bytes: &[u8]) -> Result<BoxMessage, Status> {
            Ok(Box::new(Bytes::copy_from_slice(bytes)))
        }

        fn encode(&self, _type_name: &str, message: &(dyn Any + Send + Sync)) -> Result<Bytes, Status> {
            message
                .downcast_ref::<Bytes>()
                .cloned()
                .ok_or_else(|| Status::internal("unexpected message type"))
        }
    }

    #[test]
    fn round_trips_through_echo_codec() {
        let codec = EchoCodec;
        let decoded = codec.decode("test.Echo", b"hello").unwrap();
        let encoded = codec.encode("test.Echo", decoded.as_ref()).unwrap();
        assert_eq!(&encoded[..], b"hello");
    }
}
