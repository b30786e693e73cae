//! HPACK header compression (RFC 7541).

mod decoder;
mod encoder;
mod huffman;
mod integer;
mod string;
mod table;

pub use decoder::Decoder;
pub use encoder::Encoder;
pub use table::{DynamicTable, STATIC_TABLE, STATIC_TABLE_LEN};
