//! Rich payloads (job descriptions, results, statistics) and TCP frames
//! travel as bincode. Workers only agree on the byte layout if they agree on
//! the encoding options, so this module pins them in one place: variable
//! length integers, little-endian byte order. These are bincode's
//! `DefaultOptions`; the crate-level `bincode::serialize` shortcuts use a
//! different (fixed-width) configuration and must not be called directly.

use crate::error::Result;

use bincode::Options as _;

/// The pinned encoding options. `DefaultOptions` carries no state, so
/// building it per call is free.
fn options() -> bincode::DefaultOptions {
    bincode::DefaultOptions::new()
}

/// Encodes a value to a byte vector.
pub fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(options().serialize(value)?)
}

/// Decodes a value from a byte slice.
pub fn deserialize<'de, T: serde::Deserialize<'de>>(bytes: &'de [u8]) -> Result<T> {
    Ok(options().deserialize(bytes)?)
}

/// Encodes a value into a writer, e.g. an outbound peer connection.
pub fn serialize_into<W: std::io::Write, T: serde::Serialize>(writer: W, value: &T) -> Result<()> {
    Ok(options().serialize_into(writer, value)?)
}

/// Decodes the next value from a reader, e.g. an inbound peer connection.
pub fn deserialize_from<R: std::io::Read, T: serde::de::DeserializeOwned>(reader: R) -> Result<T> {
    Ok(options().deserialize_from(reader)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let value = (7u32, vec![-1i32, 2, 3], "arbor".to_string());
        let bytes = serialize(&value).unwrap();
        assert_eq!(deserialize::<(u32, Vec<i32>, String)>(&bytes).unwrap(), value);
    }

    #[test]
    fn integers_use_varint_encoding() {
        // A small integer must collapse to a single byte; the fixed-width
        // options the bincode crate defaults to would emit four.
        assert_eq!(serialize(&5u32).unwrap().len(), 1);
    }

    #[test]
    fn reader_writer_roundtrip() {
        let mut buffer = Vec::new();
        serialize_into(&mut buffer, &vec![1u8, 2, 3]).unwrap();
        serialize_into(&mut buffer, &"next".to_string()).unwrap();
        let mut reader = buffer.as_slice();
        assert_eq!(deserialize_from::<_, Vec<u8>>(&mut reader).unwrap(), vec![1, 2, 3]);
        assert_eq!(deserialize_from::<_, String>(&mut reader).unwrap(), "next");
    }
}
