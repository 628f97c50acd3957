//! The narrow contract between the I/O core and the per-type DBR codecs.
//!
//! The core never interprets payload bytes itself. Anything that turns payload
//! bytes into values (and back) implements [`TypeCodec`]; the monitor notifiers
//! call it with the previously delivered value so that array allocations can be
//! reused between updates.
//!
//! A handful of plain codecs are provided for the basic numeric types and for
//! `DBR_STRING`, which is what the notification engines and tests use.

use std::marker::PhantomData;

use num::traits::ToBytes;
use thiserror::Error;

use crate::messages::padded_string;

/// Fixed length of a CA string on the wire
pub const MAX_STRING_SIZE: usize = 40;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodecError {
    #[error("Payload too short: need {needed} bytes but only {available} available")]
    Truncated { needed: usize, available: usize },
}

/// Convert between raw payload bytes and a value type
pub trait TypeCodec: Send + Sync {
    type Value: Send + 'static;

    /// Decode `count` elements from `raw`.
    ///
    /// `previous` is the last value handed out by this codec's caller, if it has
    /// been returned; implementations should reuse its storage where they can.
    fn deserialize(
        &self,
        raw: &[u8],
        previous: Option<Self::Value>,
        count: usize,
    ) -> Result<Self::Value, CodecError>;

    /// Encode `count` elements of `value`
    fn serialize(&self, value: &Self::Value, count: usize) -> Vec<u8>;

    /// The DBR type id this codec reads and writes
    fn wire_type_id(&self) -> u16;

    /// Element count this codec always requests, `Some(1)` for scalars
    fn forced_element_count(&self) -> Option<usize>;
}

/// A fixed-size big-endian element of a DBR payload
pub trait WireElement: Copy + Default + Send + Sync + ToBytes + 'static {
    const WIRE_TYPE: u16;
    const SIZE: usize;

    fn read_be(raw: &[u8]) -> Self;
}

macro_rules! wire_element {
    ($t:ty, $id:expr) => {
        impl WireElement for $t {
            const WIRE_TYPE: u16 = $id;
            const SIZE: usize = std::mem::size_of::<$t>();

            fn read_be(raw: &[u8]) -> Self {
                let mut bytes = [0u8; std::mem::size_of::<$t>()];
                bytes.copy_from_slice(&raw[..Self::SIZE]);
                <$t>::from_be_bytes(bytes)
            }
        }
    };
}

wire_element!(i16, 1);
wire_element!(f32, 2);
wire_element!(u16, 3);
wire_element!(i8, 4);
wire_element!(i32, 5);
wire_element!(f64, 6);

fn check_length(raw: &[u8], needed: usize) -> Result<(), CodecError> {
    if raw.len() < needed {
        Err(CodecError::Truncated {
            needed,
            available: raw.len(),
        })
    } else {
        Ok(())
    }
}

/// Codec for arrays of a numeric type
pub struct ArrayCodec<T> {
    _phantom: PhantomData<T>,
}

impl<T> ArrayCodec<T> {
    pub fn new() -> Self {
        ArrayCodec {
            _phantom: PhantomData,
        }
    }
}

impl<T> Default for ArrayCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: WireElement> TypeCodec for ArrayCodec<T> {
    type Value = Vec<T>;

    fn deserialize(
        &self,
        raw: &[u8],
        previous: Option<Vec<T>>,
        count: usize,
    ) -> Result<Vec<T>, CodecError> {
        let count = if count == 0 { raw.len() / T::SIZE } else { count };
        check_length(raw, count * T::SIZE)?;
        let mut values = previous.unwrap_or_default();
        values.clear();
        values.reserve(count);
        values.extend(raw.chunks_exact(T::SIZE).take(count).map(T::read_be));
        Ok(values)
    }

    fn serialize(&self, value: &Vec<T>, count: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(count * T::SIZE);
        for element in value.iter().take(count) {
            out.extend_from_slice(element.to_be_bytes().as_ref());
        }
        // Short arrays are padded with default elements
        for _ in value.len()..count {
            out.extend_from_slice(T::default().to_be_bytes().as_ref());
        }
        out
    }

    fn wire_type_id(&self) -> u16 {
        T::WIRE_TYPE
    }

    fn forced_element_count(&self) -> Option<usize> {
        None
    }
}

/// Codec for a single numeric value
pub struct ScalarCodec<T> {
    _phantom: PhantomData<T>,
}

impl<T> ScalarCodec<T> {
    pub fn new() -> Self {
        ScalarCodec {
            _phantom: PhantomData,
        }
    }
}

impl<T> Default for ScalarCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: WireElement> TypeCodec for ScalarCodec<T> {
    type Value = T;

    fn deserialize(
        &self,
        raw: &[u8],
        _previous: Option<T>,
        _count: usize,
    ) -> Result<T, CodecError> {
        check_length(raw, T::SIZE)?;
        Ok(T::read_be(raw))
    }

    fn serialize(&self, value: &T, _count: usize) -> Vec<u8> {
        value.to_be_bytes().as_ref().to_vec()
    }

    fn wire_type_id(&self) -> u16 {
        T::WIRE_TYPE
    }

    fn forced_element_count(&self) -> Option<usize> {
        Some(1)
    }
}

/// Codec for `DBR_STRING` arrays of fixed 40-byte strings
#[derive(Default)]
pub struct StringCodec;

impl TypeCodec for StringCodec {
    type Value = Vec<String>;

    fn deserialize(
        &self,
        raw: &[u8],
        previous: Option<Vec<String>>,
        count: usize,
    ) -> Result<Vec<String>, CodecError> {
        let count = if count == 0 {
            raw.len() / MAX_STRING_SIZE
        } else {
            count
        };
        // A lone string may be sent without its full padding
        if count == 1 {
            let mut values = previous.unwrap_or_default();
            values.clear();
            values.push(padded_string(&raw[..raw.len().min(MAX_STRING_SIZE)]));
            return Ok(values);
        }
        check_length(raw, count * MAX_STRING_SIZE)?;
        let mut values = previous.unwrap_or_default();
        values.clear();
        values.extend(
            raw.chunks_exact(MAX_STRING_SIZE)
                .take(count)
                .map(padded_string),
        );
        Ok(values)
    }

    fn serialize(&self, value: &Vec<String>, count: usize) -> Vec<u8> {
        let mut out = vec![0u8; count * MAX_STRING_SIZE];
        for (field, string) in out.chunks_exact_mut(MAX_STRING_SIZE).zip(value) {
            // Truncate on a character boundary, always leaving a terminator
            let mut length = 0;
            for c in string.chars() {
                if length + c.len_utf8() >= MAX_STRING_SIZE {
                    break;
                }
                length += c.len_utf8();
            }
            field[..length].copy_from_slice(&string.as_bytes()[..length]);
        }
        out
    }

    fn wire_type_id(&self) -> u16 {
        0
    }

    fn forced_element_count(&self) -> Option<usize> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn array_codec_reuses_previous_allocation() {
        let codec = ArrayCodec::<i32>::new();
        let raw = codec.serialize(&vec![1, 2, 3], 3);
        assert_eq!(raw.len(), 12);
        let previous = Vec::with_capacity(64);
        let value = codec.deserialize(&raw, Some(previous), 3).unwrap();
        assert_eq!(value, vec![1, 2, 3]);
        assert!(value.capacity() >= 64);
    }

    #[test]
    fn array_codec_rejects_short_payload() {
        let codec = ArrayCodec::<f64>::new();
        assert_eq!(
            codec.deserialize(&[0u8; 12], None, 2),
            Err(CodecError::Truncated {
                needed: 16,
                available: 12
            })
        );
    }

    #[test]
    fn scalar_codec_forces_single_element() {
        let codec = ScalarCodec::<f64>::new();
        assert_eq!(codec.forced_element_count(), Some(1));
        assert_eq!(codec.wire_type_id(), 6);
        let raw = codec.serialize(&2.5, 1);
        assert_eq!(codec.deserialize(&raw, None, 1).unwrap(), 2.5);
    }

    #[test]
    fn string_codec_round_trips_fixed_fields() {
        let codec = StringCodec;
        let raw = codec.serialize(&vec!["first".to_string(), "second".to_string()], 2);
        assert_eq!(raw.len(), 2 * MAX_STRING_SIZE);
        let value = codec.deserialize(&raw, None, 2).unwrap();
        assert_eq!(value, vec!["first".to_string(), "second".to_string()]);
        let long = "x".repeat(60);
        let raw = codec.serialize(&vec![long], 1);
        assert_eq!(codec.deserialize(&raw, None, 1).unwrap()[0].len(), 39);
    }
}
