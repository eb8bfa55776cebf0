//! Wire encoding for channel elements.
use bytes::{BufMut as _, Bytes, BytesMut};
use snafu::Snafu;

/// Message decoding error.
#[derive(Debug, Snafu, Eq, PartialEq)]
#[snafu(context(suffix(false)))]
pub enum MessageError {
    /// A fixed-width message had the wrong length.
    #[snafu(display("expected {} bytes for {}, got {}", expected, type_name, actual))]
    InvalidLength {
        /// Name of the decoded type.
        type_name: &'static str,

        /// Length required by the type.
        expected: usize,

        /// Length of the received payload.
        actual: usize,
    },

    /// A string message was not valid UTF-8.
    #[snafu(display("payload is not valid UTF-8: {}", source))]
    InvalidUtf8 {
        /// The underlying conversion error.
        source: std::str::Utf8Error,
    },
}

/// A value that can be sent over an endpoint.
///
/// Stream transports carry each encoded value in its own length-delimited frame. Datagram transports carry the encoded
/// value as the whole datagram, so fixed-width types declare [`FIXED_LEN`][WireMessage::FIXED_LEN] and receivers drop
/// datagrams of any other size.
pub trait WireMessage: Sized {
    /// Encoded length of every value of this type, if it is fixed.
    const FIXED_LEN: Option<usize> = None;

    /// Appends the encoded value to `buf`.
    fn encode(&self, buf: &mut BytesMut);

    /// Decodes a value from a complete payload.
    ///
    /// # Errors
    ///
    /// If the payload is not a valid encoding of this type, an error is returned.
    fn decode(payload: Bytes) -> Result<Self, MessageError>;

    /// Encodes the value into a new buffer.
    fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::FIXED_LEN.unwrap_or(64));
        self.encode(&mut buf);
        buf.freeze()
    }
}

impl WireMessage for Bytes {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(self);
    }

    fn decode(payload: Bytes) -> Result<Self, MessageError> {
        Ok(payload)
    }

    fn to_bytes(&self) -> Bytes {
        self.clone()
    }
}

impl WireMessage for Vec<u8> {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(self);
    }

    fn decode(payload: Bytes) -> Result<Self, MessageError> {
        Ok(payload.to_vec())
    }
}

impl WireMessage for String {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(self.as_bytes());
    }

    fn decode(payload: Bytes) -> Result<Self, MessageError> {
        std::str::from_utf8(&payload)
            .map(str::to_owned)
            .map_err(|source| MessageError::InvalidUtf8 { source })
    }
}

macro_rules! fixed_width_message {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl WireMessage for $ty {
                const FIXED_LEN: Option<usize> = Some(std::mem::size_of::<$ty>());

                fn encode(&self, buf: &mut BytesMut) {
                    buf.put_slice(&self.to_be_bytes());
                }

                fn decode(payload: Bytes) -> Result<Self, MessageError> {
                    let bytes = <[u8; std::mem::size_of::<$ty>()]>::try_from(&payload[..]).map_err(|_| {
                        MessageError::InvalidLength {
                            type_name: stringify!($ty),
                            expected: std::mem::size_of::<$ty>(),
                            actual: payload.len(),
                        }
                    })?;
                    Ok(<$ty>::from_be_bytes(bytes))
                }
            }
        )+
    };
}

fixed_width_message!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_width_is_big_endian() {
        assert_eq!(&0x0102_0304u32.to_bytes()[..], &[1, 2, 3, 4]);
        assert_eq!(u32::decode(Bytes::from_static(&[1, 2, 3, 4])), Ok(0x0102_0304));
        assert_eq!(u16::FIXED_LEN, Some(2));
        assert_eq!(f64::FIXED_LEN, Some(8));
        assert_eq!(f64::decode(1.5f64.to_bytes()), Ok(1.5));
        assert_eq!(i64::decode((-7i64).to_bytes()), Ok(-7));
    }

    #[test]
    fn fixed_width_rejects_wrong_length() {
        assert_eq!(
            u64::decode(Bytes::from_static(&[0; 3])),
            Err(MessageError::InvalidLength {
                type_name: "u64",
                expected: 8,
                actual: 3
            })
        );
    }

    #[test]
    fn variable_width() {
        assert_eq!(String::FIXED_LEN, None);
        assert_eq!(String::decode("héllo".to_string().to_bytes()).unwrap(), "héllo");
        assert!(matches!(
            String::decode(Bytes::from_static(&[0xff, 0xfe])),
            Err(MessageError::InvalidUtf8 { .. })
        ));
        assert_eq!(Vec::<u8>::decode(Bytes::from_static(b"raw")).unwrap(), b"raw".to_vec());
        assert_eq!(Bytes::from_static(b"raw").to_bytes(), Bytes::from_static(b"raw"));
    }
}
