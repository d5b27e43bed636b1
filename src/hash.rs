use super::{Error, Result};
use std::fmt;
use std::str::FromStr;

pub const SHA1_HASH_SIZE: usize = 20;

/// A 20-byte object name. Hex input is accepted in either case and always
/// printed in lower case.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; SHA1_HASH_SIZE]);

impl ObjectId {
    pub fn from_hex(value: &str) -> Result<Self> {
        if value.len() != SHA1_HASH_SIZE * 2 {
            return Err(Error::InvalidRequest(format!(
                "object id must be {} hex characters, got {}: {value:?}",
                SHA1_HASH_SIZE * 2,
                value.len()
            )));
        }

        let mut buf = [0u8; SHA1_HASH_SIZE];
        hex::decode_to_slice(value, &mut buf)
            .map_err(|err| Error::InvalidRequest(format!("invalid object id {value:?}: {err}")))?;

        Ok(Self(buf))
    }

    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl FromStr for ObjectId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl TryFrom<&[u8]> for ObjectId {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        let buf: [u8; SHA1_HASH_SIZE] = bytes.try_into().map_err(|_| {
            Error::InvalidRequest(format!(
                "object id must be {SHA1_HASH_SIZE} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(buf))
    }
}

impl From<[u8; SHA1_HASH_SIZE]> for ObjectId {
    fn from(value: [u8; SHA1_HASH_SIZE]) -> Self {
        Self(value)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_parses_hex_in_any_case() {
        let lower = ObjectId::from_hex("eaceca8c2e77a8b0dae5ce976bf1901b8accd68f").unwrap();
        let upper = ObjectId::from_hex("EACECA8C2E77A8B0DAE5CE976BF1901B8ACCD68F").unwrap();
        assert_eq!(lower, upper);
        assert_eq!(upper.hex(), "eaceca8c2e77a8b0dae5ce976bf1901b8accd68f");
        assert_eq!(lower.as_bytes()[0], 0xea);
    }

    #[test]
    fn it_rejects_wrong_length() {
        let err = ObjectId::from_hex("eaceca8c").unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));

        let err = ObjectId::try_from(&[0u8; 19][..]).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[test]
    fn it_rejects_non_hex_characters() {
        let err = "zaceca8c2e77a8b0dae5ce976bf1901b8accd68f"
            .parse::<ObjectId>()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }
}
