use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, ops::Deref, str::FromStr};

/// Data that is a cryptographic hash of `BYTES` long.
///
/// Fixed-size byte array wrapper used for every identity in the engine:
/// - Hexadecimal serialization/deserialization (serde and `FromStr`)
/// - CBOR encoding/decoding via minicbor, for the durable stores
/// - Display and debug formatting
///
/// # Examples
///
/// ```ignore
/// use agora_common::Hash;
///
/// let hash: Hash<32> = "0d8d00cdd4657ac84d82f0a56067634a7adfdf43da41cb534bcaa45060973d21"
///     .parse()
///     .unwrap();
/// assert_eq!(hash.to_string().len(), 64);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash<const BYTES: usize>([u8; BYTES]);

impl<const BYTES: usize> Default for Hash<BYTES> {
    fn default() -> Self {
        Self::new([0u8; BYTES])
    }
}

// Generic const arrays don't auto-derive, so serialise as hex by hand
impl<const BYTES: usize> Serialize for Hash<BYTES> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de, const BYTES: usize> Deserialize<'de> for Hash<BYTES> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl<const BYTES: usize> Hash<BYTES> {
    /// Creates a new hash from a byte array. Usable in const context.
    #[inline]
    pub const fn new(bytes: [u8; BYTES]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    #[inline]
    pub fn into_inner(self) -> [u8; BYTES] {
        self.0
    }

    /// Abbreviated hex form for log lines.
    pub fn short(&self) -> String {
        let prefix = BYTES.min(4);
        hex::encode(&self.0[..prefix])
    }
}

impl<const BYTES: usize> From<[u8; BYTES]> for Hash<BYTES> {
    #[inline]
    fn from(bytes: [u8; BYTES]) -> Self {
        Self::new(bytes)
    }
}

impl<const BYTES: usize> TryFrom<&[u8]> for Hash<BYTES> {
    type Error = std::array::TryFromSliceError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let hash: [u8; BYTES] = value.try_into()?;
        Ok(Self::new(hash))
    }
}

impl<const BYTES: usize> TryFrom<Vec<u8>> for Hash<BYTES> {
    type Error = Vec<u8>;

    /// Returns the original vector if its length does not match `BYTES`.
    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        let hash: [u8; BYTES] = value.try_into()?;
        Ok(Self::new(hash))
    }
}

impl<const BYTES: usize> From<Hash<BYTES>> for Vec<u8> {
    fn from(hash: Hash<BYTES>) -> Self {
        hash.0.to_vec()
    }
}

impl<const BYTES: usize> AsRef<[u8]> for Hash<BYTES> {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl<const BYTES: usize> Deref for Hash<BYTES> {
    type Target = [u8; BYTES];

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<const BYTES: usize> fmt::Debug for Hash<BYTES> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple(&format!("Hash<{BYTES}>")).field(&hex::encode(self)).finish()
    }
}

impl<const BYTES: usize> fmt::Display for Hash<BYTES> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self))
    }
}

impl<const BYTES: usize> FromStr for Hash<BYTES> {
    type Err = hex::FromHexError;

    /// Parses a hash from a hexadecimal string of exactly `2 * BYTES` digits.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0; BYTES];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self::new(bytes))
    }
}

impl<C, const BYTES: usize> minicbor::Encode<C> for Hash<BYTES> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _ctx: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.bytes(&self.0)?.ok()
    }
}

impl<'a, C, const BYTES: usize> minicbor::Decode<'a, C> for Hash<BYTES> {
    fn decode(
        d: &mut minicbor::Decoder<'a>,
        _ctx: &mut C,
    ) -> Result<Self, minicbor::decode::Error> {
        let bytes = d.bytes()?;
        if bytes.len() == BYTES {
            let mut hash = [0; BYTES];
            hash.copy_from_slice(bytes);
            Ok(Self::new(hash))
        } else {
            Err(minicbor::decode::Error::message("Invalid hash size"))
        }
    }
}

/// Declares a type alias for a hash with optional documentation.
///
/// ```ignore
/// declare_hash_type!(BlockHash, 32);
/// ```
#[macro_export]
macro_rules! declare_hash_type {
    ($name:ident, $size:expr) => {
        #[doc = concat!(stringify!($name), " - a ", stringify!($size), "-byte hash.")]
        pub type $name = $crate::hash::Hash<$size>;
    };
    ($(#[$meta:meta])* $name:ident, $size:expr) => {
        $(#[$meta])*
        pub type $name = $crate::hash::Hash<$size>;
    };
}

declare_hash_type!(
    /// Blake2b-256 of a block header.
    BlockHash,
    32
);
declare_hash_type!(
    /// Blake2b-256 of a transaction's kind tag and payload.
    TxHash,
    32
);
declare_hash_type!(
    /// Identity of a block producer (hash of its public key).
    ProducerId,
    32
);
