use bitcoin::consensus::{Decodable, Encodable};
use derive_more::{Deref, DerefMut};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Wraps a `rust-bitcoin` type to give it `serde` (de)serialization via its
/// consensus wire encoding, so types like `bitcoin::BlockHeader` can sit
/// directly inside a struct we serialize to storage.
#[derive(Clone, Debug, PartialEq, Eq, Default, Deref, DerefMut)]
pub struct Adapter<T> {
    inner: T,
}

impl<T> Adapter<T> {
    pub fn new(inner: T) -> Self {
        Adapter { inner }
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T> From<T> for Adapter<T> {
    fn from(inner: T) -> Self {
        Adapter { inner }
    }
}

impl<T: Encodable> Serialize for Adapter<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut bytes = Vec::new();
        self.inner
            .consensus_encode(&mut bytes)
            .map_err(serde::ser::Error::custom)?;
        serializer.serialize_bytes(&bytes)
    }
}

impl<'de, T: Decodable> Deserialize<'de> for Adapter<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes = <Vec<u8>>::deserialize(deserializer)?;
        let inner = T::consensus_decode(&mut bytes.as_slice()).map_err(serde::de::Error::custom)?;
        Ok(Adapter { inner })
    }
}
