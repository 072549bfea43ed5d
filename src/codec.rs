use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{QueueError, QueueResult};

/// Strategy for converting records to and from segment frame payloads.
///
/// The queue never inspects a record: it encodes on enqueue, stores the
/// bytes, and decodes into a freshly allocated destination when replaying a
/// segment file. Every record stored in one queue must use the same codec
/// (and therefore the same record type); mixing types is undefined.
pub trait Codec: Send + Sync + 'static {
    /// The record type this codec understands.
    type Record: Send + 'static;

    /// Encode a record into a frame payload.
    ///
    /// An empty payload is rejected by the segment layer because a
    /// zero-length frame marks a removal.
    fn encode(&self, record: &Self::Record) -> QueueResult<Vec<u8>>;

    /// Allocate a destination value for [`Codec::decode_into`].
    fn new_empty(&self) -> Self::Record;

    /// Decode a frame payload into `record`.
    fn decode_into(&self, bytes: &[u8], record: &mut Self::Record) -> QueueResult<()>;
}

/// [`Codec`] backed by bincode, for any serde record type with a `Default`
/// starting value.
pub struct BincodeCodec<R> {
    _marker: PhantomData<fn() -> R>,
}

impl<R> BincodeCodec<R> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<R> Default for BincodeCodec<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> Codec for BincodeCodec<R>
where
    R: Serialize + DeserializeOwned + Default + Send + 'static,
{
    type Record = R;

    fn encode(&self, record: &R) -> QueueResult<Vec<u8>> {
        bincode::serialize(record).map_err(QueueError::serialization)
    }

    fn new_empty(&self) -> R {
        R::default()
    }

    fn decode_into(&self, bytes: &[u8], record: &mut R) -> QueueResult<()> {
        *record = bincode::deserialize(bytes).map_err(QueueError::serialization)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Job {
        id: u32,
        payload: String,
    }

    #[test]
    fn bincode_roundtrip_through_decode_into() {
        let codec = BincodeCodec::<Job>::new();
        let job = Job {
            id: 7,
            payload: "resize".to_string(),
        };

        let bytes = codec.encode(&job).expect("encode");
        let mut dest = codec.new_empty();
        codec.decode_into(&bytes, &mut dest).expect("decode");
        assert_eq!(dest, job);
    }

    #[test]
    fn truncated_payload_fails_to_decode() {
        let codec = BincodeCodec::<Job>::new();
        let bytes = codec
            .encode(&Job {
                id: 1,
                payload: "x".to_string(),
            })
            .expect("encode");

        let mut dest = codec.new_empty();
        let err = codec
            .decode_into(&bytes[..bytes.len() - 1], &mut dest)
            .unwrap_err();
        assert!(matches!(err, QueueError::Serialization(_)));
    }
}
