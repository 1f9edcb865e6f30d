//! The replicated write-set container.
//!
//! The internal encoding of keys and row events belongs to the embedding
//! engine; this container carries the opaque data plus the metadata the
//! core needs: identity, flags, certification keys and the snapshot seqno.
//! Encoding is canonical (postcard) so every node computes identical bytes.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use quartzite_types::{ConnId, GlobalSeqno, NodeId, TrxId, WsFlags};

use crate::error::{Error, Result};

/// Write-set container format version.
pub const WS_VERSION: u16 = 5;

/// One certification key. Opaque bytes; the engine decides granularity
/// (schema/table/row).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WsKey(pub Bytes);

impl WsKey {
    pub fn new(key: impl Into<Bytes>) -> Self {
        Self(key.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// The replicated payload of one transaction (or fragment).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteSet {
    pub version: u16,
    pub source: NodeId,
    pub conn_id: ConnId,
    pub trx_id: TrxId,
    pub flags: WsFlags,
    /// The client's observed snapshot at commit-request time; certification
    /// compares conflicting writers against it.
    pub last_seen: GlobalSeqno,
    pub keys: Vec<WsKey>,
    pub data: Bytes,
}

impl WriteSet {
    pub fn encode(&self) -> Bytes {
        Bytes::from(postcard::to_allocvec(self).expect("write-set serialization cannot fail"))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let ws: WriteSet =
            postcard::from_bytes(bytes).map_err(|e| Error::MalformedWriteSet(e.to_string()))?;
        if ws.version > WS_VERSION {
            return Err(Error::MalformedWriteSet(format!(
                "write-set version {} newer than supported {WS_VERSION}",
                ws.version
            )));
        }
        Ok(ws)
    }
}

/// Donor-side projections of the payload for the transfer layer.
#[derive(Debug, Default, Clone, Copy)]
pub struct PayloadCodec;

impl quartzite_ist::WriteSetCodec for PayloadCodec {
    fn strip_keys(&self, payload: &Bytes) -> Bytes {
        match WriteSet::decode(payload) {
            Ok(mut ws) => {
                ws.keys.clear();
                ws.encode()
            }
            // not a write-set payload (configuration change): pass through
            Err(_) => payload.clone(),
        }
    }

    fn depends_seqno(&self, _payload: &Bytes) -> GlobalSeqno {
        // dependencies are computed at certification time, not carried in
        // the payload
        GlobalSeqno::UNDEFINED
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quartzite_ist::WriteSetCodec;

    fn sample() -> WriteSet {
        WriteSet {
            version: WS_VERSION,
            source: NodeId::random(),
            conn_id: ConnId::new(7),
            trx_id: TrxId::new(42),
            flags: WsFlags::new(WsFlags::BEGIN | WsFlags::COMMIT),
            last_seen: GlobalSeqno::new(10),
            keys: vec![WsKey::new(&b"t1/pk/5"[..]), WsKey::new(&b"t1/pk/9"[..])],
            data: Bytes::from_static(b"row events"),
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let ws = sample();
        assert_eq!(WriteSet::decode(&ws.encode()).unwrap(), ws);
    }

    #[test]
    fn newer_version_rejected() {
        let mut ws = sample();
        ws.version = WS_VERSION + 1;
        assert!(WriteSet::decode(&ws.encode()).is_err());
    }

    #[test]
    fn strip_keys_preserves_data() {
        let ws = sample();
        let stripped = PayloadCodec.strip_keys(&ws.encode());
        let back = WriteSet::decode(&stripped).unwrap();
        assert!(back.keys.is_empty());
        assert_eq!(back.data, ws.data);
        assert_eq!(back.trx_id, ws.trx_id);
        // smaller on the wire
        assert!(stripped.len() < ws.encode().len());
    }

    #[test]
    fn garbage_rejected() {
        assert!(WriteSet::decode(b"\x01\x02\x03").is_err());
    }

    use proptest::prelude::*;

    proptest! {
        /// Encoding is canonical: every node derives identical bytes for
        /// the same write-set, and decoding is total on encoded input.
        #[test]
        fn prop_encode_is_canonical(
            trx in 0u64..1_000_000,
            last_seen in -1i64..1_000_000,
            keys in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..32), 0..8),
            data in prop::collection::vec(any::<u8>(), 0..256),
        ) {
            let ws = WriteSet {
                version: WS_VERSION,
                source: NodeId::NIL,
                conn_id: ConnId::new(1),
                trx_id: TrxId::new(trx),
                flags: WsFlags::new(WsFlags::BEGIN | WsFlags::COMMIT),
                last_seen: GlobalSeqno::new(last_seen),
                keys: keys.into_iter().map(WsKey::new).collect(),
                data: Bytes::from(data),
            };
            let a = ws.encode();
            let b = ws.encode();
            prop_assert_eq!(&a, &b);
            prop_assert_eq!(WriteSet::decode(&a).unwrap(), ws);
        }

        /// Random bytes never panic the decoder.
        #[test]
        fn prop_decode_rejects_gracefully(bytes in prop::collection::vec(any::<u8>(), 0..128)) {
            let _ = WriteSet::decode(&bytes);
        }
    }
}
