//! IST wire protocol: framed messages and the transfer dialog.
//!
//! Every message starts with a fixed header. From wire version 10 on:
//!
//! ```text
//! version(1) | type(1) | flags(1) | ctrl(1) | length(4) | seqno(8) | checksum(8)
//! ```
//!
//! The checksum is a 64-bit fast hash over the header bytes preceding the
//! checksum field, endian-normalized; any mismatch is fatal for the stream.
//! Earlier wire versions use a 12-byte header without seqno/checksum and
//! carry `(seqno_g, seqno_d)` trx metadata at the start of the payload.
//!
//! Dialog (sender = donor, receiver = joiner):
//!
//! ```text
//! sender  --- HANDSHAKE ----------> receiver
//! sender  <-- HANDSHAKE_RESPONSE -- receiver
//! sender  --- CTRL(OK) -----------> receiver
//! sender  --- ordered messages ---> receiver     (TRX | CCHANGE | SKIP)
//! sender  --- CTRL(EOF) ----------> receiver
//! sender  <-- CTRL(EOF) ----------- receiver     (half-close)
//! ```
//!
//! The receiver may abort early by sending `CTRL(EOF)`, which the joiner
//! uses as a shutdown interrupt.

use std::io::{Read, Write};

use byteorder::{ByteOrder, LittleEndian};
use bytes::Bytes;
use tracing::{debug, trace};
use twox_hash::XxHash64;

use quartzite_cache::{BufKind, BufferRef, SeqnoBuffer, WriteSetCache};
use quartzite_types::GlobalSeqno;

use crate::error::{Error, Result};

// ============================================================================
// Versions and constants
// ============================================================================

/// First wire version with the checksummed 24-byte header.
pub const WIRE_VER_CHECKSUMMED: u8 = 10;
/// Oldest wire version still spoken.
pub const WIRE_VER_MIN: u8 = 4;
/// Current wire version.
pub const WIRE_VER_CURRENT: u8 = 10;

/// Seed for the header checksum; fixed by the wire protocol.
const HEADER_HASH_SEED: u64 = 0;

const HEADER_SIZE_V10: usize = 24;
const HEADER_SIZE_LEGACY: usize = 12;
/// `(seqno_g, seqno_d)` prefix carried in legacy TRX payloads.
const LEGACY_META_SIZE: usize = 16;

/// Message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgKind {
    None = 0,
    Handshake = 1,
    HandshakeResponse = 2,
    Ctrl = 3,
    Trx = 4,
    ConfChange = 5,
    Skip = 6,
}

impl MsgKind {
    fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            0 => MsgKind::None,
            1 => MsgKind::Handshake,
            2 => MsgKind::HandshakeResponse,
            3 => MsgKind::Ctrl,
            4 => MsgKind::Trx,
            5 => MsgKind::ConfChange,
            6 => MsgKind::Skip,
            other => return Err(Error::Proto(format!("unknown message type {other}"))),
        })
    }
}

/// Header flag: the message belongs to the certification index preload
/// range.
pub const FLAG_PRELOAD: u8 = 0x1;

/// Control codes; negative values are reserved for errors.
pub const CTRL_OK: i8 = 0;
pub const CTRL_EOF: i8 = 1;

// ============================================================================
// Frame
// ============================================================================

/// A decoded message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub version: u8,
    pub kind: MsgKind,
    pub flags: u8,
    pub ctrl: i8,
    pub len: u32,
    pub seqno: GlobalSeqno,
}

impl Frame {
    pub fn new(version: u8, kind: MsgKind) -> Self {
        Self {
            version,
            kind,
            flags: 0,
            ctrl: 0,
            len: 0,
            seqno: GlobalSeqno::UNDEFINED,
        }
    }

    pub fn ctrl(version: u8, code: i8) -> Self {
        Self {
            ctrl: code,
            ..Self::new(version, MsgKind::Ctrl)
        }
    }

    pub fn ordered(version: u8, kind: MsgKind, flags: u8, len: u32, seqno: GlobalSeqno) -> Self {
        Self {
            version,
            kind,
            flags,
            ctrl: 0,
            len,
            seqno,
        }
    }

    /// Serialized header size for `version`.
    pub const fn serial_size(version: u8) -> usize {
        if version >= WIRE_VER_CHECKSUMMED {
            HEADER_SIZE_V10
        } else {
            HEADER_SIZE_LEGACY
        }
    }

    /// Encodes the header, including the checksum for v10+.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = vec![0u8; Self::serial_size(self.version)];
        buf[0] = self.version;
        buf[1] = self.kind as u8;
        buf[2] = self.flags;
        buf[3] = self.ctrl as u8;
        if self.version >= WIRE_VER_CHECKSUMMED {
            LittleEndian::write_u32(&mut buf[4..8], self.len);
            LittleEndian::write_i64(&mut buf[8..16], self.seqno.get());
            let sum = XxHash64::oneshot(HEADER_HASH_SEED, &buf[..16]);
            LittleEndian::write_u64(&mut buf[16..24], sum);
        } else {
            LittleEndian::write_u64(&mut buf[4..12], u64::from(self.len));
        }
        buf
    }

    /// Decodes and validates a header read off the wire.
    pub fn unserialize(buf: &[u8], expected_version: u8) -> Result<Self> {
        assert_eq!(buf.len(), Self::serial_size(expected_version));

        let version = buf[0];
        if version != expected_version {
            return Err(Error::VersionMismatch {
                peer: version,
                expected: expected_version,
            });
        }

        let flags = buf[2];
        let ctrl = buf[3] as i8;

        if version >= WIRE_VER_CHECKSUMMED {
            // checksum guards the whole header; verify before interpreting
            // anything else
            let expected = XxHash64::oneshot(HEADER_HASH_SEED, &buf[..16]);
            let found = LittleEndian::read_u64(&buf[16..24]);
            if expected != found {
                return Err(Error::Corrupted);
            }
            let kind = MsgKind::from_u8(buf[1])?;
            let len = LittleEndian::read_u32(&buf[4..8]);
            let seqno = LittleEndian::read_i64(&buf[8..16]);
            Ok(Frame {
                version,
                kind,
                flags,
                ctrl,
                len,
                seqno: GlobalSeqno::new(seqno),
            })
        } else {
            let kind = MsgKind::from_u8(buf[1])?;
            let len = LittleEndian::read_u64(&buf[4..12]);
            Ok(Frame {
                version,
                kind,
                flags,
                ctrl,
                len: len as u32,
                seqno: GlobalSeqno::UNDEFINED,
            })
        }
    }
}

// ============================================================================
// Write-set codec hook
// ============================================================================

/// Donor-side knowledge about the write-set payload encoding.
///
/// The payload format belongs to the replicator; the transfer layer only
/// needs two projections of it: the key-free form (when `ist.keep_keys` is
/// off) and the dependency seqno (legacy wire metadata).
pub trait WriteSetCodec: Send + Sync {
    /// Returns the payload with certification keys stripped.
    fn strip_keys(&self, payload: &Bytes) -> Bytes;

    /// Dependency seqno recorded in the payload.
    fn depends_seqno(&self, payload: &Bytes) -> GlobalSeqno;
}

/// Passes payloads through untouched; for callers that always keep keys.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityCodec;

impl WriteSetCodec for IdentityCodec {
    fn strip_keys(&self, payload: &Bytes) -> Bytes {
        payload.clone()
    }

    fn depends_seqno(&self, payload: &Bytes) -> GlobalSeqno {
        let _ = payload;
        GlobalSeqno::UNDEFINED
    }
}

// ============================================================================
// Ordered receive result
// ============================================================================

/// One ordered message delivered to the joiner; `None` payload variants are
/// folded into [`MsgKind`] by the caller.
#[derive(Debug)]
pub struct OrderedRecv {
    pub seqno: GlobalSeqno,
    pub kind: BufKind,
    pub skip: bool,
    pub preload: bool,
    pub buf: BufferRef,
}

// ============================================================================
// Proto
// ============================================================================

/// The transfer dialog over any blocking byte stream.
pub struct Proto {
    cache: WriteSetCache,
    version: u8,
    keep_keys: bool,
    raw_sent: u64,
    real_sent: u64,
}

impl Proto {
    pub fn new(cache: WriteSetCache, version: u8, keep_keys: bool) -> Self {
        assert!((WIRE_VER_MIN..=WIRE_VER_CURRENT).contains(&version));
        Self {
            cache,
            version,
            keep_keys,
            raw_sent: 0,
            real_sent: 0,
        }
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    fn send_frame<S: Write>(&self, socket: &mut S, frame: &Frame) -> Result<()> {
        socket.write_all(&frame.serialize())?;
        Ok(())
    }

    fn recv_frame<S: Read>(&self, socket: &mut S) -> Result<Frame> {
        let mut buf = vec![0u8; Frame::serial_size(self.version)];
        socket.read_exact(&mut buf)?;
        Frame::unserialize(&buf, self.version)
    }

    pub fn send_handshake<S: Write>(&self, socket: &mut S) -> Result<()> {
        self.send_frame(socket, &Frame::new(self.version, MsgKind::Handshake))
    }

    pub fn recv_handshake<S: Read>(&self, socket: &mut S) -> Result<()> {
        let frame = self.recv_frame(socket)?;
        match frame.kind {
            MsgKind::Handshake => Ok(()),
            MsgKind::Ctrl if frame.ctrl == CTRL_EOF => Err(Error::Interrupted),
            MsgKind::Ctrl => Err(Error::Proto(format!("unexpected ctrl code {}", frame.ctrl))),
            other => Err(Error::Proto(format!("unexpected message type {other:?}"))),
        }
    }

    pub fn send_handshake_response<S: Write>(&self, socket: &mut S) -> Result<()> {
        self.send_frame(socket, &Frame::new(self.version, MsgKind::HandshakeResponse))
    }

    pub fn recv_handshake_response<S: Read>(&self, socket: &mut S) -> Result<()> {
        let frame = self.recv_frame(socket)?;
        match frame.kind {
            MsgKind::HandshakeResponse => Ok(()),
            MsgKind::Ctrl if frame.ctrl == CTRL_EOF => Err(Error::Interrupted),
            MsgKind::Ctrl => Err(Error::Proto(format!("unexpected ctrl code {}", frame.ctrl))),
            other => Err(Error::Proto(format!("unexpected message type {other:?}"))),
        }
    }

    pub fn send_ctrl<S: Write>(&self, socket: &mut S, code: i8) -> Result<()> {
        self.send_frame(socket, &Frame::ctrl(self.version, code))
    }

    pub fn recv_ctrl<S: Read>(&self, socket: &mut S) -> Result<i8> {
        let frame = self.recv_frame(socket)?;
        match frame.kind {
            MsgKind::Ctrl => Ok(frame.ctrl),
            other => Err(Error::Proto(format!("unexpected message type {other:?}"))),
        }
    }

    /// Streams one cached buffer to the joiner.
    pub fn send_ordered<S: Write>(
        &mut self,
        socket: &mut S,
        buffer: &SeqnoBuffer,
        preload: bool,
        codec: &dyn WriteSetCodec,
    ) -> Result<()> {
        let legacy = self.version < WIRE_VER_CHECKSUMMED;
        let mut kind = if buffer.skip {
            MsgKind::Skip
        } else {
            match buffer.kind {
                BufKind::WriteSet => MsgKind::Trx,
                // the pre-v10 wire has no conf change type; peers of that
                // era skip over the seqno
                BufKind::ConfChange if legacy => MsgKind::Skip,
                BufKind::ConfChange => MsgKind::ConfChange,
            }
        };

        let mut depends = GlobalSeqno::UNDEFINED;
        let payload: Bytes = if kind == MsgKind::Skip {
            Bytes::new()
        } else if self.keep_keys || kind == MsgKind::ConfChange {
            if legacy && kind == MsgKind::Trx {
                depends = codec.depends_seqno(buffer.buf.data());
            }
            buffer.buf.data().clone()
        } else {
            depends = codec.depends_seqno(buffer.buf.data());
            codec.strip_keys(buffer.buf.data())
        };

        if legacy {
            // pre-v10 wire: everything is a TRX, skips are signaled through
            // an undefined depends seqno in the metadata
            match kind {
                MsgKind::Trx => {
                    if depends.is_undefined() {
                        // no dependency info: serialize against the
                        // predecessor rather than look like a skip
                        depends = GlobalSeqno::new((buffer.seqno.get() - 1).max(0));
                    }
                }
                MsgKind::Skip => {
                    kind = MsgKind::Trx;
                    depends = GlobalSeqno::UNDEFINED;
                }
                _ => unreachable!("legacy kinds are TRX or SKIP"),
            }
        }

        let meta_size = if legacy { LEGACY_META_SIZE } else { 0 };
        let flags = if !legacy && preload { FLAG_PRELOAD } else { 0 };
        let frame = Frame::ordered(
            self.version,
            kind,
            flags,
            (meta_size + payload.len()) as u32,
            buffer.seqno,
        );

        self.send_frame(socket, &frame)?;
        if legacy {
            let mut meta = [0u8; LEGACY_META_SIZE];
            LittleEndian::write_i64(&mut meta[0..8], buffer.seqno.get());
            LittleEndian::write_i64(&mut meta[8..16], depends.get());
            socket.write_all(&meta)?;
        }
        if !payload.is_empty() {
            socket.write_all(&payload)?;
        }

        self.raw_sent += buffer.buf.len() as u64;
        self.real_sent += payload.len() as u64;
        trace!(seqno = %buffer.seqno, kind = ?frame.kind, len = payload.len(), "sent ordered");
        Ok(())
    }

    fn skip_bytes<S: Read>(&self, socket: &mut S, mut bytes: usize) -> Result<()> {
        let mut sink = [0u8; 4096];
        while bytes > 0 {
            let n = socket.read(&mut sink[..bytes.min(4096)])?;
            if n == 0 {
                return Err(Error::Proto("EOF while skipping payload".to_string()));
            }
            bytes -= n;
        }
        Ok(())
    }

    /// Receives one ordered message; `None` marks the end of the stream.
    ///
    /// Payloads go into the cache. A preloaded seqno that is already cached
    /// (concurrent normal receive) is skipped on the wire and the cached
    /// copy reused.
    pub fn recv_ordered<S: Read>(&self, socket: &mut S) -> Result<Option<OrderedRecv>> {
        let frame = self.recv_frame(socket)?;

        let (kind, seqno, payload_len, skip) = match frame.kind {
            MsgKind::Ctrl => {
                return match frame.ctrl {
                    CTRL_EOF => Ok(None),
                    code if code < 0 => Err(Error::PeerError(code)),
                    code => Err(Error::Proto(format!("unexpected ctrl code {code}"))),
                };
            }
            MsgKind::Trx | MsgKind::ConfChange | MsgKind::Skip
                if self.version >= WIRE_VER_CHECKSUMMED =>
            {
                let kind = match frame.kind {
                    MsgKind::ConfChange => BufKind::ConfChange,
                    _ => BufKind::WriteSet,
                };
                (kind, frame.seqno, frame.len as usize, frame.kind == MsgKind::Skip)
            }
            MsgKind::Trx => {
                // legacy wire: metadata prefix decides between trx and skip
                let mut meta = [0u8; LEGACY_META_SIZE];
                socket.read_exact(&mut meta)?;
                let seqno = LittleEndian::read_i64(&meta[0..8]);
                let depends = LittleEndian::read_i64(&meta[8..16]);
                if seqno <= 0 {
                    return Err(Error::Proto(format!("non-positive sequence number {seqno}")));
                }
                let payload_len = (frame.len as usize)
                    .checked_sub(LEGACY_META_SIZE)
                    .ok_or_else(|| Error::Proto("message shorter than metadata".to_string()))?;
                (BufKind::WriteSet, GlobalSeqno::new(seqno), payload_len, depends < 0)
            }
            other => {
                return Err(Error::Proto(format!("unexpected message type {other:?}")));
            }
        };

        if seqno.get() <= 0 {
            return Err(Error::Proto(format!("non-positive sequence number {seqno}")));
        }

        let preload = frame.flags & FLAG_PRELOAD != 0;

        // Index preload messages may duplicate buffers already received
        // through the group channel.
        if preload {
            if let Ok(cached) = self.cache.seqno_buffer(seqno) {
                self.skip_bytes(socket, payload_len)?;
                debug!(seqno = %seqno, "preload seqno already cached");
                return Ok(Some(OrderedRecv {
                    seqno,
                    kind: cached.kind,
                    skip: cached.skip,
                    preload,
                    buf: cached.buf,
                }));
            }
        }

        let buf = if skip || payload_len == 0 {
            self.cache.store(Bytes::new())
        } else {
            let mut data = vec![0u8; payload_len];
            socket.read_exact(&mut data)?;
            self.cache.store(Bytes::from(data))
        };
        self.cache.seqno_assign(&buf, seqno, kind, skip)?;

        Ok(Some(OrderedRecv {
            seqno,
            kind,
            skip,
            preload,
            buf,
        }))
    }
}

impl Drop for Proto {
    fn drop(&mut self) {
        if self.raw_sent > 0 {
            tracing::info!(
                raw_sent = self.raw_sent,
                real_sent = self.real_sent,
                frac = self.real_sent as f64 / self.raw_sent as f64,
                "transfer protocol finished"
            );
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn v10_header_round_trip() {
        let frame = Frame::ordered(10, MsgKind::Trx, FLAG_PRELOAD, 4096, GlobalSeqno::new(87));
        let bytes = frame.serialize();
        assert_eq!(bytes.len(), 24);
        assert_eq!(Frame::unserialize(&bytes, 10).unwrap(), frame);
    }

    #[test]
    fn legacy_header_round_trip() {
        let frame = Frame::ctrl(9, CTRL_EOF);
        let bytes = frame.serialize();
        assert_eq!(bytes.len(), 12);
        let back = Frame::unserialize(&bytes, 9).unwrap();
        assert_eq!(back.kind, MsgKind::Ctrl);
        assert_eq!(back.ctrl, CTRL_EOF);
    }

    #[test]
    fn version_mismatch_rejected() {
        let bytes = Frame::new(10, MsgKind::Handshake).serialize();
        let mut wrong = bytes.clone();
        wrong[0] = 9;
        // byte 0 participates in the checksum, but the version check fires
        // first
        assert!(matches!(
            Frame::unserialize(&wrong, 10),
            Err(Error::VersionMismatch { peer: 9, expected: 10 })
        ));
    }

    proptest! {
        /// Round trip holds for arbitrary valid headers.
        #[test]
        fn prop_header_round_trip(
            kind in 0u8..7,
            flags in prop::sample::select(vec![0u8, FLAG_PRELOAD]),
            ctrl in -4i8..4,
            len in 0u32..u32::MAX,
            seqno in 1i64..i64::MAX,
        ) {
            let frame = Frame {
                version: 10,
                kind: MsgKind::from_u8(kind).unwrap(),
                flags,
                ctrl,
                len,
                seqno: GlobalSeqno::new(seqno),
            };
            let bytes = frame.serialize();
            prop_assert_eq!(Frame::unserialize(&bytes, 10).unwrap(), frame);
        }

        /// Any single-bit flip in a v10 header is detected.
        #[test]
        fn prop_single_bit_flip_detected(
            len in 0u32..1_000_000,
            seqno in 1i64..1_000_000_000,
            bit in 0usize..(24 * 8),
        ) {
            let frame = Frame::ordered(10, MsgKind::Trx, 0, len, GlobalSeqno::new(seqno));
            let mut bytes = frame.serialize();
            bytes[bit / 8] ^= 1 << (bit % 8);

            let result = Frame::unserialize(&bytes, 10);
            if bit < 8 {
                // version byte: detected as a peer version mismatch
                prop_assert!(result.is_err(), "bit flip at {} went unnoticed", bit);
            } else {
                prop_assert!(
                    matches!(result, Err(Error::Corrupted)),
                    "bit flip at {} not reported as corruption", bit
                );
            }
        }
    }

    #[test]
    fn ordered_message_over_pipe() {
        use std::io::Cursor;

        let donor_cache = WriteSetCache::new();
        let joiner_cache = WriteSetCache::new();

        let data = Bytes::from_static(b"some write set bytes");
        let buf = donor_cache.store(data.clone());
        donor_cache
            .seqno_assign(&buf, GlobalSeqno::new(5), BufKind::WriteSet, false)
            .unwrap();
        let sb = donor_cache.seqno_buffer(GlobalSeqno::new(5)).unwrap();

        let mut sender = Proto::new(donor_cache, 10, true);
        let mut wire = Vec::new();
        sender.send_ordered(&mut wire, &sb, true, &IdentityCodec).unwrap();

        let receiver = Proto::new(joiner_cache.clone(), 10, true);
        let got = receiver
            .recv_ordered(&mut Cursor::new(wire))
            .unwrap()
            .expect("not EOF");

        assert_eq!(got.seqno, GlobalSeqno::new(5));
        assert!(got.preload);
        assert!(!got.skip);
        assert_eq!(got.buf.data(), &data);
        // assigned into the joiner cache
        assert!(joiner_cache.seqno_buffer(GlobalSeqno::new(5)).is_ok());
    }

    #[test]
    fn skip_message_has_no_payload() {
        use std::io::Cursor;

        let donor_cache = WriteSetCache::new();
        let buf = donor_cache.store(Bytes::from_static(b"ignored"));
        donor_cache
            .seqno_assign(&buf, GlobalSeqno::new(3), BufKind::WriteSet, true)
            .unwrap();
        let sb = donor_cache.seqno_buffer(GlobalSeqno::new(3)).unwrap();

        let mut sender = Proto::new(donor_cache, 10, true);
        let mut wire = Vec::new();
        sender.send_ordered(&mut wire, &sb, false, &IdentityCodec).unwrap();
        assert_eq!(wire.len(), 24); // header only

        let joiner_cache = WriteSetCache::new();
        let receiver = Proto::new(joiner_cache, 10, true);
        let got = receiver
            .recv_ordered(&mut Cursor::new(wire))
            .unwrap()
            .expect("not EOF");
        assert!(got.skip);
        assert!(got.buf.is_empty());
    }

    #[test]
    fn eof_ctrl_ends_stream() {
        use std::io::Cursor;

        let cache = WriteSetCache::new();
        let proto = Proto::new(cache.clone(), 10, true);
        let mut wire = Vec::new();
        proto.send_ctrl(&mut wire, CTRL_EOF).unwrap();

        let got = proto.recv_ordered(&mut Cursor::new(wire)).unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn negative_ctrl_is_peer_error() {
        use std::io::Cursor;

        let cache = WriteSetCache::new();
        let proto = Proto::new(cache, 10, true);
        let mut wire = Vec::new();
        proto.send_ctrl(&mut wire, -5).unwrap();

        assert!(matches!(
            proto.recv_ordered(&mut Cursor::new(wire)),
            Err(Error::PeerError(-5))
        ));
    }
}
