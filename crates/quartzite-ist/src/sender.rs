//! Donor side of incremental state transfer.
//!
//! A [`Sender`] connects to a joiner's receive endpoint and replays the
//! requested seqno range out of the local write-set cache, pinning the range
//! against trimming for the duration. [`SenderPool`] runs senders on
//! background threads, one per active joiner, and can cancel them all on
//! donor shutdown.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use quartzite_cache::WriteSetCache;
use quartzite_types::GlobalSeqno;

use crate::endpoint::{Endpoint, ShutdownHandle, Stream, TlsConfig};
use crate::error::{Error, Result};
use crate::proto::{Proto, WriteSetCodec, CTRL_EOF, CTRL_OK};

/// Upper bound on buffers pulled from the cache per batch.
const SEND_BATCH: usize = 1024;

// ============================================================================
// Sender
// ============================================================================

/// One outbound transfer to a joiner.
pub struct Sender {
    stream: Stream,
    proto: Proto,
    cache: WriteSetCache,
    codec: Arc<dyn WriteSetCodec>,
}

impl Sender {
    /// Connects to the joiner's receive endpoint.
    pub fn connect(
        peer: &str,
        cache: WriteSetCache,
        version: u8,
        keep_keys: bool,
        tls: Option<&TlsConfig>,
        codec: Arc<dyn WriteSetCodec>,
    ) -> Result<Self> {
        let endpoint = Endpoint::parse(peer, 0, false)?;
        let stream = Stream::connect(&endpoint, tls)?;
        Ok(Self {
            stream,
            proto: Proto::new(cache.clone(), version, keep_keys),
            cache,
            codec,
        })
    }

    pub fn shutdown_handle(&self) -> Result<ShutdownHandle> {
        self.stream.shutdown_handle()
    }

    /// Replays `[first, last]`, flagging everything at or above
    /// `preload_start` for certification index preload.
    ///
    /// `preload_start <= 0` means the joiner's index was fully reset and no
    /// preload flag is sent.
    pub fn send(
        &mut self,
        first: GlobalSeqno,
        last: GlobalSeqno,
        preload_start: GlobalSeqno,
    ) -> Result<()> {
        // pin the range before reading it
        let _lock = self.cache.seqno_lock(first);

        self.proto.send_handshake(&mut self.stream)?;
        self.proto.recv_handshake_response(&mut self.stream)?;
        self.proto.send_ctrl(&mut self.stream, CTRL_OK)?;

        if first > last || (first.get() == 0 && last.get() == 0) {
            info!("transfer range empty, notifying joiner only");
            return self.send_eof();
        }
        info!(first = %first, last = %last, preload_start = %preload_start, "transfer starting");

        let mut next = first;
        while next <= last {
            let batch = ((last.get() - next.get() + 1) as usize).min(SEND_BATCH);
            let buffers = self.cache.buffers_from(next, batch);
            if buffers.is_empty() {
                return Err(Error::Cache(quartzite_cache::Error::NotFound(next)));
            }
            for buffer in &buffers {
                let preload = preload_start.get() > 0 && buffer.seqno >= preload_start;
                self.proto
                    .send_ordered(&mut self.stream, buffer, preload, self.codec.as_ref())?;
                if buffer.seqno == last {
                    return self.send_eof();
                }
            }
            next = next + buffers.len() as i64;
        }
        self.send_eof()
    }

    /// Sends EOF and waits for the peer's half-close EOF.
    fn send_eof(&mut self) -> Result<()> {
        self.proto.send_ctrl(&mut self.stream, CTRL_EOF)?;
        match self.proto.recv_ctrl(&mut self.stream) {
            Ok(CTRL_EOF) => {}
            Ok(code) => warn!(code, "unexpected control code instead of EOF"),
            // peer may simply close the socket
            Err(Error::Io(_)) => {}
            Err(e) => return Err(e),
        }
        Ok(())
    }
}

// ============================================================================
// Sender pool
// ============================================================================

struct ActiveSender {
    thread: JoinHandle<()>,
    shutdown: Option<ShutdownHandle>,
    peer: String,
}

/// Background senders, one per joiner currently served by this donor.
pub struct SenderPool {
    cache: WriteSetCache,
    keep_keys: bool,
    tls: Option<TlsConfig>,
    codec: Arc<dyn WriteSetCodec>,
    active: Mutex<HashMap<u64, ActiveSender>>,
    next_id: Mutex<u64>,
    /// Completion callback: `(peer, join seqno or negated error code)`.
    on_done: Mutex<Option<Arc<dyn Fn(&str, GlobalSeqno) + Send + Sync>>>,
}

impl SenderPool {
    pub fn new(
        cache: WriteSetCache,
        keep_keys: bool,
        tls: Option<TlsConfig>,
        codec: Arc<dyn WriteSetCodec>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cache,
            keep_keys,
            tls,
            codec,
            active: Mutex::new(HashMap::new()),
            next_id: Mutex::new(0),
            on_done: Mutex::new(None),
        })
    }

    /// Installs a completion callback invoked from sender threads.
    pub fn set_on_done(&self, cb: Arc<dyn Fn(&str, GlobalSeqno) + Send + Sync>) {
        *self.on_done.lock() = Some(cb);
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Spawns a sender serving `peer` on a background thread.
    pub fn run(
        self: &Arc<Self>,
        peer: &str,
        first: GlobalSeqno,
        last: GlobalSeqno,
        preload_start: GlobalSeqno,
        version: u8,
    ) -> Result<()> {
        let mut sender = Sender::connect(
            peer,
            self.cache.clone(),
            version,
            self.keep_keys,
            self.tls.as_ref(),
            Arc::clone(&self.codec),
        )?;
        let shutdown = sender.shutdown_handle().ok();

        let id = {
            let mut next = self.next_id.lock();
            *next += 1;
            *next
        };
        let pool = Arc::clone(self);
        let peer_owned = peer.to_string();
        info!(peer = %peer_owned, first = %first, last = %last, preload_start = %preload_start,
              "async transfer sender starting");

        let thread = std::thread::Builder::new()
            .name(format!("ist-sender-{id}"))
            .spawn(move || {
                let join_seqno = match sender.send(first, last, preload_start) {
                    Ok(()) => last,
                    Err(e) => {
                        error!(peer = %peer_owned, error = %e, "transfer sender failed");
                        GlobalSeqno::UNDEFINED
                    }
                };
                // seqno lock and socket release with the sender
                drop(sender);
                pool.active.lock().remove(&id);
                let cb = pool.on_done.lock().clone();
                if let Some(cb) = cb {
                    cb(&peer_owned, join_seqno);
                }
                debug!(peer = %peer_owned, "transfer sender done");
            })
            .map_err(Error::Io)?;

        self.active.lock().insert(
            id,
            ActiveSender {
                thread,
                shutdown,
                peer: peer.to_string(),
            },
        );
        Ok(())
    }

    /// Cancels every active sender and waits for the threads to finish.
    pub fn cancel(&self) {
        let drained: Vec<ActiveSender> = {
            let mut active = self.active.lock();
            active.drain().map(|(_, s)| s).collect()
        };
        for sender in drained {
            info!(peer = %sender.peer, "cancelling transfer sender");
            if let Some(handle) = &sender.shutdown {
                handle.shutdown();
            }
            if sender.thread.join().is_err() {
                warn!(peer = %sender.peer, "sender thread panicked");
            }
        }
    }
}
