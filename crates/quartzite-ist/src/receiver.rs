//! Joiner side of incremental state transfer.
//!
//! The receiver opens a listening endpoint, accepts exactly one donor
//! connection on a background thread and feeds the ordered stream into an
//! [`EventHandler`]. The handler decides what a message means for the
//! replication pipeline:
//!
//! - seqnos below `first` rebuild the certification index only
//!   (`must_apply == false`),
//! - seqnos from `first` on must also be applied.
//!
//! `ready(first)` unblocks the stream once the state snapshot has been
//! committed and the real starting point is known. `interrupt()` aborts the
//! dialog from the joiner side; `finished()` joins the reader thread and
//! reports the last received seqno.

use std::net::TcpListener;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use quartzite_cache::{BufKind, BufferRef, WriteSetCache};
use quartzite_types::{GlobalSeqno, NodeId};

use crate::endpoint::{Endpoint, Scheme, Stream, TlsConfig};
use crate::error::{Error, Result};
use crate::proto::{Proto, CTRL_EOF, CTRL_OK};

// ============================================================================
// Event handler
// ============================================================================

/// Joiner-side consumer of the transfer stream.
pub trait EventHandler: Send + Sync {
    /// An ordered write-set. `skip` marks a placeholder that must be
    /// skipped at apply time.
    fn ist_writeset(
        &self,
        seqno: GlobalSeqno,
        buf: BufferRef,
        skip: bool,
        must_apply: bool,
        preload: bool,
    );

    /// An ordered configuration change.
    fn ist_conf_change(&self, seqno: GlobalSeqno, buf: BufferRef, must_apply: bool, preload: bool);

    /// Stream ended; `Ok` carries the last received seqno.
    fn ist_end(&self, result: std::result::Result<GlobalSeqno, Error>);
}

// ============================================================================
// Receiver configuration
// ============================================================================

/// Settings resolved by the embedder from the parameter store.
#[derive(Debug, Clone, Default)]
pub struct ReceiverConfig {
    /// `ist.recv_addr`: address advertised to the donor.
    pub recv_addr: Option<String>,
    /// `ist.recv_bind`: address the listener binds to, when different
    /// (NAT).
    pub recv_bind: Option<String>,
    /// `base_host`: fallback when no receive address is configured.
    pub base_host: Option<String>,
    /// `base_port`: the receive port defaults to this plus one.
    pub base_port: u16,
    /// `ist.keep_keys`.
    pub keep_keys: bool,
    pub tls: Option<TlsConfig>,
}

impl ReceiverConfig {
    fn default_port(&self) -> u16 {
        self.base_port.wrapping_add(1)
    }

    /// Resolves the advertised and bound endpoints.
    fn resolve(&self) -> Result<(Endpoint, Endpoint)> {
        let prefer_ssl = self.tls.is_some();
        let addr_str = self
            .recv_addr
            .clone()
            .or_else(|| self.base_host.clone())
            .ok_or_else(|| {
                Error::Address("neither ist.recv_addr nor base_host is set".to_string())
            })?;
        let addr = Endpoint::parse(&addr_str, self.default_port(), prefer_ssl)?;
        let bind = match &self.recv_bind {
            Some(b) => Endpoint::parse(b, addr.port, prefer_ssl)?,
            None => addr.clone(),
        };
        Ok((addr, bind))
    }
}

// ============================================================================
// Progress reporting
// ============================================================================

/// Rate limiter for progress logs: at most one update per 10 seconds AND
/// 16 events, whichever comes later.
struct Progress {
    total: i64,
    done: i64,
    events_since: u32,
    last_report: Instant,
}

const PROGRESS_INTERVAL: Duration = Duration::from_secs(10);
const PROGRESS_EVENTS: u32 = 16;

impl Progress {
    fn new(total: i64) -> Self {
        info!(total, "receiving transfer");
        Self {
            total,
            done: 0,
            events_since: 0,
            last_report: Instant::now(),
        }
    }

    fn update(&mut self) {
        self.done += 1;
        self.events_since += 1;
        if self.events_since >= PROGRESS_EVENTS && self.last_report.elapsed() >= PROGRESS_INTERVAL {
            info!(done = self.done, total = self.total, "transfer progress");
            self.events_since = 0;
            self.last_report = Instant::now();
        }
    }

    fn finish(&self) {
        info!(done = self.done, total = self.total, "transfer complete");
    }
}

// ============================================================================
// Receiver
// ============================================================================

#[derive(Debug)]
struct RecvState {
    first: i64,
    last: i64,
    current: i64,
    ready: bool,
    running: bool,
    interrupted: bool,
}

struct Shared {
    state: Mutex<RecvState>,
    cond: Condvar,
    /// Shutdown handle of the accepted donor connection.
    conn: Mutex<Option<crate::endpoint::ShutdownHandle>>,
}

/// The joiner's receive endpoint.
pub struct Receiver {
    conf: ReceiverConfig,
    cache: WriteSetCache,
    handler: Arc<dyn EventHandler>,
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
    recv_addr: Mutex<Option<Endpoint>>,
    version: Mutex<u8>,
    /// Donor node expected on the next connection.
    source: Mutex<NodeId>,
}

impl Receiver {
    pub fn new(conf: ReceiverConfig, cache: WriteSetCache, handler: Arc<dyn EventHandler>) -> Self {
        Self {
            conf,
            cache,
            handler,
            shared: Arc::new(Shared {
                state: Mutex::new(RecvState {
                    first: GlobalSeqno::UNDEFINED.get(),
                    last: GlobalSeqno::UNDEFINED.get(),
                    current: GlobalSeqno::UNDEFINED.get(),
                    ready: false,
                    running: false,
                    interrupted: false,
                }),
                cond: Condvar::new(),
                conn: Mutex::new(None),
            }),
            thread: Mutex::new(None),
            recv_addr: Mutex::new(None),
            version: Mutex::new(0),
            source: Mutex::new(NodeId::NIL),
        }
    }

    /// Opens the listener and spawns the reader thread.
    ///
    /// Returns the address to advertise to the donor; when the configured
    /// port was 0 the actual ephemeral port is substituted.
    pub fn prepare(
        &self,
        first: GlobalSeqno,
        last: GlobalSeqno,
        version: u8,
        source: NodeId,
    ) -> Result<String> {
        let (mut addr, bind) = self.conf.resolve()?;
        let listener = TcpListener::bind(bind.authority())?;
        if addr.port == 0 {
            addr.port = listener.local_addr()?.port();
        }

        {
            let mut state = self.shared.state.lock();
            assert!(!state.running, "receiver already prepared");
            state.first = first.get();
            state.last = last.get();
            state.current = GlobalSeqno::UNDEFINED.get();
            state.ready = false;
            state.running = true;
            state.interrupted = false;
        }
        *self.version.lock() = version;
        *self.source.lock() = source;
        *self.recv_addr.lock() = Some(addr.clone());

        let shared = Arc::clone(&self.shared);
        let handler = Arc::clone(&self.handler);
        let cache = self.cache.clone();
        let scheme = bind.scheme;
        let tls = self.conf.tls.clone();
        let keep_keys = self.conf.keep_keys;

        let thread = std::thread::Builder::new()
            .name("ist-receiver".to_string())
            .spawn(move || {
                let result = run_reader(&shared, &handler, cache, listener, scheme, tls.as_ref(), version, keep_keys);
                let outcome = {
                    let mut state = shared.state.lock();
                    state.running = false;
                    match result {
                        // a shutdown we asked for is an interrupt, not a
                        // stream failure
                        Err(Error::Io(_)) if state.interrupted => Err(Error::Interrupted),
                        Ok(()) if state.last > 0 && state.current < state.last => {
                            Err(Error::Incomplete {
                                current: GlobalSeqno::new(state.current),
                                last: GlobalSeqno::new(state.last),
                            })
                        }
                        Ok(()) => Ok(GlobalSeqno::new(state.current)),
                        Err(e) => Err(e),
                    }
                };
                if let Err(e) = &outcome {
                    if !e.is_interrupt() {
                        error!(error = %e, "transfer stream failed");
                    }
                }
                handler.ist_end(outcome);
            })
            .map_err(Error::Io)?;
        *self.thread.lock() = Some(thread);

        info!(
            first = %first,
            last = %last,
            addr = %addr,
            source = %source,
            "prepared transfer receiver"
        );
        Ok(addr.to_string())
    }

    /// Signals that the state snapshot is committed and the gap starts at
    /// `first`.
    pub fn ready(&self, first: GlobalSeqno) {
        assert!(first.get() > 0);
        let mut state = self.shared.state.lock();
        state.first = first.get();
        state.ready = true;
        self.shared.cond.notify_all();
    }

    /// Aborts the dialog from the joiner side: connects to the own
    /// listener and sends EOF through the handshake, or shuts the active
    /// donor connection down if the stream is already flowing.
    pub fn interrupt(&self) {
        let Some(addr) = self.recv_addr.lock().clone() else {
            return;
        };
        {
            let mut state = self.shared.state.lock();
            if !state.running {
                return;
            }
            state.interrupted = true;
            // release a reader thread parked before ready()
            state.ready = true;
            self.shared.cond.notify_all();
        }
        if let Some(conn) = self.shared.conn.lock().as_ref() {
            conn.shutdown();
            return;
        }
        let version = *self.version.lock();
        let attempt = || -> Result<()> {
            let mut stream = Stream::connect(&addr, self.conf.tls.as_ref())?;
            let proto = Proto::new(self.cache.clone(), version, self.conf.keep_keys);
            proto.send_handshake(&mut stream)?;
            proto.recv_handshake_response(&mut stream)?;
            proto.send_ctrl(&mut stream, CTRL_EOF)?;
            let _ = proto.recv_ctrl(&mut stream);
            Ok(())
        };
        if let Err(e) = attempt() {
            debug!(error = %e, "transfer interrupt connection failed");
        }
    }

    /// Joins the reader thread; returns the last received seqno.
    pub fn finished(&self) -> GlobalSeqno {
        let prepared = self.recv_addr.lock().is_some();
        if !prepared {
            debug!("receiver finished without prepare");
            return GlobalSeqno::UNDEFINED;
        }
        self.interrupt();
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                warn!("receiver thread panicked");
            }
        }
        *self.recv_addr.lock() = None;
        *self.shared.conn.lock() = None;
        let state = self.shared.state.lock();
        GlobalSeqno::new(state.current)
    }

    pub fn running(&self) -> bool {
        self.shared.state.lock().running
    }
}

/// Reader thread body: one accepted connection, the whole dialog.
fn run_reader(
    shared: &Shared,
    handler: &Arc<dyn EventHandler>,
    cache: WriteSetCache,
    listener: TcpListener,
    scheme: Scheme,
    tls: Option<&TlsConfig>,
    version: u8,
    keep_keys: bool,
) -> Result<()> {
    let (sock, peer) = listener.accept()?;
    // single donor: further connects fail fast
    drop(listener);
    debug!(peer = %peer, "donor connected");
    let mut stream = Stream::accept(sock, scheme, tls)?;
    *shared.conn.lock() = stream.shutdown_handle().ok();

    let proto = Proto::new(cache, version, keep_keys);
    proto.recv_handshake(&mut stream)?;
    proto.send_handshake_response(&mut stream)?;
    match proto.recv_ctrl(&mut stream)? {
        CTRL_OK => {}
        CTRL_EOF => return Err(Error::Interrupted),
        code if code < 0 => return Err(Error::PeerError(code)),
        code => return Err(Error::Proto(format!("unexpected ctrl code {code}"))),
    }

    // wait for the snapshot to settle so `first` is known
    let (first, last) = {
        let mut state = shared.state.lock();
        while !state.ready {
            shared.cond.wait(&mut state);
        }
        if state.interrupted {
            return Err(Error::Interrupted);
        }
        (GlobalSeqno::new(state.first), GlobalSeqno::new(state.last))
    };
    info!(first = %first, "transfer apply starts");
    assert!(first.get() > 0);

    let mut progress: Option<Progress> = None;
    let mut preload_started = false;

    loop {
        let Some(msg) = proto.recv_ordered(&mut stream)? else {
            debug!("EOF received, closing transfer stream");
            break;
        };

        let mut state = shared.state.lock();
        if state.current < 0 {
            if msg.seqno > first {
                error!(seqno = %msg.seqno, first = %first, "transfer started past expected seqno");
                return Err(Error::Sequence {
                    expected: first,
                    got: msg.seqno,
                });
            }
            state.current = msg.seqno.get();
            progress = Some(Progress::new(last.get() - state.current + 1));
        } else {
            let expected = GlobalSeqno::new(state.current + 1);
            if msg.seqno != expected {
                error!(seqno = %msg.seqno, expected = %expected, "unexpected transfer seqno");
                return Err(Error::Sequence {
                    expected,
                    got: msg.seqno,
                });
            }
            state.current = msg.seqno.get();
            if let Some(p) = progress.as_mut() {
                p.update();
            }
        }
        let current = GlobalSeqno::new(state.current);
        drop(state);

        let must_apply = current >= first;
        if msg.preload && !preload_started {
            info!(seqno = %current, "certification index preload starting");
            preload_started = true;
        }

        match msg.kind {
            BufKind::WriteSet => {
                handler.ist_writeset(current, msg.buf, msg.skip, must_apply, msg.preload);
            }
            BufKind::ConfChange => {
                handler.ist_conf_change(current, msg.buf, must_apply, msg.preload);
            }
        }
    }

    if let Some(p) = &progress {
        p.finish();
    }
    // half-close: acknowledge the donor's EOF
    let _ = proto.send_ctrl(&mut stream, CTRL_EOF);
    Ok(())
}
