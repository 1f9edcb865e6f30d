//! Parameter registration and typed access for the replicator.

use std::time::Duration;

use quartzite_config::{ParamKind, ParamStore};

use crate::error::{Error, Result};
use crate::orders::CommitOrderMode;

/// Parameter keys.
pub mod keys {
    pub const BASE_HOST: &str = "base_host";
    pub const BASE_PORT: &str = "base_port";
    pub const BASE_DIR: &str = "base_dir";
    pub const PROTO_MAX: &str = "repl.proto_max";
    pub const KEY_FORMAT: &str = "repl.key_format";
    pub const COMMIT_ORDER: &str = "repl.commit_order";
    pub const CAUSAL_READ_TIMEOUT: &str = "repl.causal_read_timeout";
    pub const MAX_WS_SIZE: &str = "repl.max_ws_size";
    pub const IST_RECV_ADDR: &str = "ist.recv_addr";
    pub const IST_RECV_BIND: &str = "ist.recv_bind";
    pub const IST_KEEP_KEYS: &str = "ist.keep_keys";
}

pub const BASE_PORT_DEFAULT: u16 = 4567;
/// Highest replication protocol version this build speaks.
pub const MAX_PROTO_VER: i32 = 10;
/// First protocol version with totally ordered configuration changes.
pub const PROTO_VER_ORDERED_CC: i32 = 8;

const MAX_WS_SIZE_DEFAULT: usize = 2_147_483_647;

/// Registers every replicator parameter with its default.
pub fn register(params: &mut ParamStore) {
    params.register(keys::BASE_HOST, "", ParamKind::String, false);
    params.register(
        keys::BASE_PORT,
        &BASE_PORT_DEFAULT.to_string(),
        ParamKind::Port,
        false,
    );
    params.register(keys::BASE_DIR, ".", ParamKind::String, false);
    params.register(
        keys::PROTO_MAX,
        &MAX_PROTO_VER.to_string(),
        ParamKind::I64,
        false,
    );
    params.register(keys::KEY_FORMAT, "FLAT8", ParamKind::String, false);
    // not runtime-settable: commit ordering is wired into the monitors
    params.register(keys::COMMIT_ORDER, "3", ParamKind::I64, false);
    params.register(keys::CAUSAL_READ_TIMEOUT, "PT30S", ParamKind::Duration, true);
    params.register(
        keys::MAX_WS_SIZE,
        &MAX_WS_SIZE_DEFAULT.to_string(),
        ParamKind::I64,
        true,
    );
    params.register(keys::IST_RECV_ADDR, "", ParamKind::String, false);
    params.register(keys::IST_RECV_BIND, "", ParamKind::String, false);
    params.register(keys::IST_KEEP_KEYS, "true", ParamKind::Bool, false);
}

/// Values resolved once at construction.
#[derive(Debug, Clone)]
pub struct ResolvedParams {
    pub base_host: Option<String>,
    pub base_port: u16,
    pub base_dir: String,
    pub proto_max: i32,
    pub commit_order: CommitOrderMode,
    pub causal_read_timeout: Duration,
    pub max_ws_size: usize,
    pub ist_recv_addr: Option<String>,
    pub ist_recv_bind: Option<String>,
    pub ist_keep_keys: bool,
}

impl ResolvedParams {
    pub fn from_store(params: &ParamStore) -> Result<Self> {
        let commit_order_raw = params.get_i64(keys::COMMIT_ORDER)?;
        let commit_order = CommitOrderMode::from_i64(commit_order_raw).ok_or_else(|| {
            Error::Config(quartzite_config::Error::InvalidValue {
                key: keys::COMMIT_ORDER.to_string(),
                value: commit_order_raw.to_string(),
                reason: "must be 0..=3".to_string(),
            })
        })?;

        let proto_max = params.get_i64(keys::PROTO_MAX)? as i32;
        if !(1..=MAX_PROTO_VER).contains(&proto_max) {
            return Err(Error::UnsupportedProtocol(proto_max));
        }

        let non_empty = |key: &str| -> Result<Option<String>> {
            let v = params.get(key)?;
            Ok(if v.is_empty() { None } else { Some(v.to_string()) })
        };

        Ok(Self {
            base_host: non_empty(keys::BASE_HOST)?,
            base_port: params.get_port(keys::BASE_PORT)?,
            base_dir: params.get(keys::BASE_DIR)?.to_string(),
            proto_max,
            commit_order,
            causal_read_timeout: params.get_duration(keys::CAUSAL_READ_TIMEOUT)?,
            max_ws_size: params.get_i64(keys::MAX_WS_SIZE)?.max(0) as usize,
            ist_recv_addr: non_empty(keys::IST_RECV_ADDR)?,
            ist_recv_bind: non_empty(keys::IST_RECV_BIND)?,
            ist_keep_keys: params.get_bool(keys::IST_KEEP_KEYS)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_resolve() {
        let mut params = ParamStore::new();
        register(&mut params);
        let resolved = ResolvedParams::from_store(&params).unwrap();

        assert_eq!(resolved.base_port, 4567);
        assert_eq!(resolved.commit_order, CommitOrderMode::NoOooc);
        assert_eq!(resolved.causal_read_timeout, Duration::from_secs(30));
        assert!(resolved.ist_keep_keys);
        assert_eq!(resolved.proto_max, MAX_PROTO_VER);
        assert!(resolved.base_host.is_none());
    }

    #[test]
    fn commit_order_is_frozen_after_seal() {
        let mut params = ParamStore::new();
        register(&mut params);
        params.set(keys::COMMIT_ORDER, "1").unwrap();
        params.seal();
        assert!(params.set(keys::COMMIT_ORDER, "3").is_err());
        // runtime keys stay settable
        params.set(keys::CAUSAL_READ_TIMEOUT, "PT5S").unwrap();
    }

    #[test]
    fn bad_commit_order_rejected() {
        let mut params = ParamStore::new();
        register(&mut params);
        params.set(keys::COMMIT_ORDER, "9").unwrap();
        assert!(ResolvedParams::from_store(&params).is_err());
    }
}
