//! Shared constants for Beacon components.

/// Default etcd peers (legacy client port first, then the IANA port)
pub const DEFAULT_PEERS: &str = "http://127.0.0.1:4001,http://127.0.0.1:2379";

/// Default configuration file path
pub const DEFAULT_CONFIG_PATH: &str = "config/beacon.toml";

/// Per-request timeout for non-watch store calls (1 minute)
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

/// Default time between heartbeats (seconds)
pub const DEFAULT_BEAT_INTERVAL_SECS: u64 = 60;

/// Default number of heartbeats (0 = forever)
pub const DEFAULT_BEAT_COUNT: u64 = 0;

/// Lease length as a multiple of the beat period when no lease is configured.
/// A lease of six periods survives several missed ticks.
pub const LEASE_PERIOD_MULTIPLIER: u32 = 6;

/// Store key roots
pub mod keys {
    /// Config variables: /config/{server}/{variable}
    pub const CONFIG_ROOT: &str = "/config";

    /// Liveness tokens: /running/{server}
    pub const RUNNING_ROOT: &str = "/running";
}

/// etcd v2 API details
pub mod etcd {
    /// Keys API path prefix
    pub const KEYS_PATH: &str = "/v2/keys";

    /// Header carrying the cluster-wide index at response time
    pub const INDEX_HEADER: &str = "X-Etcd-Index";

    /// Key not found
    pub const ERR_KEY_NOT_FOUND: u32 = 100;

    /// Compare failed (prevValue / prevIndex mismatch)
    pub const ERR_TEST_FAILED: u32 = 101;

    /// Key already exists (prevExist=false)
    pub const ERR_NODE_EXIST: u32 = 105;

    /// Insufficient credentials
    pub const ERR_UNAUTHORIZED: u32 = 110;

    /// Raft internal error
    pub const ERR_RAFT_INTERNAL: u32 = 300;

    /// During leader election
    pub const ERR_LEADER_ELECT: u32 = 301;

    /// The event in requested index is outdated and cleared
    pub const ERR_EVENT_INDEX_CLEARED: u32 = 401;
}
