use std::time::Duration;

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_HEADER_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_BLOCK_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_HEADER_WINDOW: usize = 1;
pub const DEFAULT_BLOCK_WINDOW: usize = 50;
pub const DEFAULT_BLOCK_CACHE: usize = 500;
pub const DEFAULT_HEADER_FORWARD_LIMIT: u32 = 5000;
pub const DEFAULT_MIN_PEERS: usize = 1;
pub const DEFAULT_MAX_HEADERS_PER_REPLY: usize = 500;
pub const DEFAULT_BLOCK_RESYNC_DELAY: Duration = Duration::from_millis(10);
pub const DEFAULT_MAX_ERROR_RESPONSES: u32 = 5;
pub const DEFAULT_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Clone, Debug)]
pub struct SyncConfig {
    pub tick_interval: Duration,
    pub header_timeout: Duration,
    pub block_timeout: Duration,
    /// Outstanding header batch requests.
    pub header_window: usize,
    /// Outstanding block requests.
    pub block_window: usize,
    /// Received blocks waiting for their predecessors.
    pub block_cache: usize,
    /// Furthest the header tip may lead the block tip before header sync pauses.
    pub header_forward_limit: u32,
    /// Established sync peers required before header sync starts.
    pub min_peers: usize,
    pub max_headers_per_reply: usize,
    pub block_resync_delay: Duration,
    /// Rejected responses after which a peer is no longer used for sync.
    pub max_error_responses: u32,
    pub keepalive_timeout: Duration,
    pub ping_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tick_interval: DEFAULT_TICK_INTERVAL,
            header_timeout: DEFAULT_HEADER_TIMEOUT,
            block_timeout: DEFAULT_BLOCK_TIMEOUT,
            header_window: DEFAULT_HEADER_WINDOW,
            block_window: DEFAULT_BLOCK_WINDOW,
            block_cache: DEFAULT_BLOCK_CACHE,
            header_forward_limit: DEFAULT_HEADER_FORWARD_LIMIT,
            min_peers: DEFAULT_MIN_PEERS,
            max_headers_per_reply: DEFAULT_MAX_HEADERS_PER_REPLY,
            block_resync_delay: DEFAULT_BLOCK_RESYNC_DELAY,
            max_error_responses: DEFAULT_MAX_ERROR_RESPONSES,
            keepalive_timeout: DEFAULT_KEEPALIVE_TIMEOUT,
            ping_interval: DEFAULT_PING_INTERVAL,
        }
    }
}
