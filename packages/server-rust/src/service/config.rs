use std::time::Duration;

/// Server-level configuration for query compilation, sessions and live queries.
///
/// Loading from files or the command line is left to the embedding process.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Whether non-master requests may query or write a class that does not
    /// exist yet. Writes then create it; queries return no rows.
    pub allow_client_class_creation: bool,
    /// Maximum nesting of sub-queries (`$select`, `$inQuery`, ...) inside one
    /// request.
    pub max_subquery_depth: usize,
    /// Maximum number of sub-query operators resolved for one request,
    /// counted across every nesting level.
    pub max_subquery_resolutions: usize,
    /// Maximum number of roles visited while computing a user's role closure.
    pub max_role_closure: usize,
    /// Page size for internal lookups and the default `limit` of user queries.
    pub page_size: usize,
    /// Maximum number of resolved sessions kept in memory.
    pub session_cache_capacity: usize,
    /// Upper bound on how long a resolved session stays cached.
    pub session_cache_ttl: Duration,
    /// Live-query delivery settings.
    pub live: LiveQueryConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            allow_client_class_creation: false,
            max_subquery_depth: 16,
            max_subquery_resolutions: 256,
            max_role_closure: 1000,
            page_size: 100,
            session_cache_capacity: 10_000,
            session_cache_ttl: Duration::from_secs(3600),
            live: LiveQueryConfig::default(),
        }
    }
}

/// Live-query delivery configuration controlling fan-out and backpressure.
#[derive(Debug, Clone)]
pub struct LiveQueryConfig {
    /// Number of delivery shards. A client is always served by the same shard.
    pub delivery_workers: usize,
    /// Bounded queue capacity of each delivery shard.
    pub delivery_queue_capacity: usize,
    /// Bounded mpsc channel capacity for outbound messages per client.
    pub client_channel_capacity: usize,
    /// Maximum time to wait when pushing a message to a full client channel.
    pub send_timeout: Duration,
}

impl Default for LiveQueryConfig {
    fn default() -> Self {
        Self {
            delivery_workers: 4,
            delivery_queue_capacity: 256,
            client_channel_capacity: 256,
            send_timeout: Duration::from_secs(5),
        }
    }
}
