/// GF(2^8) has 255 non-zero elements, which bounds the number of distinct evaluation points.
pub const MAX_SHARDS: usize = 255;

/// Domain tag prepended to every signed shard message.
pub const SIGNING_DOMAIN: &[u8] = b"docshard/shard/v1";

/// Request/response protocol name.
pub const REQRES_PROTOCOL: &str = "/docshard/reqres/1.0.0";

/// Identify protocol version.
pub const IDENTIFY_PROTOCOL: &str = "/docshard/id/1.0.0";

/// How long a combiner waits for shards before giving up.
pub const DEFAULT_COLLECT_TIMEOUT_SECONDS: u64 = 10;

/// Default configuration directory.
pub const DEFAULT_CONFIG_DIR: &str = ".docshard";

/// Upper bound for a single assign or fetch round trip to a holder.
pub const REQUEST_TIMEOUT_SECONDS: u64 = 5;
