//! Constants for the container engine.
//!
//! All limits, timeouts and reserved names live here so the rest of the
//! codebase stays free of magic numbers.

// =============================================================================
// Container Naming
// =============================================================================

/// The root of the container tree.
pub const ROOT_CONTAINER: &str = "/";

/// Reserved name resolving to the caller's own container.
pub const SELF_CONTAINER: &str = "self";

/// Reserved name resolving to the parent of the caller's scope.
pub const DOT_CONTAINER: &str = ".";

/// Absolute-name prefix accepted from clients; the remainder must stay
/// inside the caller's scope.
pub const ROOT_SCOPE: &str = "/paddock/";

/// Maximum length of one name component.
pub const CONTAINER_NAME_MAX: usize = 200;

/// Maximum length of a full container path.
pub const CONTAINER_PATH_MAX: usize = 1024;

/// Maximum tree depth, root excluded.
pub const CONTAINER_LEVEL_MAX: u32 = 7;

/// Highest id handed out by the id pool.
pub const CONTAINER_ID_MAX: u32 = 16384;

// =============================================================================
// Cgroups
// =============================================================================

/// Directory under every hierarchy root that holds container cgroups.
pub const CGROUP_PREFIX: &str = "/paddock";

// =============================================================================
// Timeouts and Intervals (milliseconds)
// =============================================================================

/// Deadline for the launcher handshake before the partial container is
/// torn down.
pub const DEFAULT_START_TIMEOUT_MS: u64 = 300_000;

/// Grace period between SIGTERM and SIGKILL on stop.
pub const DEFAULT_KILL_TIMEOUT_MS: u64 = 1_000;

/// Default delay before a dead container respawns.
pub const DEFAULT_RESPAWN_DELAY_MS: u64 = 1_000;

/// Default time a dead container is kept before the aging reap.
pub const DEFAULT_AGING_TIME_MS: u64 = 60 * 60 * 24 * 1_000;

/// Interval between log-rotation ticks, which also drive aging.
pub const LOG_ROTATE_INTERVAL_MS: u64 = 60_000;

// =============================================================================
// Daemon Limits
// =============================================================================

/// Default number of RPC worker threads.
pub const DEFAULT_WORKERS: usize = 32;

/// Default number of event-queue worker threads.
pub const DEFAULT_EVENT_WORKERS: usize = 1;

/// Default cap on simultaneously connected clients.
pub const DEFAULT_MAX_CLIENTS: usize = 512;

/// Default cap on live containers.
pub const DEFAULT_MAX_CONTAINERS: usize = 3000;

/// Default cap on a single request frame.
pub const DEFAULT_MAX_MSG_LEN: usize = 32 * 1024 * 1024;

/// Default on-disk cap for stdout/stderr streams.
pub const DEFAULT_STDOUT_LIMIT: u64 = 8 * 1024 * 1024;

// =============================================================================
// Paths
// =============================================================================

/// Default control socket path.
pub const DEFAULT_SOCKET_PATH: &str = "/run/paddockd.socket";

/// Default group owning the control socket.
pub const DEFAULT_SOCKET_GROUP: &str = "paddock";

/// Default root for per-container key-value records.
pub const DEFAULT_KEYVALUE_ROOT: &str = "/run/paddock/kvs";

/// Default parent for container working directories.
pub const DEFAULT_TMP_DIR: &str = "/place/paddock";

/// Default daemon config path when argv does not name one.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/paddock.conf";

// =============================================================================
// Environment
// =============================================================================

/// Locked env var carrying the container's absolute name.
pub const ENV_CONTAINER_NAME: &str = "PADDOCK_NAME";

/// Locked env var carrying the host's hostname.
pub const ENV_CONTAINER_HOST: &str = "PADDOCK_HOST";

/// Default PATH inside workloads.
pub const ENV_DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

// =============================================================================
// Persistent Record Keys
// =============================================================================

/// Reserved record key holding the container id.
pub const KV_KEY_ID: &str = "_id";

/// Reserved record key holding the container name.
pub const KV_KEY_NAME: &str = "_name";

/// Record key holding the textual state; always written last.
pub const KV_KEY_STATE: &str = "state";
