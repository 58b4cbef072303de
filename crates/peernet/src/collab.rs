//! External collaborators the interface actor talks to but never owns.
//!
//! `peernet` has zero dependency on any concrete wallet, storage or GUI
//! stack: everything outside the transport/session/resolver core is expressed
//! as a trait here, the same way the teacher isolates its persistence layer
//! behind `EventSink`/`RecordSink` (`src/event_sink.rs`, `src/record_sink.rs`).
//! A consumer (the root crate, in this workspace) supplies concrete impls.

use super::*;

/// Opaque handle into the blockchain store's registry of known chains.
/// `peernet` never inspects a chain's contents directly; it only compares,
/// stores and threads this id through resolver state.
pub type ChainId = u64;

/// Persistent representation of known chain(s). All methods are safe to call
/// concurrently from multiple interfaces; the resolver itself serializes
/// fork-affecting calls under `NetworkSupervisor::bhi_lock`.
#[async_trait]
pub trait BlockchainStore: Send + Sync {
    /// Returns the chain `header` belongs to at its claimed height, if any
    /// known chain already has exactly that header at that height.
    async fn check_header(&self, header: &HeaderRecord) -> Option<ChainId>;

    /// Returns a chain `header` could be appended to (its `prev_blockhash`
    /// matches that chain's current tip). If `check_height` is true the
    /// header's declared height must also match the chain's height + 1.
    async fn can_connect(&self, header: &HeaderRecord, check_height: bool) -> Option<ChainId>;

    /// Connects a 2016-header chunk (`CHUNK_SIZE * HEADER_SIZE` bytes)
    /// starting at `index * CHUNK_SIZE`. Returns `false` if the chunk does
    /// not connect to any known chain at that position.
    async fn connect_chunk(&self, index: u32, headers: &[u8]) -> Result<bool>;

    /// Forks a new chain off the current best chain at `header`'s height,
    /// recording `header` as the forkpoint.
    async fn fork(&self, header: &HeaderRecord) -> Result<ChainId>;

    /// Forkpoint height of `chain` (the highest height it shares with its
    /// parent, or 0 for the root chain).
    async fn forkpoint(&self, chain: ChainId) -> u32;

    /// Current verified tip height of `chain`.
    async fn height(&self, chain: ChainId) -> u32;

    /// Persists a single header onto `chain` (used when `can_connect`
    /// succeeds outside of chunked fast-forward).
    async fn save_header(&self, chain: ChainId, header: &HeaderRecord) -> Result<()>;

    /// The store's current notion of "best" chain, used to seed `ready`.
    async fn get_best_chain(&self) -> ChainId;

    /// Highest verified height across every known chain; used to seed the
    /// starting point of backward search.
    async fn max_known_height(&self) -> u32;
}

/// Owns the set of interfaces, mediates access to shared chain-resolution
/// state, and selects the "main" interface.
#[async_trait]
pub trait NetworkSupervisor: Send + Sync {
    /// Chain-height-investigation lock: held for the duration of a full
    /// tip-processing call to serialize fork decisions across interfaces.
    fn bhi_lock(&self) -> Arc<tokio::sync::Mutex<()>>;

    /// Whether `server` is this supervisor's currently preferred interface
    /// (affects the log level used for graceful disconnects).
    async fn is_main_server(&self, server: &ServerAddr) -> bool;

    /// Whether admitting a connection in IP bucket `bucket` respects the
    /// supervisor's address-diversity policy.
    async fn admits_ip_bucket(&self, bucket: &str) -> bool;

    /// Called from the interface's teardown path once, regardless of why it
    /// is disconnecting.
    async fn connection_down(&self, server: &ServerAddr);

    async fn switch_unwanted_fork_interface(&self);

    async fn switch_lagging_interface(&self);
}

/// Read-only configuration surface (see spec "Configuration inputs").
pub trait ConfigProvider: Send + Sync {
    fn cert_dir(&self) -> &Path;

    /// Must exceed 500_000 bytes.
    fn max_incoming_frame_size(&self) -> usize;

    fn expected_fingerprint(&self, server: &ServerAddr) -> Option<String>;

    fn proxy(&self) -> Option<ProxyConfig>;

    fn max_checkpoint(&self) -> u32;

    /// Hard-coded header expected at `max_checkpoint`, used to detect a
    /// server whose chain conflicts with checkpoints.
    fn checkpoint_header(&self) -> HeaderRecord;

    /// Fee-ETA confirmation targets in ascending order; the last entry is
    /// excluded from `request_fee_estimates` per spec.
    fn fee_eta_targets(&self) -> &[u32];

    fn client_name(&self) -> &str;

    fn protocol_version(&self) -> &str;
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
}

/// Fire-and-forget event callbacks.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn blockchain_updated(&self);
    async fn network_updated(&self);
    async fn cert_mismatch(&self, server: &ServerAddr);
}
