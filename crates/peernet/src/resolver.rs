//! Chain resolution state machine: turns a stream of tip notifications into
//! a sequence of header fetches that keep the local view of the remote's
//! chain up to date, including backward/binary search when the tip turns out
//! to live on a fork the store has never seen.
//!
//! Grounded against `examples/original_source/electrum/interface.py`'s
//! `sync_until`/`step`/`_search_headers_backwards`/`_search_headers_binary`/
//! `_resolve_potential_chain_fork_given_forkpoint`, translated into
//! ownership-checked async Rust: the Python keeps a `chain` local that may be
//! `None` across a loop iteration (an inadvertent side effect, not load
//! bearing); here `chain` is only ever assigned from a header that actually
//! resolved to a known chain.

use {
    super::*,
    crate::interface::Interface,
    std::collections::HashMap,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainResolutionMode {
    Catchup,
    Backward,
    Binary,
    Fork,
    NoFork,
}

const FAST_FORWARD_THRESHOLD: u32 = 144;
const MAX_CONCURRENT_CHUNK_FETCHES: u32 = 10;
const BACKWARD_WARM_WINDOW: u32 = 10;
const BINARY_WARM_LIMIT: u32 = 2016;

/// Per-tip-processing header memoization; cleared at the start and end of
/// every tip-processing call.
#[derive(Default)]
pub(crate) struct HeaderCache {
    entries: HashMap<u32, HeaderRecord>,
}

impl HeaderCache {
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn insert(&mut self, header: HeaderRecord) {
        self.entries.insert(header.height, header);
    }

    pub fn get(&self, height: u32) -> Option<HeaderRecord> {
        self.entries.get(&height).copied()
    }

    fn has_all(&self, from: u32, to: u32) -> bool {
        (from..=to).all(|h| self.entries.contains_key(&h))
    }
}

impl Interface {
    /// Handles one tip notification. Returns `true` if local state changed.
    pub(crate) async fn process_header_at_tip(&self, tip_header: HeaderRecord) -> Result<bool> {
        let _bhi_guard = self.supervisor.bhi_lock().lock_owned().await;

        self.header_cache.lock().await.clear();
        self.header_cache.lock().await.insert(tip_header);

        let tip = tip_header.height;
        let local_height = self.store.height(self.current_chain().await).await;

        if local_height >= tip {
            if self.store.check_header(&tip_header).await.is_some() {
                self.header_cache.lock().await.clear();
                return Ok(false);
            }
            // Another interface amended the blockchain at or below our tip:
            // resolve it the same way a single `step` at the reported tip
            // would, backward/binary searching down to the connect point.
            self.sync_until(tip, tip).await?;
        } else {
            self.sync_until(local_height, tip).await?;
        }

        self.header_cache.lock().await.clear();
        Ok(true)
    }

    async fn current_chain(&self) -> ChainId {
        let mut guard = self.chain.lock().await;
        if let Some(chain) = *guard {
            return chain;
        }
        let chain = self.store.get_best_chain().await;
        *guard = Some(chain);
        chain
    }

    async fn adopt_chain(&self, chain: ChainId) {
        *self.chain.lock().await = Some(chain);
    }

    /// Warms the cache for `[from, to]` in `mode` if not already fully
    /// populated; asserts the requested span is shorter than one chunk.
    async fn maybe_warm_headers_cache(&self, from: u32, to: u32, mode: ChainResolutionMode) -> Result<()> {
        assert!(to.saturating_sub(from) < 2016, "warm window must stay under one chunk");

        if self.header_cache.lock().await.has_all(from, to) {
            return Ok(());
        }

        let count = to - from + 1;
        let headers = self.get_block_headers(from, count, None, Some(mode)).await?;
        let mut cache = self.header_cache.lock().await;
        for header in headers {
            cache.insert(header);
        }
        Ok(())
    }

    /// Drives local state from `height` forward to `next_height`, fetching
    /// and connecting headers as needed. Always performs at least one step,
    /// even if `height > next_height` on entry — a single `step` at `height`
    /// is how a fork at or below the known tip gets resolved.
    async fn sync_until(&self, mut height: u32, next_height: u32) -> Result<()> {
        let mut stepped = false;
        loop {
            if stepped && height > next_height {
                return Ok(());
            }
            stepped = true;

            let before = height;

            if next_height > height + 144 {
                let connected = self.fast_forward_chain(height, next_height).await?;
                if connected == 0 {
                    let max_checkpoint = self.config.max_checkpoint();
                    if height <= max_checkpoint {
                        return Err(PeerError::graceful(
                            "server chain conflicts with checkpoints or genesis",
                        ));
                    }
                    let (_mode, next) = self.step(height).await?;
                    height = next;
                } else {
                    height += connected;
                }
            } else {
                let (_mode, next) = self.step(height).await?;
                height = next;
            }

            assert!(height != before, "sync_until made no progress");
        }
    }

    /// Fetches chunk-aligned header batches concurrently starting at
    /// `height`'s containing chunk, connecting them in order. Returns the
    /// number of headers connected strictly beyond `height`.
    async fn fast_forward_chain(&self, height: u32, next_height: u32) -> Result<u32> {
        let start_index = height / CHUNK_SIZE;
        let mut indices = Vec::new();
        let mut index = start_index;
        while index * CHUNK_SIZE <= next_height && indices.len() < MAX_CONCURRENT_CHUNK_FETCHES as usize {
            indices.push(index);
            index += 1;
        }

        let mut fetches = Vec::new();
        for &index in &indices {
            fetches.push(self.request_chunk_bytes(index));
        }
        let chunks = futures::future::join_all(fetches).await;

        let mut connected_total: u32 = 0;
        for (index, chunk) in indices.into_iter().zip(chunks) {
            let Ok(bytes) = chunk else {
                break;
            };
            let ok = self.store.connect_chunk(index, &bytes).await?;
            if !ok {
                break;
            }
            connected_total += CHUNK_SIZE;
        }

        let offset = height - start_index * CHUNK_SIZE;
        Ok(connected_total.saturating_sub(offset))
    }

    async fn request_chunk_bytes(&self, index: u32) -> Result<Vec<u8>> {
        let start = index * CHUNK_SIZE;
        let headers = self
            .get_block_headers(start, CHUNK_SIZE, None, Some(ChainResolutionMode::Catchup))
            .await?;
        let mut bytes = Vec::with_capacity(CHUNK_SIZE as usize * HEADER_SIZE);
        for header in headers {
            bytes.extend_from_slice(&header.to_bytes());
        }
        Ok(bytes)
    }

    /// Single-header resolution step: adopt the header if it checks or
    /// connects, otherwise bracket the bad region and resolve via binary
    /// search and fork resolution.
    async fn step(&self, height: u32) -> Result<(ChainResolutionMode, u32)> {
        let warm_to = {
            let tip = self.header_cache.lock().await.entries.keys().copied().max().unwrap_or(height);
            tip.min(height + 2015)
        };
        self.maybe_warm_headers_cache(height, warm_to, ChainResolutionMode::Catchup).await?;

        let header = self.fetch_header_cached(height, ChainResolutionMode::Catchup).await?;

        if let Some(chain) = self.store.check_header(&header).await {
            self.adopt_chain(chain).await;
            return Ok((ChainResolutionMode::Catchup, height + 1));
        }

        if let Some(chain) = self.store.can_connect(&header, true).await {
            self.adopt_chain(chain).await;
            self.store.save_header(chain, &header).await?;
            return Ok((ChainResolutionMode::Catchup, height + 1));
        }

        let (good, bad, bad_header) = self.search_headers_backwards(height, header).await?;
        let (good, bad, bad_header) = self.search_headers_binary(good, bad, bad_header).await?;
        self.resolve_potential_chain_fork_given_forkpoint(good, bad, bad_header).await
    }

    /// Exponentially searches backwards from `height` for the nearest
    /// ancestor that still checks against, or can connect to, a known chain.
    /// Always returns a bracketed `(good, bad, bad_header)` pair.
    async fn search_headers_backwards(
        &self,
        height: u32,
        mut header: HeaderRecord,
    ) -> Result<(u32, u32, HeaderRecord)> {
        let max_known = self.store.max_known_height().await;
        let mut probe_height = (max_known + 1).min(height.saturating_sub(1));
        let mut bad = height;
        let mut bad_header = header;
        let mut delta: u32 = 2;

        loop {
            let warm_from = probe_height.saturating_sub(BACKWARD_WARM_WINDOW);
            self.maybe_warm_headers_cache(warm_from, probe_height, ChainResolutionMode::Backward)
                .await?;

            header = self
                .fetch_header_cached(probe_height, ChainResolutionMode::Backward)
                .await?;

            if self.store.check_header(&header).await.is_some()
                || self.store.can_connect(&header, false).await.is_some()
            {
                return Ok((probe_height, bad, bad_header));
            }

            bad = probe_height;
            bad_header = header;

            let max_checkpoint = self.config.max_checkpoint();
            if probe_height == max_checkpoint {
                return Err(PeerError::graceful("server chain conflicts with checkpoints"));
            }

            probe_height = probe_height.saturating_sub(delta).max(max_checkpoint);
            delta = delta.saturating_mul(2);
        }
    }

    /// Binary-searches `(good, bad)` down to adjacency. Precondition:
    /// `bad_header` does not check against any known chain.
    async fn search_headers_binary(
        &self,
        mut good: u32,
        mut bad: u32,
        mut bad_header: HeaderRecord,
    ) -> Result<(u32, u32, HeaderRecord)> {
        while good + 1 != bad {
            if bad - good + 1 <= BINARY_WARM_LIMIT {
                self.maybe_warm_headers_cache(good, bad, ChainResolutionMode::Binary).await?;
            }

            let mid = (good + bad) / 2;
            let header = self.fetch_header_cached(mid, ChainResolutionMode::Binary).await?;

            if let Some(chain) = self.store.check_header(&header).await {
                self.adopt_chain(chain).await;
                good = mid;
            } else {
                bad = mid;
                bad_header = header;
            }
        }

        Ok((good, bad, bad_header))
    }

    /// With `good + 1 == bad`, decides whether the bracketed header
    /// represents a genuine fork or was simply not yet connected.
    async fn resolve_potential_chain_fork_given_forkpoint(
        &self,
        good: u32,
        bad: u32,
        bad_header: HeaderRecord,
    ) -> Result<(ChainResolutionMode, u32)> {
        let chain = self.current_chain().await;
        if self.store.height(chain).await == good {
            return Ok((ChainResolutionMode::NoFork, good + 1));
        }

        let new_chain = self.store.fork(&bad_header).await?;
        assert_eq!(self.store.forkpoint(new_chain).await, bad, "fork forkpoint must equal bad");
        self.adopt_chain(new_chain).await;
        Ok((ChainResolutionMode::Fork, bad + 1))
    }

    async fn fetch_header_cached(&self, height: u32, mode: ChainResolutionMode) -> Result<HeaderRecord> {
        if let Some(header) = self.header_cache.lock().await.get(height) {
            return Ok(header);
        }
        let header = self.get_block_header(height, mode).await?;
        self.header_cache.lock().await.insert(header);
        Ok(header)
    }

    /// Runs after every successful tip-processing call: clears the header
    /// cache, logs, emits events and asks the supervisor to rebalance.
    pub(crate) async fn after_tip_processing(&self, chain_changed: bool) {
        self.header_cache.lock().await.clear();

        let is_main = self.supervisor.is_main_server(&self.server).await;
        if is_main || chain_changed {
            tracing::info!(server = %self.server, "new tip accepted");
        }

        if chain_changed {
            self.events.blockchain_updated().await;
        }
        self.events.network_updated().await;

        self.supervisor.switch_unwanted_fork_interface().await;
        self.supervisor.switch_lagging_interface().await;

        self.spawn_noise_ping();
    }
}
