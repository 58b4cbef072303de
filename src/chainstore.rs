//! Minimal in-memory [`BlockchainStore`]: enough chain bookkeeping to drive
//! and exercise the resolver without depending on a real header database.
//! Continuity (prev-hash linkage) is checked; proof-of-work is not — a real
//! deployment would back this trait with a store that also verifies work
//! and retargeting the way a full node does.

use {super::*, async_trait::async_trait};

struct ChainData {
    parent: Option<ChainId>,
    forkpoint: u32,
    tip: u32,
    headers: BTreeMap<u32, HeaderRecord>,
}

pub(crate) struct InMemoryStore {
    chains: Mutex<HashMap<ChainId, ChainData>>,
    next_id: AtomicU64,
}

impl InMemoryStore {
    pub(crate) fn new() -> Self {
        let mut headers = BTreeMap::new();
        headers.insert(0, HeaderRecord { height: 0, header: genesis::header() });

        let mut chains = HashMap::new();
        chains.insert(
            0,
            ChainData {
                parent: None,
                forkpoint: 0,
                tip: 0,
                headers,
            },
        );

        Self {
            chains: Mutex::new(chains),
            next_id: AtomicU64::new(1),
        }
    }

    fn header_in(chains: &HashMap<ChainId, ChainData>, chain: ChainId, height: u32) -> Option<HeaderRecord> {
        let data = chains.get(&chain)?;
        if let Some(parent) = data.parent
            && height <= data.forkpoint
        {
            return Self::header_in(chains, parent, height);
        }
        data.headers.get(&height).copied()
    }

    fn tip_hash(chains: &HashMap<ChainId, ChainData>, chain: ChainId) -> Option<bitcoin::BlockHash> {
        let data = chains.get(&chain)?;
        Self::header_in(chains, chain, data.tip).map(|record| record.header.block_hash())
    }
}

#[async_trait]
impl BlockchainStore for InMemoryStore {
    async fn check_header(&self, header: &HeaderRecord) -> Option<ChainId> {
        let chains = self.chains.lock().await;
        chains
            .keys()
            .find(|&&chain| {
                Self::header_in(&chains, chain, header.height).map(|existing| existing.header) == Some(header.header)
            })
            .copied()
    }

    async fn can_connect(&self, header: &HeaderRecord, check_height: bool) -> Option<ChainId> {
        let chains = self.chains.lock().await;
        chains
            .iter()
            .find(|(&chain, data)| {
                let connects = Self::tip_hash(&chains, chain) == Some(header.header.prev_blockhash);
                connects && (!check_height || header.height == data.tip + 1)
            })
            .map(|(&chain, _)| chain)
    }

    async fn connect_chunk(&self, index: u32, bytes: &[u8]) -> PeerResult<bool> {
        let start = index * CHUNK_SIZE;
        let mut records = Vec::with_capacity(CHUNK_SIZE as usize);
        for (offset, chunk) in bytes.chunks(HEADER_SIZE).enumerate() {
            let array: HeaderBytes = chunk
                .try_into()
                .map_err(|_| PeerError::corrupted("chunk bytes not a multiple of header size"))?;
            records.push(HeaderRecord::from_bytes(start + offset as u32, &array)?);
        }

        let mut chains = self.chains.lock().await;
        let Some(first) = records.first() else {
            return Ok(false);
        };
        let Some(&chain) = chains
            .iter()
            .find(|(_, data)| data.tip + 1 == first.height)
            .map(|(chain, _)| chain)
        else {
            return Ok(false);
        };

        let mut prev_hash = Self::tip_hash(&chains, chain);
        for record in &records {
            if prev_hash.is_some_and(|expected| expected != record.header.prev_blockhash) {
                return Ok(false);
            }
            prev_hash = Some(record.header.block_hash());
        }

        let data = chains.get_mut(&chain).expect("chain looked up above");
        for record in records {
            data.headers.insert(record.height, record);
            data.tip = data.tip.max(record.height);
        }
        Ok(true)
    }

    async fn fork(&self, header: &HeaderRecord) -> PeerResult<ChainId> {
        let mut chains = self.chains.lock().await;
        let parent = chains
            .iter()
            .find(|(_, data)| data.tip >= header.height.saturating_sub(1))
            .map(|(&chain, _)| chain)
            .ok_or_else(|| PeerError::graceful("no known chain to fork from"))?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut headers = BTreeMap::new();
        headers.insert(header.height, *header);

        chains.insert(
            id,
            ChainData {
                parent: Some(parent),
                forkpoint: header.height.saturating_sub(1),
                tip: header.height,
                headers,
            },
        );

        Ok(id)
    }

    async fn forkpoint(&self, chain: ChainId) -> u32 {
        self.chains.lock().await.get(&chain).map(|data| data.forkpoint).unwrap_or_default()
    }

    async fn height(&self, chain: ChainId) -> u32 {
        self.chains.lock().await.get(&chain).map(|data| data.tip).unwrap_or_default()
    }

    async fn save_header(&self, chain: ChainId, header: &HeaderRecord) -> PeerResult<()> {
        let mut chains = self.chains.lock().await;
        let data = chains
            .get_mut(&chain)
            .ok_or_else(|| PeerError::graceful("save_header on unknown chain"))?;
        data.headers.insert(header.height, *header);
        data.tip = data.tip.max(header.height);
        Ok(())
    }

    async fn get_best_chain(&self) -> ChainId {
        let chains = self.chains.lock().await;
        chains
            .iter()
            .max_by_key(|(&chain, data)| (data.tip, std::cmp::Reverse(chain)))
            .map(|(&chain, _)| chain)
            .unwrap_or_default()
    }

    async fn max_known_height(&self) -> u32 {
        self.chains.lock().await.values().map(|data| data.tip).max().unwrap_or_default()
    }
}
