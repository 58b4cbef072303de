//! Drives a real `Interface` over a loopback TCP connection against a fake,
//! hand-rolled JSON-RPC peer: the plaintext-protocol analogue of connecting
//! to a server that is exactly one block ahead of the local tip. Covers the
//! handshake, the tip subscription, and a single-header catch-up step.

use {
    async_trait::async_trait,
    bitcoin::hashes::Hash,
    peernet::{
        collab::{BlockchainStore, ChainId, ConfigProvider, EventBus, NetworkSupervisor, ProxyConfig},
        server_addr::{Protocol, ServerAddr},
        HeaderRecord, Interface, PeerError, Result as PeerResult, CHUNK_SIZE,
    },
    serde_json::{json, Value},
    std::{
        collections::BTreeMap,
        path::Path,
        sync::{
            atomic::{AtomicU32, Ordering},
            Arc,
        },
        time::Duration,
    },
    tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
        net::TcpListener,
        sync::Mutex,
    },
    tokio_util::sync::CancellationToken,
};

fn header(prev: bitcoin::BlockHash, time: u32, nonce: u32) -> bitcoin::block::Header {
    bitcoin::block::Header {
        version: bitcoin::block::Version::ONE,
        prev_blockhash: prev,
        merkle_root: bitcoin::TxMerkleNode::all_zeros(),
        time,
        bits: bitcoin::CompactTarget::from_consensus(0x1d00ffff),
        nonce,
    }
}

struct FakeStore {
    headers: Mutex<BTreeMap<u32, HeaderRecord>>,
    tip: AtomicU32,
}

impl FakeStore {
    fn seeded_with(genesis: HeaderRecord) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert(genesis.height, genesis);
        Self { headers: Mutex::new(headers), tip: AtomicU32::new(genesis.height) }
    }

    async fn height_direct(&self) -> u32 {
        self.tip.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlockchainStore for FakeStore {
    async fn check_header(&self, header: &HeaderRecord) -> Option<ChainId> {
        let headers = self.headers.lock().await;
        (headers.get(&header.height) == Some(header)).then_some(0)
    }

    async fn can_connect(&self, header: &HeaderRecord, check_height: bool) -> Option<ChainId> {
        let headers = self.headers.lock().await;
        let tip = self.tip.load(Ordering::SeqCst);
        let tip_record = headers.get(&tip)?;
        let connects = tip_record.header.block_hash() == header.header.prev_blockhash;
        (connects && (!check_height || header.height == tip + 1)).then_some(0)
    }

    async fn connect_chunk(&self, _index: u32, _bytes: &[u8]) -> PeerResult<bool> {
        Ok(false)
    }

    async fn fork(&self, _header: &HeaderRecord) -> PeerResult<ChainId> {
        Err(PeerError::graceful("fork not exercised by this test"))
    }

    async fn forkpoint(&self, _chain: ChainId) -> u32 {
        0
    }

    async fn height(&self, _chain: ChainId) -> u32 {
        self.tip.load(Ordering::SeqCst)
    }

    async fn save_header(&self, _chain: ChainId, header: &HeaderRecord) -> PeerResult<()> {
        self.headers.lock().await.insert(header.height, *header);
        self.tip.fetch_max(header.height, Ordering::SeqCst);
        Ok(())
    }

    async fn get_best_chain(&self) -> ChainId {
        0
    }

    async fn max_known_height(&self) -> u32 {
        self.tip.load(Ordering::SeqCst)
    }
}

struct FakeConfig {
    genesis: HeaderRecord,
}

impl ConfigProvider for FakeConfig {
    fn cert_dir(&self) -> &Path {
        Path::new("/tmp")
    }

    fn max_incoming_frame_size(&self) -> usize {
        1_000_000
    }

    fn expected_fingerprint(&self, _server: &ServerAddr) -> Option<String> {
        None
    }

    fn proxy(&self) -> Option<ProxyConfig> {
        None
    }

    fn max_checkpoint(&self) -> u32 {
        0
    }

    fn checkpoint_header(&self) -> HeaderRecord {
        self.genesis
    }

    fn fee_eta_targets(&self) -> &[u32] {
        &[]
    }

    fn client_name(&self) -> &str {
        "peernet-test"
    }

    fn protocol_version(&self) -> &str {
        "1.4"
    }
}

struct FakeSupervisor {
    lock: Arc<tokio::sync::Mutex<()>>,
}

#[async_trait]
impl NetworkSupervisor for FakeSupervisor {
    fn bhi_lock(&self) -> Arc<tokio::sync::Mutex<()>> {
        self.lock.clone()
    }

    async fn is_main_server(&self, _server: &ServerAddr) -> bool {
        true
    }

    async fn admits_ip_bucket(&self, _bucket: &str) -> bool {
        true
    }

    async fn connection_down(&self, _server: &ServerAddr) {}

    async fn switch_unwanted_fork_interface(&self) {}

    async fn switch_lagging_interface(&self) {}
}

struct FakeEvents;

#[async_trait]
impl EventBus for FakeEvents {
    async fn blockchain_updated(&self) {}
    async fn network_updated(&self) {}
    async fn cert_mismatch(&self, _server: &ServerAddr) {}
}

/// Reads one newline-delimited JSON-RPC request and replies with `result`.
async fn serve_one(reader: &mut (impl AsyncBufReadExt + Unpin), writer: &mut (impl AsyncWriteExt + Unpin), result: Value) {
    let mut line = String::new();
    reader.read_line(&mut line).await.expect("peer closed before sending a request");
    let request: Value = serde_json::from_str(&line).expect("malformed request frame");
    let id = request["id"].clone();
    let response = json!({"id": id, "result": result, "error": null});
    let mut frame = serde_json::to_vec(&response).unwrap();
    frame.push(b'\n');
    writer.write_all(&frame).await.unwrap();
}

#[tokio::test]
async fn single_header_catchup_over_loopback() {
    let genesis_header = header(bitcoin::BlockHash::all_zeros(), 1_600_000_000, 0);
    let genesis = HeaderRecord { height: 0, header: genesis_header };
    let next_header = header(genesis_header.block_hash(), 1_600_000_600, 1);
    let next = HeaderRecord { height: 1, header: next_header };

    let genesis_hex = hex::encode(genesis.to_bytes());
    let next_hex = hex::encode(next.to_bytes());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server_task = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        serve_one(&mut reader, &mut write_half, json!(["peernet-test-server/1.0", "1.4"])).await;
        serve_one(&mut reader, &mut write_half, json!({"height": 1, "hex": next_hex})).await;
        serve_one(
            &mut reader,
            &mut write_half,
            json!({"count": 2, "max": CHUNK_SIZE, "hex": format!("{genesis_hex}{next_hex}")}),
        )
        .await;

        // Keep the connection open (further pings etc. are simply unanswered)
        // until the test is done with it.
        std::future::pending::<()>().await;
    });

    let store: Arc<FakeStore> = Arc::new(FakeStore::seeded_with(genesis));
    let config: Arc<dyn ConfigProvider> = Arc::new(FakeConfig { genesis });
    let supervisor: Arc<dyn NetworkSupervisor> =
        Arc::new(FakeSupervisor { lock: Arc::new(tokio::sync::Mutex::new(())) });
    let events: Arc<dyn EventBus> = Arc::new(FakeEvents);
    let server = ServerAddr::new("127.0.0.1", port, Some(Protocol::Plaintext)).unwrap();
    let cancel = CancellationToken::new();

    let (_interface, ready_rx) = Interface::spawn(
        server,
        config,
        store.clone() as Arc<dyn BlockchainStore>,
        supervisor,
        events,
        &cancel,
    );

    tokio::time::timeout(Duration::from_secs(5), ready_rx)
        .await
        .expect("interface did not become ready in time")
        .expect("readiness channel closed unexpectedly");

    let synced = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if store.height_direct().await == 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(synced.is_ok(), "interface never connected the second header");

    cancel.cancel();
    server_task.abort();
}
