//! Per-server connection actor: owns the transport, the notification
//! session, the chain-resolution state and the readiness signal for one
//! remote server.
//!
//! Grounded on the teacher's `Client`/`ClientActor` split
//! (`src/stratum/client.rs`, `src/stratum/client/actor.rs`): a constructor
//! spawns a root task onto the runtime immediately and hands back a handle;
//! the root task owns a `JoinSet` of child tasks and tears everything down
//! on exit.

pub mod requests;
pub mod tasks;

use {
    super::*,
    certs::{CertPolicy, ConnectProbe},
    resolver::HeaderCache,
    session::NotificationSession,
    std::{
        net::IpAddr,
        sync::atomic::{AtomicBool, AtomicU32, Ordering},
    },
    tokio::{
        net::TcpStream,
        sync::{oneshot, Mutex, OnceCell},
        task::JoinSet,
    },
    tokio_rustls::{client::TlsStream, TlsConnector},
    tokio_util::sync::CancellationToken,
};

trait AnyStream: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send {}
impl<T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send> AnyStream for T {}

/// RPC error codes that terminate a child task gracefully rather than
/// propagating as an unexpected failure (spec's "disconnect-triggering"
/// codes for `open_session`'s child tasks).
fn is_disconnect_triggering(code: i32) -> bool {
    error::is_downgradable_rpc_code(code)
}

fn server_name(server: &ServerAddr) -> Result<rustls::pki_types::ServerName<'static>> {
    rustls::pki_types::ServerName::try_from(server.host().to_string())
        .map_err(|_| PeerError::Connect {
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "invalid server name"),
        })
}

async fn tcp_connect(server: &ServerAddr, proxy: Option<&ProxyConfig>) -> Result<TcpStream> {
    match proxy {
        Some(proxy) => socks5_connect(proxy, server).await,
        None => TcpStream::connect((server.host(), server.port()))
            .await
            .context(error::ConnectSnafu),
    }
}

/// Minimal no-auth SOCKS5 CONNECT handshake (RFC 1928); there is no SOCKS
/// client in the example corpus, so this is hand-rolled the same way
/// `server_addr`'s tri-tuple parsing is.
async fn socks5_connect(proxy: &ProxyConfig, target: &ServerAddr) -> Result<TcpStream> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut stream = TcpStream::connect((proxy.host.as_str(), proxy.port))
        .await
        .context(error::ConnectSnafu)?;

    stream.write_all(&[0x05, 0x01, 0x00]).await.context(error::ConnectSnafu)?;
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await.context(error::ConnectSnafu)?;
    if reply != [0x05, 0x00] {
        return Err(PeerError::Connect {
            source: std::io::Error::new(std::io::ErrorKind::Other, "socks5 proxy rejected no-auth"),
        });
    }

    let host = target.host();
    let mut request = vec![0x05, 0x01, 0x00, 0x03, host.len() as u8];
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&target.port().to_be_bytes());
    stream.write_all(&request).await.context(error::ConnectSnafu)?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await.context(error::ConnectSnafu)?;
    if header[1] != 0x00 {
        return Err(PeerError::Connect {
            source: std::io::Error::new(std::io::ErrorKind::Other, "socks5 connect failed"),
        });
    }
    let addr_len = match header[3] {
        0x01 => 4,
        0x04 => 16,
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await.context(error::ConnectSnafu)?;
            len[0] as usize
        }
        _ => {
            return Err(PeerError::Connect {
                source: std::io::Error::new(std::io::ErrorKind::Other, "unknown socks5 address type"),
            });
        }
    };
    let mut discard = vec![0u8; addr_len + 2];
    stream.read_exact(&mut discard).await.context(error::ConnectSnafu)?;

    Ok(stream)
}

async fn connect_tls(
    tcp: TcpStream,
    name: rustls::pki_types::ServerName<'static>,
    config: Arc<rustls::ClientConfig>,
) -> Result<TlsStream<TcpStream>> {
    TlsConnector::from(config)
        .connect(name, tcp)
        .await
        .map_err(|io_err| match io_err.get_ref().and_then(|e| e.downcast_ref::<rustls::Error>()) {
            Some(tls_err) => PeerError::TlsVerify { source: tls_err.clone() },
            None => PeerError::Connect { source: io_err },
        })
}

struct TcpProbe<'a> {
    server: &'a ServerAddr,
    proxy: Option<&'a ProxyConfig>,
}

#[async_trait]
impl ConnectProbe for TcpProbe<'_> {
    async fn probe(&self, config: Arc<rustls::ClientConfig>) -> Result<()> {
        let tcp = tcp_connect(self.server, self.proxy).await?;
        connect_tls(tcp, server_name(self.server)?, config).await?;
        Ok(())
    }

    async fn fetch_peer_der(&self, config: Arc<rustls::ClientConfig>) -> Result<Vec<u8>> {
        let tcp = tcp_connect(self.server, self.proxy).await?;
        let tls = connect_tls(tcp, server_name(self.server)?, config).await?;
        let (_, conn) = tls.get_ref();
        let certs = conn
            .peer_certificates()
            .ok_or_else(|| PeerError::GettingSslCertFromServer {
                reason: "server presented no certificate".into(),
            })?;
        let der = certs
            .first()
            .ok_or_else(|| PeerError::GettingSslCertFromServer {
                reason: "empty certificate chain".into(),
            })?;
        Ok(der.to_vec())
    }
}

/// Tracks the one-shot readiness transition described in spec.md §4.8.
/// `tokio::sync::oneshot` gives `send` the fire-and-forget, fails-silently-
/// if-already-resolved semantics the idempotency requirement needs; a
/// separate `done`/`cancelled` pair lets `is_connected_and_ready` poll
/// repeatedly without consuming the channel.
struct Ready {
    tx: Mutex<Option<oneshot::Sender<()>>>,
    done: AtomicBool,
    cancelled: AtomicBool,
}

impl Ready {
    fn new() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Mutex::new(Some(tx)),
                done: AtomicBool::new(false),
                cancelled: AtomicBool::new(false),
            },
            rx,
        )
    }

    async fn mark(&self) -> Result<()> {
        if self.cancelled.load(Ordering::Acquire) {
            return Err(PeerError::graceful("conn establishment was too slow"));
        }
        if self.done.load(Ordering::Acquire) {
            return Ok(());
        }
        if let Some(tx) = self.tx.lock().await.take() {
            let _ = tx.send(());
            self.done.store(true, Ordering::Release);
        }
        Ok(())
    }

    async fn cancel(&self) {
        if !self.done.load(Ordering::Acquire) {
            self.cancelled.store(true, Ordering::Release);
            self.tx.lock().await.take();
        }
    }

    fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

/// Per-server connection actor. Constructed via [`Interface::spawn`], which
/// starts the root task immediately and returns a handle to it.
pub struct Interface {
    pub(crate) server: ServerAddr,
    pub(crate) config: Arc<dyn ConfigProvider>,
    pub(crate) store: Arc<dyn BlockchainStore>,
    pub(crate) supervisor: Arc<dyn NetworkSupervisor>,
    pub(crate) events: Arc<dyn EventBus>,
    pub(crate) cancel: CancellationToken,
    pub(crate) disconnected: AtomicBool,
    ready: Ready,
    pub(crate) session: OnceCell<NotificationSession>,
    pub(crate) chain: Mutex<Option<ChainId>>,
    pub(crate) tip: AtomicU32,
    pub(crate) header_cache: Mutex<HeaderCache>,
    pub(crate) requested_chunks: Mutex<std::collections::HashSet<u32>>,
    pub(crate) fee_estimates_eta: Mutex<std::collections::HashMap<u32, f64>>,
    ip_bucket: OnceCell<String>,
    join_set: Mutex<JoinSet<()>>,
}

impl Interface {
    /// Constructs an interface and immediately spawns its root task, bound
    /// to a child of `parent_cancel`. Returns the handle and a receiver that
    /// resolves (or is dropped, i.e. cancelled) on first verified tip.
    pub fn spawn(
        server: ServerAddr,
        config: Arc<dyn ConfigProvider>,
        store: Arc<dyn BlockchainStore>,
        supervisor: Arc<dyn NetworkSupervisor>,
        events: Arc<dyn EventBus>,
        parent_cancel: &CancellationToken,
    ) -> (Arc<Interface>, oneshot::Receiver<()>) {
        let (ready, ready_rx) = Ready::new();

        let interface = Arc::new(Interface {
            server,
            config,
            store,
            supervisor,
            events,
            cancel: parent_cancel.child_token(),
            disconnected: AtomicBool::new(false),
            ready,
            session: OnceCell::new(),
            chain: Mutex::new(None),
            tip: AtomicU32::new(0),
            header_cache: Mutex::new(HeaderCache::default()),
            requested_chunks: Mutex::new(std::collections::HashSet::new()),
            fee_estimates_eta: Mutex::new(std::collections::HashMap::new()),
            ip_bucket: OnceCell::new(),
            join_set: Mutex::new(JoinSet::new()),
        });

        tokio::spawn(interface.clone().run_root_task());

        (interface, ready_rx)
    }

    pub fn server(&self) -> &ServerAddr {
        &self.server
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    pub fn is_connected_and_ready(&self) -> bool {
        self.ready.is_done() && !self.is_disconnected()
    }

    /// The try/finally-equivalent wrapper around the root flow: logs and
    /// classifies the terminating error, then always tears the interface
    /// down the same way regardless of why it ended.
    async fn run_root_task(self: Arc<Self>) {
        let outcome = self.clone().root_flow().await;

        if let Err(ref err) = outcome {
            let is_main = self.supervisor.is_main_server(&self.server).await;
            let level = if is_main { tracing::Level::WARN } else { err.log_level() };
            match level {
                tracing::Level::ERROR => tracing::error!(server = %self.server, %err, "interface terminated"),
                tracing::Level::WARN => tracing::warn!(server = %self.server, %err, "interface terminated"),
                _ => tracing::info!(server = %self.server, %err, "interface terminated"),
            }
        }

        self.disconnected.store(true, Ordering::Release);
        self.cancel.cancel();
        self.supervisor.connection_down(&self.server).await;
        self.ready.cancel().await;

        let mut join_set = self.join_set.lock().await;
        while join_set.join_next().await.is_some() {}
    }

    async fn root_flow(self: Arc<Self>) -> Result<()> {
        let tls_config = match self.server.protocol() {
            Protocol::Tls => {
                let proxy = self.config.proxy();
                let probe = TcpProbe {
                    server: &self.server,
                    proxy: proxy.as_ref(),
                };
                let fingerprint = self.config.expected_fingerprint(&self.server);
                let policy = CertPolicy::resolve(
                    &self.server,
                    self.config.cert_dir(),
                    fingerprint.as_deref(),
                    &probe,
                    self.events.as_ref(),
                )
                .await?;
                Some(policy.client_config)
            }
            Protocol::Plaintext => None,
        };

        self.open_session(tls_config).await
    }

    async fn open_session(self: Arc<Self>, tls_config: Option<Arc<rustls::ClientConfig>>) -> Result<()> {
        let proxy = self.config.proxy();
        let tcp = tcp_connect(&self.server, proxy.as_ref()).await?;

        let max_frame_len = self.config.max_incoming_frame_size();

        let mut join_set = JoinSet::new();
        let session = match tls_config {
            Some(cfg) => {
                let tls = connect_tls(tcp, server_name(&self.server)?, cfg).await?;
                let transport = framing::spawn_transport(tls, max_frame_len, false, &mut join_set);
                NotificationSession::new(transport, NetworkTimeout::GENERIC_NORMAL.duration(), &mut join_set)
            }
            None => {
                let transport = framing::spawn_transport(tcp, max_frame_len, false, &mut join_set);
                NotificationSession::new(transport, NetworkTimeout::GENERIC_NORMAL.duration(), &mut join_set)
            }
        };

        let version_result = session
            .send_request(
                "server.version",
                serde_json::json!([self.config.client_name(), self.config.protocol_version()]),
                Some(NetworkTimeout::GENERIC_NORMAL.duration()),
            )
            .await?;

        let echoed = version_result
            .get(1)
            .and_then(Value::as_str)
            .ok_or_else(|| PeerError::corrupted("server.version response missing protocol echo"))?;
        if echoed != self.config.protocol_version() {
            return Err(PeerError::graceful(format!(
                "protocol mismatch: expected {}, got {echoed}",
                self.config.protocol_version()
            )));
        }

        let bucket = self.ip_bucket().await;
        if !self.supervisor.admits_ip_bucket(&bucket).await {
            return Err(PeerError::graceful("ip bucket diversity policy rejected this server"));
        }

        self.session
            .set(session)
            .unwrap_or_else(|_| panic!("open_session called more than once"));

        *self.join_set.lock().await = join_set;

        self.run_child_tasks().await
    }

    pub(crate) async fn session(&self) -> Result<&NotificationSession> {
        self.session.get().ok_or_else(|| PeerError::graceful("session not yet established"))
    }

    /// Computes (and caches) the IP-bucket diversity key for this server:
    /// `"onion"` for Tor, empty for loopback, `/16`/`/48` CIDR strings for
    /// public IPv4/IPv6, empty otherwise.
    async fn ip_bucket(&self) -> String {
        if let Some(cached) = self.ip_bucket.get() {
            return cached.clone();
        }

        let bucket = Self::bucket_based_on_ipaddress(self.server.host());
        let _ = self.ip_bucket.set(bucket.clone());
        bucket
    }

    fn bucket_based_on_ipaddress(host: &str) -> String {
        if host.ends_with(".onion") {
            return "onion".to_string();
        }

        let Ok(addr) = host.parse::<IpAddr>() else {
            return String::new();
        };

        if addr.is_loopback() {
            return String::new();
        }

        match addr {
            IpAddr::V4(v4) => {
                let octets = v4.octets();
                format!("{}.{}.0.0/16", octets[0], octets[1])
            }
            IpAddr::V6(v6) => {
                let segments = v6.segments();
                format!(
                    "{:x}:{:x}:{:x}::/48",
                    segments[0], segments[1], segments[2]
                )
            }
        }
    }
}
