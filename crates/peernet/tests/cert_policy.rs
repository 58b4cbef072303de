//! Black-box exercise of `CertPolicy::resolve`'s first-contact decision
//! procedure against a fake `ConnectProbe`, covering the CA-signed,
//! self-signed trust-on-first-use, and fingerprint-pinning scenarios without
//! a real TLS listener.

use {
    async_trait::async_trait,
    peernet::{certs::CertPolicy, collab::EventBus, server_addr::ServerAddr, PeerError},
    rustls::ClientConfig,
    std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

struct NullEventBus {
    mismatches: AtomicUsize,
}

impl NullEventBus {
    fn new() -> Self {
        Self { mismatches: AtomicUsize::new(0) }
    }
}

#[async_trait]
impl EventBus for NullEventBus {
    async fn blockchain_updated(&self) {}
    async fn network_updated(&self) {}
    async fn cert_mismatch(&self, _server: &ServerAddr) {
        self.mismatches.fetch_add(1, Ordering::SeqCst);
    }
}

enum ProbeBehavior {
    CaSigned,
    SelfSigned(Vec<u8>),
}

struct FakeProbe {
    behavior: ProbeBehavior,
    probe_calls: AtomicUsize,
}

impl FakeProbe {
    fn ca_signed() -> Self {
        Self { behavior: ProbeBehavior::CaSigned, probe_calls: AtomicUsize::new(0) }
    }

    fn self_signed(der: Vec<u8>) -> Self {
        Self { behavior: ProbeBehavior::SelfSigned(der), probe_calls: AtomicUsize::new(0) }
    }
}

#[async_trait]
impl peernet::certs::ConnectProbe for FakeProbe {
    async fn probe(&self, _config: Arc<ClientConfig>) -> peernet::Result<()> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            ProbeBehavior::CaSigned => Ok(()),
            ProbeBehavior::SelfSigned(_) => Err(PeerError::TlsVerify {
                source: rustls::Error::InvalidCertificate(rustls::CertificateError::SelfSigned),
            }),
        }
    }

    async fn fetch_peer_der(&self, _config: Arc<ClientConfig>) -> peernet::Result<Vec<u8>> {
        match &self.behavior {
            ProbeBehavior::CaSigned => panic!("fetch_peer_der should not be called for a CA-signed server"),
            ProbeBehavior::SelfSigned(der) => Ok(der.clone()),
        }
    }
}

fn self_signed_der() -> Vec<u8> {
    let certified = rcgen::generate_simple_self_signed(vec!["peernet-test.invalid".to_string()])
        .expect("generating a self-signed test certificate cannot fail");
    certified.cert.der().to_vec()
}

#[tokio::test]
async fn ca_signed_first_contact_caches_as_unconditionally_trusted() {
    let dir = tempfile::tempdir().unwrap();
    let server = ServerAddr::from_str("electrum.example.com:50002:s").unwrap();
    let probe = FakeProbe::ca_signed();
    let events = NullEventBus::new();

    let policy = CertPolicy::resolve(&server, dir.path(), None, &probe, &events).await;
    assert!(policy.is_ok());
    assert_eq!(probe.probe_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn repeated_resolve_reuses_ca_signed_cache_without_reprobing() {
    let dir = tempfile::tempdir().unwrap();
    let server = ServerAddr::from_str("electrum.example.com:50002:s").unwrap();
    let probe = FakeProbe::ca_signed();
    let events = NullEventBus::new();

    CertPolicy::resolve(&server, dir.path(), None, &probe, &events).await.unwrap();
    CertPolicy::resolve(&server, dir.path(), None, &probe, &events).await.unwrap();

    assert_eq!(probe.probe_calls.load(Ordering::SeqCst), 1, "second resolve must hit the on-disk cache");
}

#[tokio::test]
async fn self_signed_first_contact_pins_and_persists() {
    let dir = tempfile::tempdir().unwrap();
    let server = ServerAddr::from_str("10.0.0.1:50002:s").unwrap();
    let der = self_signed_der();
    let probe = FakeProbe::self_signed(der.clone());
    let events = NullEventBus::new();

    let policy = CertPolicy::resolve(&server, dir.path(), None, &probe, &events).await;
    assert!(policy.is_ok());

    let cache_path = dir.path().join(server.cert_cache_key());
    assert!(cache_path.exists(), "pinned certificate must be written to disk");

    // A second resolve must reuse the pinned certificate rather than probing
    // again (and without needing the self-signed handshake error again).
    let second = CertPolicy::resolve(&server, dir.path(), None, &probe, &events).await;
    assert!(second.is_ok());
    assert_eq!(probe.probe_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn self_signed_fingerprint_mismatch_is_rejected_and_emits_event() {
    let dir = tempfile::tempdir().unwrap();
    let server = ServerAddr::from_str("10.0.0.2:50002:s").unwrap();
    let der = self_signed_der();
    let probe = FakeProbe::self_signed(der);
    let events = NullEventBus::new();

    let wrong_fingerprint = "f".repeat(64);
    let result = CertPolicy::resolve(&server, dir.path(), Some(&wrong_fingerprint), &probe, &events).await;

    assert!(matches!(result, Err(PeerError::SslCertFingerprintMismatch)));
    assert_eq!(events.mismatches.load(Ordering::SeqCst), 1);

    let cache_path = dir.path().join(server.cert_cache_key());
    assert!(!cache_path.exists(), "a rejected certificate must not be cached");
}

#[tokio::test]
async fn ca_signed_with_fingerprint_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let server = ServerAddr::from_str("electrum.example.com:50002:s").unwrap();
    let probe = FakeProbe::ca_signed();
    let events = NullEventBus::new();

    let expected = "a".repeat(64);
    let result = CertPolicy::resolve(&server, dir.path(), Some(&expected), &probe, &events).await;

    assert!(matches!(result, Err(PeerError::InvalidOptionCombination { .. })));
}
