//! [`ConfigProvider`] implementation backed by resolved CLI [`Settings`].

use super::*;

pub(crate) struct CliConfigProvider {
    settings: Settings,
}

impl CliConfigProvider {
    pub(crate) fn new(settings: Settings) -> Self {
        Self { settings }
    }
}

impl ConfigProvider for CliConfigProvider {
    fn cert_dir(&self) -> &Path {
        &self.settings.cert_dir
    }

    fn max_incoming_frame_size(&self) -> usize {
        self.settings.max_frame_size
    }

    fn expected_fingerprint(&self, _server: &ServerAddr) -> Option<String> {
        None
    }

    fn proxy(&self) -> Option<ProxyConfig> {
        self.settings.proxy.clone()
    }

    fn max_checkpoint(&self) -> u32 {
        0
    }

    fn checkpoint_header(&self) -> HeaderRecord {
        HeaderRecord { height: 0, header: genesis::header() }
    }

    fn fee_eta_targets(&self) -> &[u32] {
        &[2, 5, 10, 25]
    }

    fn client_name(&self) -> &str {
        "peernet"
    }

    fn protocol_version(&self) -> &str {
        "1.4"
    }
}
