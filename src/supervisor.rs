//! [`NetworkSupervisor`] implementation for the `connect` subcommand: a
//! single designated "main" server and a permissive IP-bucket policy. A
//! multi-interface pool (bouncing between several servers, enforcing address
//! diversity) would extend this the way the teacher's own connection
//! bouncer extends a single-upstream baseline.

use {super::*, async_trait::async_trait};

pub(crate) struct CliSupervisor {
    bhi_lock: Arc<tokio::sync::Mutex<()>>,
    main_server: ServerAddr,
}

impl CliSupervisor {
    pub(crate) fn new(main_server: ServerAddr) -> Self {
        Self {
            bhi_lock: Arc::new(tokio::sync::Mutex::new(())),
            main_server,
        }
    }
}

#[async_trait]
impl NetworkSupervisor for CliSupervisor {
    fn bhi_lock(&self) -> Arc<tokio::sync::Mutex<()>> {
        self.bhi_lock.clone()
    }

    async fn is_main_server(&self, server: &ServerAddr) -> bool {
        server == &self.main_server
    }

    async fn admits_ip_bucket(&self, _bucket: &str) -> bool {
        true
    }

    async fn connection_down(&self, server: &ServerAddr) {
        debug!(%server, "connection down");
    }

    async fn switch_unwanted_fork_interface(&self) {}

    async fn switch_lagging_interface(&self) {}
}
