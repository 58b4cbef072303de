use super::*;

#[derive(Debug, Parser)]
pub(crate) struct Connect {
    #[arg(long, help = "Exit as soon as every configured server becomes ready, instead of running forever.")]
    once: bool,
}

impl Connect {
    pub(crate) async fn run(self, settings: Settings, cancel: CancellationToken) -> Result {
        let servers = settings.servers.clone();
        let primary = servers.first().cloned().ok_or_else(|| anyhow!("no servers configured"))?;

        let config: Arc<dyn ConfigProvider> = Arc::new(CliConfigProvider::new(settings));
        let store: Arc<dyn BlockchainStore> = Arc::new(chainstore::InMemoryStore::new());
        let supervisor: Arc<dyn NetworkSupervisor> = Arc::new(CliSupervisor::new(primary));
        let events: Arc<dyn EventBus> = Arc::new(TracingEventBus);

        let mut interfaces = Vec::with_capacity(servers.len());
        let mut readies = Vec::with_capacity(servers.len());

        for server in &servers {
            let (interface, ready_rx) = Interface::spawn(
                server.clone(),
                config.clone(),
                store.clone(),
                supervisor.clone(),
                events.clone(),
                &cancel,
            );
            interfaces.push(interface);
            readies.push(ready_rx);
        }

        for (server, ready_rx) in servers.iter().zip(readies) {
            match ready_rx.await {
                Ok(()) => info!(%server, "interface ready"),
                Err(_) => warn!(%server, "interface disconnected before becoming ready"),
            }
        }

        if self.once {
            cancel.cancel();
        } else {
            cancel.cancelled().await;
        }

        drop(interfaces);
        Ok(())
    }
}
