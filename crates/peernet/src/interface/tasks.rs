//! Child tasks spawned once a session is open: keepalive/noise pings,
//! connection-health polling, fee estimation, and the tip-consumption loop
//! that drives the chain resolver.

use {
    super::Interface,
    crate::{error, *},
    rand::Rng,
    std::sync::Arc,
    tokio::{sync::mpsc, task::JoinSet},
};

impl Interface {
    /// Spawns `ping`, `request_fee_estimates`, `run_fetch_blocks` and
    /// `monitor_connection` into this interface's `JoinSet`, then waits for
    /// whichever finishes first. Any of them finishing (normally or with a
    /// disconnect-triggering RPC code) ends the session.
    pub(crate) async fn run_child_tasks(self: Arc<Self>) -> Result<()> {
        let mut handles = JoinSet::new();
        handles.spawn(self.clone().ping());
        handles.spawn(self.clone().request_fee_estimates());
        handles.spawn(self.clone().run_fetch_blocks());
        handles.spawn(self.clone().monitor_connection());

        let outcome = match handles.join_next().await {
            Some(Ok(result)) => result,
            Some(Err(join_err)) => Err(PeerError::graceful(format!("child task panicked: {join_err}"))),
            None => Ok(()),
        };

        handles.abort_all();
        outcome
    }

    /// Sleeps `uniform(0, 300)s`, pings, then with 20% probability sends an
    /// extra "noise" ping after a further `uniform(0, 1)s` — traffic-analysis
    /// mitigation, not a liveness check. Loops until cancelled.
    async fn ping(self: Arc<Self>) -> Result<()> {
        loop {
            let delay = {
                let mut rng = rand::rng();
                Duration::from_secs_f64(rng.random_range(0.0..300.0))
            };

            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }

            self.ping_once().await?;

            let noisy = rand::rng().random_bool(0.2);
            if noisy {
                let extra = Duration::from_secs_f64(rand::rng().random_range(0.0..1.0));
                tokio::select! {
                    _ = self.cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(extra) => {}
                }
                self.ping_once().await?;
            }
        }
    }

    async fn ping_once(&self) -> Result<()> {
        let result = self
            .session()
            .await?
            .send_request("server.ping", serde_json::json!([]), None)
            .await;
        self.downgrade_disconnect_triggering(result).map(|_| ())
    }

    /// Spawns a single extra ping, fire-and-forget, after a tip is resolved
    /// (spec's "noise ping" on chain-resolution completion).
    pub(crate) fn spawn_noise_ping(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            let _ = this.ping_once().await;
        });
    }

    /// Polls `session.is_closing()` every second; raises a graceful
    /// disconnect the moment the session reports it is going away.
    async fn monitor_connection(self: Arc<Self>) -> Result<()> {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    let closing = match self.session.get() {
                        Some(session) => session.is_closing(),
                        None => true,
                    };
                    if closing {
                        return Err(PeerError::graceful("session is closing"));
                    }
                }
            }
        }
    }

    /// Requests `blockchain.estimatefee` for every configured fee-ETA target
    /// except the last, concurrently; stores non-negative results, signals
    /// the supervisor, then sleeps 60s before repeating.
    async fn request_fee_estimates(self: Arc<Self>) -> Result<()> {
        loop {
            let targets = self.config.fee_eta_targets().to_vec();
            let targets = if targets.is_empty() {
                targets
            } else {
                targets[..targets.len() - 1].to_vec()
            };

            let fetches = targets.iter().map(|&target| self.get_estimatefee(target));
            let results = futures::future::join_all(fetches).await;

            {
                let mut eta = self.fee_estimates_eta.lock().await;
                for (target, result) in targets.iter().zip(results) {
                    if let Ok(value) = result
                        && value >= 0.0
                    {
                        eta.insert(*target, value);
                    }
                }
            }

            self.events.network_updated().await;

            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(Duration::from_secs(60)) => {}
            }
        }
    }

    /// Subscribes to `blockchain.headers.subscribe` and feeds every tip
    /// notification into the chain resolver, marking the interface ready on
    /// the first one.
    async fn run_fetch_blocks(self: Arc<Self>) -> Result<()> {
        let (tx, mut rx) = mpsc::channel(16);
        self.session().await?.subscribe("blockchain.headers.subscribe", vec![], tx).await?;

        loop {
            let notification = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                notification = rx.recv() => notification,
            };

            let Some(value) = notification else {
                return Err(PeerError::graceful("tip subscription closed"));
            };

            let header = Self::parse_tip_notification(&value)?;
            self.tip.store(header.height, std::sync::atomic::Ordering::Release);
            self.mark_ready(header).await?;

            let changed = self.process_header_at_tip(header).await?;
            self.after_tip_processing(changed).await;
        }
    }

    fn parse_tip_notification(delivered: &Value) -> Result<HeaderRecord> {
        // `subscribe`/notifications deliver `params + [value]`; with the
        // empty params this subscription is always made with, that is a
        // single-element array wrapping the tip dict.
        let value = delivered
            .get(0)
            .ok_or_else(|| PeerError::corrupted("tip notification carried no value"))?;
        let height = validate::is_non_negative_integer(validate::dict_contains_field(value, "height")?)?;
        let hex_field = validate::dict_contains_field(value, "hex")?;
        let hex_str = hex_field
            .as_str()
            .ok_or_else(|| PeerError::corrupted("tip notification 'hex' was not a string"))?;
        validate::is_hex_string(hex_str)?;

        let bytes = hex::decode(hex_str).map_err(|e| PeerError::corrupted(e.to_string()))?;
        let array: HeaderBytes = bytes
            .as_slice()
            .try_into()
            .map_err(|_| PeerError::corrupted("tip notification header was not 80 bytes"))?;
        HeaderRecord::from_bytes(height as u32, &array)
    }

    /// Resolves `ready` once, the first time a verified tip is observed.
    async fn mark_ready(&self, tip_header: HeaderRecord) -> Result<()> {
        if self.ready.is_done() {
            return Ok(());
        }

        let chain = match self.store.check_header(&tip_header).await {
            Some(chain) => chain,
            None => self.store.get_best_chain().await,
        };
        *self.chain.lock().await = Some(chain);

        self.ready.mark().await
    }

    /// Maps disconnect-triggering RPC error codes to a graceful disconnect
    /// rather than letting them propagate as unexpected failures.
    pub(crate) fn downgrade_disconnect_triggering<T>(&self, result: Result<T>) -> Result<T> {
        match result {
            Err(PeerError::Rpc { code, message }) if error::is_downgradable_rpc_code(code) => {
                Err(PeerError::graceful(format!("server rpc error {code}: {message}")))
            }
            other => other,
        }
    }
}
