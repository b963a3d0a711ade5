use crate::traits::LeaseStore;
use mongoclaw_core::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const DEFAULT_LOCK_NAME: &str = "change_stream_leader";
const DEFAULT_LEASE_SECONDS: f64 = 30.0;
const DEFAULT_RENEW_SECONDS: f64 = 10.0;

/// Lease-based leader election. At most one instance holds the lock within a
/// lease window; leadership transitions are published on a watch channel so
/// the watcher can start and stop without callback plumbing.
pub struct LeaderElection {
    leases: Arc<dyn LeaseStore>,
    lock_name: String,
    instance_id: String,
    lease_seconds: f64,
    renew_seconds: f64,
    leadership: watch::Sender<bool>,
    token: CancellationToken,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl LeaderElection {
    pub fn new(leases: Arc<dyn LeaseStore>, lock_name: impl Into<String>) -> Self {
        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".into());
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let instance_id = format!("{}-{}", hostname, &suffix[..8]);
        let (leadership, _) = watch::channel(false);
        Self {
            leases,
            lock_name: lock_name.into(),
            instance_id,
            lease_seconds: DEFAULT_LEASE_SECONDS,
            renew_seconds: DEFAULT_RENEW_SECONDS,
            leadership,
            token: CancellationToken::new(),
            task: parking_lot::Mutex::new(None),
        }
    }

    pub fn with_timing(mut self, lease_seconds: f64, renew_seconds: f64) -> Self {
        self.lease_seconds = lease_seconds;
        self.renew_seconds = renew_seconds;
        self
    }

    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn is_leader(&self) -> bool {
        *self.leadership.borrow()
    }

    /// Leadership transitions; `true` on election, `false` on demotion.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.leadership.subscribe()
    }

    pub async fn current_leader(&self) -> Result<Option<String>> {
        self.leases.current_holder(&self.lock_name).await
    }

    pub fn require_leader(&self) -> Result<()> {
        if self.is_leader() {
            Ok(())
        } else {
            Err(Error::NotLeader(self.instance_id.clone()))
        }
    }

    pub async fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        info!(instance_id = %this.instance_id, lock = %this.lock_name, "starting leader election");
        // Contend immediately so a fresh deployment elects without waiting a
        // full renew interval.
        this.tick().await;
        let handle = tokio::spawn({
            let this = Arc::clone(&this);
            async move {
                this.election_loop().await;
            }
        });
        *self.task.lock() = Some(handle);
    }

    pub async fn stop(&self) {
        info!(instance_id = %self.instance_id, "stopping leader election");
        self.token.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        if self.is_leader() {
            if let Err(err) = self.leases.release(&self.lock_name, &self.instance_id).await {
                warn!(error = %err, "failed to release leader lease");
            }
            self.demote();
        }
    }

    async fn election_loop(&self) {
        let interval = Duration::from_secs_f64(self.renew_seconds);
        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = tokio::time::sleep(interval) => self.tick().await,
            }
        }
    }

    async fn tick(&self) {
        if self.is_leader() {
            match self
                .leases
                .renew(&self.lock_name, &self.instance_id, self.lease_seconds)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    warn!(instance_id = %self.instance_id, "lease renewal rejected");
                    self.demote();
                }
                Err(err) => {
                    warn!(instance_id = %self.instance_id, error = %err, "lease renewal failed");
                    self.demote();
                }
            }
        } else {
            match self
                .leases
                .try_acquire(&self.lock_name, &self.instance_id, self.lease_seconds)
                .await
            {
                Ok(true) => {
                    info!(instance_id = %self.instance_id, "acquired leadership");
                    let _ = self.leadership.send(true);
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(instance_id = %self.instance_id, error = %err, "acquire attempt failed");
                }
            }
        }
    }

    fn demote(&self) {
        if self.is_leader() {
            warn!(instance_id = %self.instance_id, "lost leadership");
            let _ = self.leadership.send(false);
        }
    }
}
