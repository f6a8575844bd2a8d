//! Reconciliation loop
//!
//! [`Provider::provide`] watches the resource store, recompiles the whole snapshot on
//! every (coalesced) change and publishes it when its hash changed. Transport failures
//! restart the watch after an exponential backoff; everything else is handled inside
//! a pass.

use crate::classes::ClassFilter;
use crate::compiler::compile_all;
use crate::config::ProviderConfig;
use crate::status;
use crate::store::{EventStream, ResourceEvent, ResourceStore};
use crate::throttle::{spawn_forwarder, EventSlot};
use crate::{CoreError, Result};
use ingress_api::DynamicConfiguration;
use k8s_openapi::api::networking::v1::Ingress;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

/// Exponential backoff with jitter for restarting the watch
#[derive(Clone, Debug)]
pub struct Backoff {
    /// Delay before the first retry
    pub initial: Duration,
    /// Upper bound for any delay
    pub max: Duration,
    /// Relative jitter applied to every delay, e.g. 0.2 for ±20%
    pub jitter: f64,
    attempt: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            jitter: 0.2,
            attempt: 0,
        }
    }
}

impl Backoff {
    /// Delay before the next retry; grows ×2 per call up to `max`
    pub fn next_delay(&mut self) -> Duration {
        let base = self.initial.as_millis() as u64;
        let exponential = 2u64.saturating_pow(self.attempt);
        let backoff_ms = base
            .saturating_mul(exponential)
            .min(self.max.as_millis() as u64);
        self.attempt = self.attempt.saturating_add(1);

        let factor = if self.jitter > 0.0 {
            rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter)
        } else {
            1.0
        };
        Duration::from_millis(backoff_ms).mul_f64(factor).min(self.max)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// SHA-256 of the canonical JSON form of a snapshot, hex encoded
pub fn snapshot_hash(conf: &DynamicConfiguration) -> Result<String> {
    let bytes = serde_json::to_vec(conf)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Change notifications, directly from the watch or through the throttle slot
enum Events {
    Direct(EventStream),
    Throttled {
        slot: Arc<EventSlot>,
        _forwarder: DropGuard,
    },
}

impl Events {
    fn new(stream: EventStream, throttle: Duration, cancel: &CancellationToken) -> Self {
        if throttle.is_zero() {
            return Events::Direct(stream);
        }
        let slot = Arc::new(EventSlot::new());
        let token = cancel.child_token();
        spawn_forwarder(stream, slot.clone(), token.clone());
        Events::Throttled {
            slot,
            _forwarder: token.drop_guard(),
        }
    }

    async fn next(&mut self) -> Option<ResourceEvent> {
        match self {
            Events::Direct(stream) => stream.recv().await,
            Events::Throttled { slot, .. } => slot.take().await,
        }
    }
}

/// Why a watch session ended without error
enum Stop {
    Cancelled,
    SinkClosed,
}

/// The Ingress provider. Owns the last published hash; everything else is rebuilt on
/// every pass.
pub struct Provider<S> {
    store: Arc<S>,
    config: ProviderConfig,
    last_hash: Option<String>,
}

impl<S: ResourceStore + 'static> Provider<S> {
    pub fn new(store: Arc<S>, config: ProviderConfig) -> Self {
        Self {
            store,
            config,
            last_hash: None,
        }
    }

    /// Run until `cancel` fires or `sink` is dropped
    pub async fn provide(
        mut self,
        sink: mpsc::Sender<DynamicConfiguration>,
        cancel: CancellationToken,
    ) {
        let mut backoff = Backoff::default();
        info!(
            "Starting ingress provider (class: {}, controller: {})",
            self.config.ingress_class, self.config.controller_class
        );

        loop {
            match self.watch(&sink, &cancel, &mut backoff).await {
                Ok(Stop::Cancelled) => {
                    info!("Ingress provider cancelled");
                    break;
                }
                Ok(Stop::SinkClosed) => {
                    info!("Configuration consumer gone, stopping ingress provider");
                    break;
                }
                Err(err) => {
                    let delay = backoff.next_delay();
                    error!("Ingress watch failed: {}, retrying in {:?}", err, delay);
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            info!("Ingress provider cancelled");
                            break;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn watch(
        &mut self,
        sink: &mpsc::Sender<DynamicConfiguration>,
        cancel: &CancellationToken,
        backoff: &mut Backoff,
    ) -> Result<Stop> {
        let stream = tokio::select! {
            _ = cancel.cancelled() => return Ok(Stop::Cancelled),
            stream = self.store.watch_all() => stream?,
        };
        backoff.reset();
        info!("Watching Ingress resources");

        let throttle = self.config.throttle_duration();
        let mut events = Events::new(stream, throttle, cancel);

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return Ok(Stop::Cancelled),
                event = events.next() => event,
            };
            let Some(event) = event else {
                return Err(CoreError::Store("watch stream ended".to_string()));
            };
            debug!("Received {} event, recomputing configuration", event);

            let (conf, ingresses) = self.load_configuration().await?;
            if cancel.is_cancelled() {
                return Ok(Stop::Cancelled);
            }
            if let Some(stop) = self.publish(conf, sink, cancel).await? {
                return Ok(stop);
            }
            self.update_status(&ingresses).await;

            if !throttle.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(Stop::Cancelled),
                    _ = tokio::time::sleep(throttle) => {}
                }
            }
        }
    }

    /// Compile the current cluster state. Returns the snapshot and the handled Ingresses.
    pub async fn load_configuration(&self) -> Result<(DynamicConfiguration, Vec<Arc<Ingress>>)> {
        let ingress_classes = self.store.list_ingress_classes().await?;
        let filter = ClassFilter::new(&self.config, &ingress_classes);

        let ingresses: Vec<_> = self
            .store
            .list_ingresses()
            .await?
            .into_iter()
            .filter(|ingress| filter.accepts(ingress))
            .collect();

        let conf = compile_all(self.store.as_ref(), &self.config, &ingresses).await?;
        Ok((conf, ingresses))
    }

    /// Send `conf` unless it equals the last published snapshot. Returns why the
    /// session has to stop when the sink is gone or `cancel` fired while sending.
    async fn publish(
        &mut self,
        conf: DynamicConfiguration,
        sink: &mpsc::Sender<DynamicConfiguration>,
        cancel: &CancellationToken,
    ) -> Result<Option<Stop>> {
        let hash = snapshot_hash(&conf)?;
        if self.last_hash.as_deref() == Some(hash.as_str()) {
            debug!("Configuration unchanged, skipping publication");
            return Ok(None);
        }

        let routers = conf.http.routers.len() + conf.tcp.routers.len();
        tokio::select! {
            _ = cancel.cancelled() => return Ok(Some(Stop::Cancelled)),
            sent = sink.send(conf) => {
                if sent.is_err() {
                    return Ok(Some(Stop::SinkClosed));
                }
            }
        }
        info!("Published configuration {} ({} routers)", &hash[..12], routers);
        self.last_hash = Some(hash);
        Ok(None)
    }

    async fn update_status(&self, ingresses: &[Arc<Ingress>]) {
        let addresses = match status::published_addresses(self.store.as_ref(), &self.config).await {
            Ok(Some(addresses)) => addresses,
            Ok(None) => return,
            Err(err) => {
                warn!("Failed to compute ingress status addresses: {}", err);
                return;
            }
        };

        let updated = status::update_statuses(self.store.as_ref(), ingresses, &addresses).await;
        if updated > 0 {
            debug!("Updated status of {} ingress(es)", updated);
        }
    }
}
