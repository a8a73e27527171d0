//! Stamp store: copy-on-write config snapshots and the change ingest loop.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, VecDeque};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use k8s_openapi::api::core::v1::ConfigMap;
use metrics::counter;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use stamp_core::config::{DEFAULTS_CONFIG_NAME, FEATURES_CONFIG_NAME};
use stamp_core::{Config, ConfigError, Defaults, Features, RequestContext};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// A named, flat key/value configuration source.
pub trait ConfigSource {
    fn name(&self) -> &str;
    fn data(&self) -> Option<&BTreeMap<String, String>>;
}

impl ConfigSource for ConfigMap {
    fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("")
    }

    fn data(&self) -> Option<&BTreeMap<String, String>> {
        self.data.as_ref()
    }
}

/// One change notification from the config feed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigChange {
    pub name: String,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl ConfigChange {
    pub fn new(name: impl Into<String>, data: BTreeMap<String, String>) -> Self {
        Self { name: name.into(), data }
    }

    /// Build a change from a ConfigMap manifest.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let cm: ConfigMap = serde_yaml::from_str(yaml).context("parsing ConfigMap YAML")?;
        if cm.metadata.name.as_deref().map_or(true, str::is_empty) {
            anyhow::bail!("ConfigMap missing metadata.name");
        }
        Ok(Self::from(&cm))
    }
}

impl From<&ConfigMap> for ConfigChange {
    fn from(cm: &ConfigMap) -> Self {
        Self { name: cm.name().to_string(), data: cm.data.clone().unwrap_or_default() }
    }
}

impl ConfigSource for ConfigChange {
    fn name(&self) -> &str {
        &self.name
    }

    fn data(&self) -> Option<&BTreeMap<String, String>> {
        Some(&self.data)
    }
}

enum Domain {
    Defaults(Arc<Defaults>),
    Features(Arc<Features>),
}

fn parse_domain(name: &str, data: &BTreeMap<String, String>) -> Option<Result<Domain, ConfigError>> {
    match name {
        DEFAULTS_CONFIG_NAME => Some(Defaults::from_data(data).map(|d| Domain::Defaults(Arc::new(d)))),
        FEATURES_CONFIG_NAME => Some(Features::from_data(data).map(|f| Domain::Features(Arc::new(f)))),
        _ => None,
    }
}

/// Holds the current snapshot. Readers load an `Arc` and keep it for as long
/// as they like; writers install a fresh snapshot instead of mutating.
pub struct ConfigStore {
    current: ArcSwap<Config>,
    epoch_tx: watch::Sender<u64>,
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigStore {
    pub fn new() -> Self {
        let (epoch_tx, _) = watch::channel(0u64);
        Self { current: ArcSwap::from_pointee(Config::default()), epoch_tx }
    }

    pub fn current(&self) -> Arc<Config> {
        self.current.load_full()
    }

    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> {
        self.epoch_tx.subscribe()
    }

    /// Attach the current snapshot to `ctx`.
    pub fn to_context<'a>(&self, ctx: RequestContext<'a>) -> RequestContext<'a> {
        ctx.with_config(self.current())
    }

    /// Replace one domain of the snapshot. Malformed sources are logged and
    /// dropped; the domain keeps its previous value.
    pub fn on_config_changed<S: ConfigSource + ?Sized>(&self, source: &S) {
        let name = source.name();
        let empty = BTreeMap::new();
        let data = source.data().unwrap_or(&empty);
        let domain = match parse_domain(name, data) {
            None => {
                debug!(domain = %name, "ignoring unknown config domain");
                return;
            }
            Some(Err(e)) => {
                warn!(domain = %name, error = %e, "config parse failed; keeping previous snapshot");
                counter!("config_parse_errors_total", 1u64);
                return;
            }
            Some(Ok(d)) => d,
        };

        self.current.rcu(|cur| {
            let mut next = Config::clone(cur);
            next.epoch = cur.epoch.saturating_add(1);
            match &domain {
                Domain::Defaults(d) => next.defaults = Arc::clone(d),
                Domain::Features(f) => next.features = Arc::clone(f),
            }
            next
        });
        // Racing writers publish in any order; the channel only moves forward.
        let epoch = self.current.load().epoch;
        self.epoch_tx.send_if_modified(|seen| {
            if epoch > *seen {
                *seen = epoch;
                true
            } else {
                false
            }
        });
        counter!("config_swaps_total", 1u64);
        info!(domain = %name, epoch, "config snapshot swapped");
    }
}

/// Coalescing queue keyed by domain name; a later change for the same domain
/// replaces the pending one but keeps its place in line. Changes that fail to
/// parse are dropped on arrival and never displace a pending one.
pub struct Coalescer {
    map: FxHashMap<String, ConfigChange>,
    order: VecDeque<String>,
}

impl Default for Coalescer {
    fn default() -> Self {
        Self::new()
    }
}

impl Coalescer {
    pub fn new() -> Self {
        Self { map: FxHashMap::default(), order: VecDeque::new() }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn push(&mut self, c: ConfigChange) {
        if let Some(Err(e)) = parse_domain(&c.name, &c.data) {
            warn!(domain = %c.name, error = %e, "dropping malformed config change");
            counter!("config_parse_errors_total", 1u64);
            return;
        }
        if !self.map.contains_key(&c.name) {
            self.order.push_back(c.name.clone());
        }
        self.map.insert(c.name.clone(), c);
    }

    pub fn drain_ready(&mut self) -> Vec<ConfigChange> {
        let mut out = Vec::with_capacity(self.order.len());
        while let Some(name) = self.order.pop_front() {
            if let Some(c) = self.map.remove(&name) {
                out.push(c);
            }
        }
        out
    }
}

fn ingest_tick() -> std::time::Duration {
    let ms = std::env::var("STAMP_CONFIG_INGEST_TICK_MS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(8);
    std::time::Duration::from_millis(ms.max(1))
}

fn apply_batch(store: &ConfigStore, batch: Vec<ConfigChange>) {
    for c in batch {
        store.on_config_changed(&c);
    }
}

/// Spawn a loop feeding change notifications into `store`. Drop the returned
/// sender to stop it; pending changes are flushed first.
pub fn spawn_config_ingest(store: Arc<ConfigStore>, cap: usize) -> mpsc::Sender<ConfigChange> {
    let (tx, mut rx) = mpsc::channel::<ConfigChange>(cap.max(1));

    tokio::spawn(async move {
        let mut coalescer = Coalescer::new();
        let mut ticker = tokio::time::interval(ingest_tick());
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    match maybe {
                        Some(c) => coalescer.push(c),
                        None => {
                            debug!("config channel closed; draining and exiting ingest loop");
                            apply_batch(&store, coalescer.drain_ready());
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    if !coalescer.is_empty() {
                        apply_batch(&store, coalescer.drain_ready());
                    }
                }
            }
        }
        info!("config ingest loop stopped");
    });

    tx
}

/// Install a fmt subscriber filtered by `STAMP_LOG` (default `info`).
/// Safe to call more than once.
pub fn init_tracing() {
    let env = std::env::var("STAMP_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(true).try_init();
}
