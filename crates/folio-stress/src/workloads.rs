use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use folio_fetch::resources::ResourceKind;
use folio_fetch::subscription::{FetchStatus, Fetcher, SubscribeOptions};
use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, de};

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Workload {
    pub concurrency: usize,
    /// The table every operation of this workload reads from.
    pub resource: ResourceKind,
    /// The number of distinct filter parameters operations pick from.
    #[serde(default = "default_keys")]
    pub keys: usize,
    /// The time the simulated backend takes to answer.
    #[serde(default, with = "humantime_serde")]
    pub latency: Duration,
    /// The share of backend loads that fail, between `0` and `1`.
    #[serde(default, deserialize_with = "deserialize_error_rate")]
    pub error_rate: f64,
    /// Whether subscriptions use the cache, or are only coalesced.
    #[serde(default = "default_cached")]
    pub cached: bool,
}

fn default_keys() -> usize {
    1
}

fn default_cached() -> bool {
    true
}

fn deserialize_error_rate<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let rate = f64::deserialize(deserializer)?;
    if !(0.0..=1.0).contains(&rate) {
        return Err(de::Error::custom(format_args!(
            "error_rate must be between 0 and 1, got {rate}"
        )));
    }
    Ok(rate)
}

/// A row served by the [`SimulatedBackend`].
#[derive(Debug, Clone)]
pub struct Record {
    pub resource: ResourceKind,
    pub key: usize,
}

/// Answers loads after a fixed latency, failing a random share of them.
#[derive(Debug)]
pub struct SimulatedBackend {
    latency: Duration,
    error_rate: f64,
    loads: AtomicUsize,
}

impl SimulatedBackend {
    pub fn new(workload: &Workload) -> Self {
        Self {
            latency: workload.latency,
            error_rate: workload.error_rate.clamp(0.0, 1.0),
            loads: AtomicUsize::new(0),
        }
    }

    pub async fn load(&self, resource: ResourceKind, key: usize) -> Result<Record> {
        self.loads.fetch_add(1, Ordering::Relaxed);
        let fail = rand::rng().random_bool(self.error_rate);

        tokio::time::sleep(self.latency).await;
        if fail {
            anyhow::bail!("simulated failure loading {resource} {key}");
        }
        Ok(Record { resource, key })
    }

    /// Returns how often the backend was hit.
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::Relaxed)
    }
}

/// A workload ready to be run.
pub struct PreparedWorkload {
    pub workload: Workload,
    pub backend: Arc<SimulatedBackend>,
}

pub fn prepare_workload(workload: Workload) -> PreparedWorkload {
    let backend = Arc::new(SimulatedBackend::new(&workload));
    PreparedWorkload { workload, backend }
}

/// Mounts a subscription for a random key of the workload and waits for it to settle.
///
/// Returns `true` if the subscription ended up with data.
pub async fn process_workload(fetcher: &Fetcher, prepared: &PreparedWorkload) -> Result<bool> {
    let workload = &prepared.workload;
    let key = rand::rng().random_range(0..workload.keys.max(1));
    let resource = workload.resource;

    let cache_key = resource.cache_key(&key)?;
    let options = if workload.cached {
        SubscribeOptions::cached(cache_key)
    } else {
        SubscribeOptions {
            request_key: Some(cache_key.to_string()),
            ..Default::default()
        }
    };

    let backend = Arc::clone(&prepared.backend);
    let mut subscription = fetcher.subscribe(
        move || {
            let backend = Arc::clone(&backend);
            async move { backend.load(resource, key).await }
        },
        serde_json::to_value(key)?,
        options,
    );

    let state = subscription.settled().await;
    if let Some(error) = &state.error {
        tracing::debug!(%error, "Operation failed");
    }
    Ok(state.status == FetchStatus::Success
        && state
            .data
            .is_some_and(|record| record.resource == resource && record.key == key))
}
