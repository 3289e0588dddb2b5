//! Catalog loader - the tiered acquisition policy
//!
//! Two independent paths:
//!
//! ```text
//! load_catalog()          Cache ──miss/expired──▶ Embedded ──unusable──▶ emergency record
//!                         (no network, safe on a startup path)
//!
//! fetch_and_verify()      fetch_conditional(ETag)
//!                           ├─ 304 ──▶ re-parse cache, touch timestamp ──▶ records
//!                           ├─ 200 ──▶ signature ─▶ verify ─▶ schema ─▶ save ──▶ records
//!                           └─ error / rejection ──▶ None, cache untouched
//! ```
//!
//! At most one refresh runs at a time: concurrent callers share the result
//! of the refresh already in flight. A caller's deadline only ends its own
//! wait; the refresh is aborted when the last waiter gives up.

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use std::borrow::Cow;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use super::embedded::{emergency_record, EMBEDDED_CATALOG};
use super::fetcher::{FetchOutcome, RemoteFetcher, TransportError};
use super::record::BrokerRecord;
use super::schema::{self, SchemaError};
use super::store::{now_epoch_ms, CachedCatalog, CatalogStore, StoreError};
use crate::config::{CatalogConfig, ConfigError};
use crate::trust::{self, KeyId, TrustedKeySet, VerifyError};

/// One source in the loading order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Cache,
    Remote,
    Embedded,
}

impl Tier {
    /// Tiers tried by `load_catalog`, in order
    pub const SYNCHRONOUS: [Tier; 2] = [Tier::Cache, Tier::Embedded];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Cache => "cache",
            Tier::Remote => "remote",
            Tier::Embedded => "embedded",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A refresh that produced trusted records
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// New payload verified, validated and (best effort) persisted
    Updated {
        records: Vec<BrokerRecord>,
        key_id: KeyId,
        etag: Option<String>,
    },
    /// Server confirmed the cached payload is current
    Unmodified { records: Vec<BrokerRecord> },
}

impl RefreshOutcome {
    pub fn records(&self) -> &[BrokerRecord] {
        match self {
            RefreshOutcome::Updated { records, .. } | RefreshOutcome::Unmodified { records } => {
                records
            }
        }
    }

    pub fn into_records(self) -> Vec<BrokerRecord> {
        match self {
            RefreshOutcome::Updated { records, .. } | RefreshOutcome::Unmodified { records } => {
                records
            }
        }
    }
}

/// Why a refresh produced nothing; the existing cache is left as it was
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Verify(#[from] VerifyError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("Server reported the catalog unmodified but there is no usable cached copy")]
    UnmodifiedWithoutCache,

    #[error("Catalog refresh cancelled before completion")]
    Cancelled,

    #[error("Catalog refresh task failed: {0}")]
    Task(String),
}

impl RefreshError {
    /// True for rejections of a payload the server actually sent
    pub fn is_rejection(&self) -> bool {
        matches!(self, RefreshError::Verify(_) | RefreshError::Schema(_))
    }
}

/// Cache diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatus {
    pub dir: std::path::PathBuf,
    pub present: bool,
    pub expired: bool,
    pub age_secs: Option<u64>,
    pub etag: Option<String>,
    pub fetched_at: Option<chrono::DateTime<chrono::Utc>>,
    pub last_checked_at: Option<chrono::DateTime<chrono::Utc>>,
    pub should_update: bool,
}

type SharedRefresh = Shared<BoxFuture<'static, Result<RefreshOutcome, RefreshError>>>;

struct InFlight {
    id: u64,
    refresh: SharedRefresh,
    abort: AbortHandle,
    waiters: usize,
}

/// One caller's attachment to the in-flight refresh; detaches on drop
struct RefreshWaiter {
    inner: Arc<LoaderInner>,
    id: u64,
    refresh: SharedRefresh,
    attached: bool,
}

impl RefreshWaiter {
    async fn wait(&self) -> Result<RefreshOutcome, RefreshError> {
        self.refresh.clone().await
    }

    /// Stop waiting; aborts the refresh if no other caller is waiting on it
    fn give_up(mut self) {
        self.attached = false;
        self.inner.detach(self.id, true);
    }
}

impl Drop for RefreshWaiter {
    fn drop(&mut self) {
        if self.attached {
            self.inner.detach(self.id, false);
        }
    }
}

struct LoaderInner {
    config: CatalogConfig,
    keys: TrustedKeySet,
    fetcher: Arc<dyn RemoteFetcher>,
    store: CatalogStore,
    embedded: Cow<'static, [u8]>,
    in_flight: Mutex<Option<InFlight>>,
    next_refresh_id: AtomicU64,
}

/// Tiered catalog loader; cheap to clone, clones share one refresh slot
#[derive(Clone)]
pub struct CatalogLoader {
    inner: Arc<LoaderInner>,
}

impl fmt::Debug for CatalogLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CatalogLoader")
            .field("base_url", &self.inner.config.base_url)
            .field("cache_dir", &self.inner.store.dir())
            .field("fetcher", &self.inner.fetcher.name())
            .field("keys", &self.inner.keys.len())
            .finish()
    }
}

impl CatalogLoader {
    pub fn builder() -> CatalogLoaderBuilder {
        CatalogLoaderBuilder::default()
    }

    /// Production wiring: HTTP fetcher, builtin keys, bundled asset
    pub fn from_config(config: CatalogConfig) -> Result<Self, ConfigError> {
        Self::builder().config(config).build()
    }

    pub fn config(&self) -> &CatalogConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &CatalogStore {
        &self.inner.store
    }

    pub fn keys(&self) -> &TrustedKeySet {
        &self.inner.keys
    }

    /// Local catalog without touching the network; never empty
    pub fn load_catalog(&self) -> Vec<BrokerRecord> {
        self.load_catalog_with_tier().1
    }

    /// Like `load_catalog`, also reporting which tier answered
    pub fn load_catalog_with_tier(&self) -> (Tier, Vec<BrokerRecord>) {
        let now = now_epoch_ms();
        for tier in Tier::SYNCHRONOUS {
            if let Some(records) = self.inner.load_tier(tier, now) {
                debug!("Loaded {} brokers from {} tier", records.len(), tier);
                return (tier, records);
            }
        }

        error!("Embedded catalog is unusable; falling back to the emergency record");
        (Tier::Embedded, vec![emergency_record()])
    }

    /// Refresh from the remote; `None` on any failure or rejection
    pub async fn fetch_and_verify(&self) -> Option<Vec<BrokerRecord>> {
        match self.fetch_and_verify_detailed().await {
            Ok(outcome) => Some(outcome.into_records()),
            Err(e) => {
                warn!("Catalog refresh failed, keeping local catalog: {}", e);
                None
            }
        }
    }

    /// Refresh from the remote, reporting what happened
    pub async fn fetch_and_verify_detailed(&self) -> Result<RefreshOutcome, RefreshError> {
        self.join_or_start_refresh().wait().await
    }

    /// Refresh, giving up once `deadline` elapses
    ///
    /// Other callers sharing the refresh keep waiting for it; the refresh
    /// itself is aborted only when nobody else is waiting.
    pub async fn fetch_and_verify_with_deadline(
        &self,
        deadline: Duration,
    ) -> Result<RefreshOutcome, RefreshError> {
        let waiter = self.join_or_start_refresh();
        let result = tokio::time::timeout(deadline, waiter.wait()).await;
        match result {
            Ok(result) => result,
            Err(_) => {
                warn!("Catalog refresh exceeded {:?} deadline; giving up", deadline);
                waiter.give_up();
                Err(RefreshError::Cancelled)
            }
        }
    }

    /// Remote refresh, else the local catalog
    ///
    /// An empty verified catalog also falls back, so the result is never empty.
    pub async fn refresh_catalog(&self) -> Vec<BrokerRecord> {
        match self.fetch_and_verify().await {
            Some(records) if !records.is_empty() => records,
            _ => self.load_catalog(),
        }
    }

    /// Whether enough time has passed since the last remote check
    pub fn should_update(&self) -> bool {
        self.should_update_at(now_epoch_ms())
    }

    pub fn should_update_at(&self, now_ms: u64) -> bool {
        let Some(last_checked) = self.inner.store.last_checked_at() else {
            return true;
        };

        if now_ms < last_checked {
            debug!(
                "Clock is behind the last check ({} < {}); allowing update",
                now_ms, last_checked
            );
            return true;
        }

        u128::from(now_ms - last_checked) >= self.inner.config.min_refresh_interval().as_millis()
    }

    pub fn cache_status(&self) -> CacheStatus {
        let now = now_epoch_ms();
        let store = &self.inner.store;
        let cached = store.load();
        let expiration = self.inner.config.cache_expiration();

        CacheStatus {
            dir: store.dir().to_path_buf(),
            present: cached.is_some(),
            expired: cached
                .as_ref()
                .is_some_and(|c| c.is_expired(now, expiration)),
            age_secs: cached.as_ref().map(|c| c.age_ms(now) / 1000),
            etag: cached.as_ref().and_then(|c| c.etag.clone()),
            fetched_at: cached.as_ref().and_then(CachedCatalog::fetched_at),
            last_checked_at: store
                .last_checked_at()
                .and_then(|ms| i64::try_from(ms).ok())
                .and_then(chrono::DateTime::from_timestamp_millis),
            should_update: self.should_update_at(now),
        }
    }

    fn join_or_start_refresh(&self) -> RefreshWaiter {
        let mut slot = self
            .inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(in_flight) = slot.as_mut() {
            if !in_flight.abort.is_finished() {
                debug!("Joining catalog refresh already in flight");
                in_flight.waiters += 1;
                return RefreshWaiter {
                    inner: Arc::clone(&self.inner),
                    id: in_flight.id,
                    refresh: in_flight.refresh.clone(),
                    attached: true,
                };
            }
        }

        let id = self.inner.next_refresh_id.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let result = inner.refresh().await;
            inner.clear_in_flight(id);
            result
        });
        let abort = task.abort_handle();

        let refresh = async move {
            task.await.unwrap_or_else(|e| {
                if e.is_cancelled() {
                    Err(RefreshError::Cancelled)
                } else {
                    Err(RefreshError::Task(e.to_string()))
                }
            })
        }
        .boxed()
        .shared();

        *slot = Some(InFlight {
            id,
            refresh: refresh.clone(),
            abort,
            waiters: 1,
        });
        RefreshWaiter {
            inner: Arc::clone(&self.inner),
            id,
            refresh,
            attached: true,
        }
    }
}

impl LoaderInner {
    fn load_tier(&self, tier: Tier, now_ms: u64) -> Option<Vec<BrokerRecord>> {
        match tier {
            Tier::Cache => self.cached_records(now_ms),
            Tier::Embedded => self.embedded_records(),
            // Only reached through fetch_and_verify
            Tier::Remote => None,
        }
    }

    fn cached_records(&self, now_ms: u64) -> Option<Vec<BrokerRecord>> {
        let cached = self.store.load()?;

        if cached.is_expired(now_ms, self.config.cache_expiration()) {
            debug!(
                "Cached catalog expired (age {}s)",
                cached.age_ms(now_ms) / 1000
            );
            return None;
        }

        match schema::parse(&cached.payload) {
            Ok(records) if records.is_empty() => {
                debug!("Cached catalog is empty; skipping cache tier");
                None
            }
            Ok(records) => Some(records),
            Err(e) => {
                warn!("Cached catalog failed validation: {}", e);
                None
            }
        }
    }

    fn embedded_records(&self) -> Option<Vec<BrokerRecord>> {
        match schema::parse(&self.embedded) {
            Ok(records) if !records.is_empty() => Some(records),
            Ok(_) => {
                error!("Embedded catalog is empty");
                None
            }
            Err(e) => {
                error!("Embedded catalog failed validation: {}", e);
                None
            }
        }
    }

    async fn refresh(&self) -> Result<RefreshOutcome, RefreshError> {
        let now = now_epoch_ms();
        let expiration = self.config.cache_expiration();
        let cached = self
            .with_store(|store| Ok(store.load()))
            .await
            .unwrap_or_else(|e| {
                warn!("Failed to read cached catalog: {}", e);
                None
            })
            .filter(|c| !c.is_expired(now, expiration));
        let etag = cached.as_ref().and_then(|c| c.etag.as_deref());
        let timeout = self.config.request_timeout();
        let catalog_url = self.config.catalog_url();

        info!(
            "Refreshing catalog from {} via {} fetcher",
            catalog_url,
            self.fetcher.name()
        );

        let outcome = self
            .fetcher
            .fetch_conditional(&catalog_url, etag, timeout)
            .await?;
        self.record_check().await;

        match outcome {
            FetchOutcome::Unmodified => {
                let cached = cached.ok_or(RefreshError::UnmodifiedWithoutCache)?;
                let records = schema::parse(&cached.payload)?;
                if let Err(e) = self.with_store(|store| store.touch(now_epoch_ms())).await {
                    warn!("Failed to refresh cache timestamp: {}", e);
                }
                info!("Catalog unmodified ({} brokers)", records.len());
                Ok(RefreshOutcome::Unmodified { records })
            }
            FetchOutcome::Fetched { body, etag } => {
                let signature = self
                    .fetcher
                    .fetch_signature(&self.config.signature_url(), timeout)
                    .await?;

                let key_id = trust::verify(&body, &signature, &self.keys).map_err(|e| {
                    e.log_if_security_critical();
                    e
                })?;

                let records = schema::parse(&body).map_err(|e| {
                    error!(target: "security", "Signed catalog rejected by schema validation: {}", e);
                    e
                })?;

                let cached = CachedCatalog::new(body, now_epoch_ms(), etag.clone());
                if let Err(e) = self.with_store(move |store| store.save(&cached)).await {
                    warn!("Verified catalog could not be cached: {}", e);
                }

                info!(
                    "Catalog updated: {} brokers, signed by '{}'",
                    records.len(),
                    key_id
                );
                Ok(RefreshOutcome::Updated {
                    records,
                    key_id,
                    etag,
                })
            }
        }
    }

    async fn record_check(&self) {
        let checked_at = now_epoch_ms();
        if let Err(e) = self
            .with_store(move |store| store.record_check(checked_at))
            .await
        {
            warn!("Failed to record refresh check: {}", e);
        }
    }

    /// Run cache file I/O on the blocking pool
    async fn with_store<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(&CatalogStore) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || op(&store)).await?
    }

    fn clear_in_flight(&self, id: u64) {
        let mut slot = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|in_flight| in_flight.id == id) {
            *slot = None;
        }
    }

    /// Drop one waiter from refresh `id`, aborting it if `abort_if_last`
    /// and nobody else is waiting
    fn detach(&self, id: u64, abort_if_last: bool) {
        let mut slot = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        let remaining = match slot.as_mut() {
            Some(in_flight) if in_flight.id == id => {
                in_flight.waiters = in_flight.waiters.saturating_sub(1);
                in_flight.waiters
            }
            _ => return,
        };

        if abort_if_last && remaining == 0 {
            if let Some(in_flight) = slot.take() {
                debug!("No callers left waiting; aborting catalog refresh");
                in_flight.abort.abort();
            }
        }
    }
}

/// Builder for [`CatalogLoader`]; unset parts get production defaults
#[derive(Default)]
pub struct CatalogLoaderBuilder {
    config: Option<CatalogConfig>,
    keys: Option<TrustedKeySet>,
    fetcher: Option<Arc<dyn RemoteFetcher>>,
    store: Option<CatalogStore>,
    embedded: Option<Cow<'static, [u8]>>,
}

impl CatalogLoaderBuilder {
    pub fn config(mut self, config: CatalogConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn keys(mut self, keys: TrustedKeySet) -> Self {
        self.keys = Some(keys);
        self
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn RemoteFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn store(mut self, store: CatalogStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Replace the bundled fallback catalog
    pub fn embedded(mut self, payload: impl Into<Cow<'static, [u8]>>) -> Self {
        self.embedded = Some(payload.into());
        self
    }

    pub fn build(self) -> Result<CatalogLoader, ConfigError> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let keys = match self.keys {
            Some(keys) => keys,
            None => TrustedKeySet::builtin()?,
        };
        let store = match self.store {
            Some(store) => store,
            None => CatalogStore::new(config.resolved_cache_dir()?),
        };
        let fetcher = match self.fetcher {
            Some(fetcher) => fetcher,
            None => default_fetcher(&config)?,
        };
        let embedded = self
            .embedded
            .unwrap_or(Cow::Borrowed(EMBEDDED_CATALOG));

        debug!(
            "Catalog loader: {} key(s), cache at {}, {} fetcher",
            keys.len(),
            store.dir().display(),
            fetcher.name()
        );

        Ok(CatalogLoader {
            inner: Arc::new(LoaderInner {
                config,
                keys,
                fetcher,
                store,
                embedded,
                in_flight: Mutex::new(None),
                next_refresh_id: AtomicU64::new(0),
            }),
        })
    }
}

#[cfg(feature = "http")]
fn default_fetcher(config: &CatalogConfig) -> Result<Arc<dyn RemoteFetcher>, ConfigError> {
    let fetcher = super::fetcher::HttpFetcher::new(config.connect_timeout(), config.read_timeout())?;
    Ok(Arc::new(fetcher))
}

#[cfg(not(feature = "http"))]
fn default_fetcher(_config: &CatalogConfig) -> Result<Arc<dyn RemoteFetcher>, ConfigError> {
    Err(ConfigError::NoFetcher)
}
