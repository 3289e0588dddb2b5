//! Brokercat Catalog - tiered acquisition of the broker list
//!
//! This module decides which broker records a client may trust:
//! - A cached copy of the last verified remote catalog
//! - A fresh remote catalog, accepted only with a valid signature
//! - The catalog bundled into the binary
//!
//! # Architecture
//!
//! ```text
//! Catalog server
//!     │
//!     ├── brokers.json      ← ETag, conditional GET
//!     └── brokers.json.sig  ← detached Ed25519 signature
//!            │
//!            ▼
//!     RemoteFetcher ─▶ trust::verify ─▶ schema::parse
//!            │
//!            ▼
//!     CatalogStore          ← brokers.json + brokers.meta.json (atomic)
//!            │
//!            ▼
//!     CatalogLoader         ← cache → embedded, never empty
//! ```

pub mod embedded;
pub mod fetcher;
pub mod loader;
pub mod record;
pub mod schema;
pub mod store;

pub use embedded::{emergency_record, EMBEDDED_CATALOG};
#[cfg(feature = "http")]
pub use fetcher::HttpFetcher;
pub use fetcher::{FetchOutcome, RemoteFetcher, TransportError};
pub use loader::{
    CacheStatus, CatalogLoader, CatalogLoaderBuilder, RefreshError, RefreshOutcome, Tier,
};
pub use record::{BrokerRecord, Platform};
pub use schema::{parse, SchemaError};
pub use store::{CacheMetadata, CachedCatalog, CatalogStore, StoreError};
