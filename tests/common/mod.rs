//! Shared fixture for end-to-end tests: every component wired against an
//! in-memory store and a temporary cache directory.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use historian::cache::LocalCache;
use historian::dispatch::dimension::DimensionResolver;
use historian::dispatch::Dispatcher;
use historian::ingest::IngestFilter;
use historian::migrate::{Migrator, SchemaMigrator};
use historian::policy::{MetricPolicy, PolicyTable};
use historian::query::{QueryEngine, QuerySettings};
use historian::retention::RetentionPruner;
use historian::store::memory::{MemoryDialect, MemoryStore};
use historian::store::{Dialect, StoreContext, StoreStatus};

pub const DAY: Duration = Duration::from_secs(86_400);

pub struct Harness {
    pub store: MemoryStore,
    pub cache: Arc<LocalCache>,
    pub policies: Arc<PolicyTable>,
    pub status: Arc<StoreStatus>,
    pub ingest: IngestFilter,
    pub dispatcher: Dispatcher<MemoryStore, MemoryStore>,
    pub pruner: RetentionPruner,
    pub query: QueryEngine<MemoryStore>,
}

impl Harness {
    /// Wires a fresh set of components over `dir` and `store`. Building a
    /// second harness over the same directory simulates a restart.
    pub fn open(dir: &Path, store: &MemoryStore) -> Self {
        let cache = Arc::new(LocalCache::open(dir).expect("open cache"));
        let policies = Arc::new(PolicyTable::new());
        let status = Arc::new(StoreStatus::new(false));
        let dialect: Arc<dyn Dialect> = Arc::new(MemoryDialect);

        let ctx = StoreContext {
            store: Arc::new(store.clone()),
            dialect: Arc::clone(&dialect),
            resolver: Arc::new(DimensionResolver::new(dialect, None)),
            status: Arc::clone(&status),
            borrow_timeout: Duration::from_secs(1),
        };

        Self {
            store: store.clone(),
            ingest: IngestFilter::new(Arc::clone(&policies), Arc::clone(&cache), None),
            dispatcher: Dispatcher::new(
                ctx.clone(),
                Arc::new(store.clone()),
                Arc::clone(&cache),
                None,
            ),
            pruner: RetentionPruner::new(Arc::clone(&cache), Arc::clone(&policies), DAY, None),
            query: QueryEngine::new(
                ctx,
                Arc::clone(&cache),
                Arc::clone(&policies),
                QuerySettings {
                    limit: 2000,
                    end_skew: Duration::from_secs(5000),
                    round: None,
                },
                None,
            ),
            cache,
            policies,
            status,
        }
    }

    pub fn set_policy(&self, id: &str, policy: MetricPolicy) {
        self.ingest.on_policy_change(id, Some(policy));
    }
}

/// A store with its schema already created.
pub async fn bootstrapped_store() -> MemoryStore {
    let store = MemoryStore::new();
    SchemaMigrator::new(
        Arc::new(store.clone()),
        Arc::new(MemoryDialect),
        Duration::from_secs(1),
    )
    .up()
    .await
    .expect("bootstrap schema");
    store
}
