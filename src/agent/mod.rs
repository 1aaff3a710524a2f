use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::api::{ApiServer, ApiState};
use crate::cache::LocalCache;
use crate::config::Config;
use crate::demo::DemoGenerator;
use crate::dispatch::dimension::DimensionResolver;
use crate::dispatch::Dispatcher;
use crate::export::health::HealthMetrics;
use crate::ingest::IngestFilter;
use crate::migrate::{Migrator, SchemaMigrator};
use crate::policy::{retention_floor, PolicyTable};
use crate::query::{QueryEngine, QuerySettings};
use crate::retention::RetentionPruner;
use crate::store::{Dialect, Probe, Store, StoreContext, StoreStatus};

/// Historian orchestrates all components: ingest filter, local cache,
/// dispatcher, retention pruner, query engine and the HTTP surfaces.
pub struct Historian<S: Store, P: Probe> {
    cfg: Config,
    health: Arc<HealthMetrics>,
    ctx: StoreContext<S>,
    cache: Arc<LocalCache>,
    ingest: IngestFilter,
    dispatcher: Arc<Dispatcher<S, P>>,
    pruner: Arc<RetentionPruner>,
    query: Arc<QueryEngine<S>>,
    demo: Arc<DemoGenerator<S>>,
    migrator: Arc<SchemaMigrator<S>>,
    schema_ready: Arc<AtomicBool>,
    api: ApiServer,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    /// Jobs spawned by the tickers, awaited on stop.
    jobs: TaskTracker,
}

impl<S: Store, P: Probe> Historian<S, P> {
    /// Builds every component and opens the local cache. Nothing runs until
    /// [`Historian::start`].
    pub fn new(cfg: Config, store: S, dialect: Arc<dyn Dialect>, probe: P) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        let cache = Arc::new(
            LocalCache::open(&cfg.cache.dir)
                .with_context(|| format!("opening cache at {}", cfg.cache.dir.display()))?,
        );
        info!(
            dir = %cfg.cache.dir.display(),
            metrics = cache.list_ids().len(),
            entries = cache.total_entries(),
            "local cache opened"
        );

        let policies = Arc::new(PolicyTable::new());
        for (id, policy) in cfg.ingest.resolved_policies() {
            policies.set(id, Some(policy));
        }

        let store = Arc::new(store);
        let ctx = StoreContext {
            store: Arc::clone(&store),
            dialect: Arc::clone(&dialect),
            resolver: Arc::new(DimensionResolver::new(
                Arc::clone(&dialect),
                Some(Arc::clone(&health)),
            )),
            status: Arc::new(StoreStatus::new(false)),
            borrow_timeout: cfg.store.borrow_timeout,
        };

        let ingest = IngestFilter::new(
            Arc::clone(&policies),
            Arc::clone(&cache),
            Some(Arc::clone(&health)),
        );
        let dispatcher = Arc::new(Dispatcher::new(
            ctx.clone(),
            Arc::new(probe),
            Arc::clone(&cache),
            Some(Arc::clone(&health)),
        ));
        let pruner = Arc::new(RetentionPruner::new(
            Arc::clone(&cache),
            Arc::clone(&policies),
            retention_floor(cfg.cache.retention),
            Some(Arc::clone(&health)),
        ));
        let demo = Arc::new(DemoGenerator::new(ctx.clone(), Arc::clone(&policies)));
        let query = Arc::new(QueryEngine::new(
            ctx.clone(),
            Arc::clone(&cache),
            policies,
            QuerySettings {
                limit: cfg.query.limit,
                end_skew: cfg.query.end_skew,
                round: cfg.store.round,
            },
            Some(Arc::clone(&health)),
        ));
        let migrator = Arc::new(SchemaMigrator::new(
            store,
            dialect,
            cfg.store.borrow_timeout,
        ));
        let api = ApiServer::new(cfg.api.addr.clone());

        Ok(Self {
            schema_ready: Arc::new(AtomicBool::new(!cfg.store.bootstrap)),
            cfg,
            health,
            ctx,
            cache,
            ingest,
            dispatcher,
            pruner,
            query,
            demo,
            migrator,
            api,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
            jobs: TaskTracker::new(),
        })
    }

    pub fn ingest(&self) -> &IngestFilter {
        &self.ingest
    }

    pub fn query(&self) -> &Arc<QueryEngine<S>> {
        &self.query
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher<S, P>> {
        &self.dispatcher
    }

    pub fn pruner(&self) -> &Arc<RetentionPruner> {
        &self.pruner
    }

    pub fn health(&self) -> &Arc<HealthMetrics> {
        &self.health
    }

    pub fn api_state(&self) -> ApiState<S> {
        ApiState {
            ingest: self.ingest.clone(),
            query: Arc::clone(&self.query),
            demo: Arc::clone(&self.demo),
            default_debounce: self.cfg.ingest.debounce,
        }
    }

    /// Starts the servers and the periodic sweeps.
    pub async fn start(&mut self) -> Result<()> {
        // Health first so probes respond while the store is bootstrapped.
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        if !self.schema_ready.load(Ordering::Acquire) {
            bootstrap(&self.migrator, &self.schema_ready).await;
        }

        self.api
            .start(self.api_state())
            .await
            .context("starting api server")?;

        self.spawn_dispatch_loop();

        let pruner = Arc::clone(&self.pruner);
        self.spawn_ticker("retention", self.cfg.cache.prune_interval, move || {
            let pruner = Arc::clone(&pruner);
            async move {
                pruner.run_once().await;
            }
        });

        let cache = Arc::clone(&self.cache);
        self.spawn_ticker("cache flush", self.cfg.cache.flush_interval, move || {
            let cache = Arc::clone(&cache);
            async move {
                match cache.flush().await {
                    Ok(0) => {}
                    Ok(written) => debug!(written, "cache flushed"),
                    Err(e) => warn!(error = %e, "periodic cache flush failed"),
                }
            }
        });

        info!(
            backend = self.ctx.dialect.name(),
            policies = self.ingest.policies().len(),
            "historian started"
        );

        Ok(())
    }

    /// Dispatch ticks retry the schema bootstrap until it succeeds, then
    /// sweep.
    fn spawn_dispatch_loop(&mut self) {
        let dispatcher = Arc::clone(&self.dispatcher);
        let migrator = Arc::clone(&self.migrator);
        let schema_ready = Arc::clone(&self.schema_ready);

        self.spawn_ticker("dispatch", self.cfg.dispatch.interval, move || {
            let dispatcher = Arc::clone(&dispatcher);
            let migrator = Arc::clone(&migrator);
            let schema_ready = Arc::clone(&schema_ready);
            async move {
                if !schema_ready.load(Ordering::Acquire)
                    && !bootstrap(&migrator, &schema_ready).await
                {
                    return;
                }
                dispatcher.run_once().await;
            }
        });
    }

    /// Runs `job` on every tick of `period` in its own task, so a slow job
    /// never delays the next tick. Overlap is resolved by the job itself.
    fn spawn_ticker<F, Fut>(&mut self, name: &'static str, period: Duration, job: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        let jobs = self.jobs.clone();

        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(task = name, "ticker stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        jobs.spawn(job());
                    }
                }
            }
        }));
    }

    /// Gracefully stops all components: timers first, then running sweeps
    /// are awaited, pending debounces and the cache are flushed and the pool
    /// is closed.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                error!(error = %e, "ticker task failed");
            }
        }

        self.jobs.close();
        if !self.jobs.is_empty() {
            info!(running = self.jobs.len(), "waiting for running sweeps");
        }
        self.jobs.wait().await;

        self.api.stop();

        let flushed = self.ingest.flush_pending();
        if flushed > 0 {
            info!(flushed, "flushed pending debounced events");
        }

        match self.cache.flush().await {
            Ok(written) => info!(written, "cache flushed on shutdown"),
            Err(e) => error!(error = %e, "flushing cache on shutdown"),
        }

        self.ctx.store.close().await;

        self.health.stop().await?;

        info!("historian stopped");

        Ok(())
    }
}

/// Runs the schema bootstrap, recording success in `ready`.
async fn bootstrap<S: Store>(migrator: &SchemaMigrator<S>, ready: &AtomicBool) -> bool {
    match migrator.up().await {
        Ok(()) => {
            ready.store(true, Ordering::Release);
            true
        }
        Err(e) => {
            warn!(error = %format!("{e:#}"), "schema bootstrap failed, will retry");
            false
        }
    }
}
