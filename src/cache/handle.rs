//! Cache handle and background worker
//!
//! Every operation is posted to one FIFO worker as soon as the method is called, so
//! operations execute in call order even if their replies are awaited out of order. Results
//! come back over a oneshot channel as owned values.

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use super::engine::CacheEngine;
use super::eviction::{EvictionPolicy, FreeDiskSpace, StatvfsDiskSpace};
use super::layout::DirectoryLayout;
use super::metadata::ScanSummary;
use super::observer::{CacheEvent, CacheObserver, ObserverList};
use super::types::{CacheEntry, CachedFileOrigin, FileOperation, SubDirKind};
use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult};

type Job = Box<dyn FnOnce(&mut CacheEngine) + Send>;

/// Cloneable handle to a running cache
///
/// Dropping the last clone stops the worker once queued work drains.
#[derive(Clone)]
pub struct ContentCache {
    sender: mpsc::UnboundedSender<Job>,
    layout: DirectoryLayout,
    observers: ObserverList,
}

impl ContentCache {
    /// Start a cache on the current tokio runtime using `statvfs` for space checks
    pub fn start(config: &CacheConfig) -> CacheResult<Self> {
        let runtime = Handle::try_current().map_err(|e| {
            warn!(error = %e, "Cache must be started inside a tokio runtime");
            CacheError::Failed
        })?;
        Ok(Self::start_with(config, Arc::new(StatvfsDiskSpace), &runtime))
    }

    /// Start a cache with an explicit space query and runtime
    pub fn start_with(
        config: &CacheConfig,
        disk: Arc<dyn FreeDiskSpace>,
        runtime: &Handle,
    ) -> Self {
        let layout = DirectoryLayout::new(&config.root);
        let eviction = EvictionPolicy::new(disk, config.reserved_free_space);
        let mut engine = CacheEngine::new(layout.clone(), eviction);
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();

        runtime.spawn_blocking(move || {
            while let Some(job) = receiver.blocking_recv() {
                job(&mut engine);
            }
            debug!("Cache worker stopped");
        });

        info!(base = %layout.base().display(), "Cache worker started");
        Self {
            sender,
            layout,
            observers: ObserverList::default(),
        }
    }

    /// Queue `f` on the worker and return a future for its result
    ///
    /// A job that panics resolves to `Failed` and the worker moves on to the next one.
    fn post<T, F>(&self, f: F) -> impl Future<Output = CacheResult<T>> + Send + 'static
    where
        T: Send + 'static,
        F: FnOnce(&mut CacheEngine) -> T + Send + 'static,
    {
        let (reply, result) = oneshot::channel();
        let job: Job = Box::new(move |engine: &mut CacheEngine| {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(engine))).map_err(|_| {
                warn!("Cache job panicked");
                CacheError::Failed
            });
            if reply.send(outcome).is_err() {
                trace!("Caller dropped cache reply");
            }
        });
        // A dead worker drops the job and with it the reply sender
        if self.sender.send(job).is_err() {
            warn!("Cache worker is gone");
        }
        async move { result.await.map_err(|_| CacheError::Aborted)? }
    }

    /// Like [`post`](Self::post) for fallible operations
    fn submit<T, F>(&self, f: F) -> impl Future<Output = CacheResult<T>> + Send + 'static
    where
        T: Send + 'static,
        F: FnOnce(&mut CacheEngine, &ObserverList) -> CacheResult<T> + Send + 'static,
    {
        let observers = self.observers.clone();
        let result = self.post(move |engine| f(engine, &observers));
        async move { result.await? }
    }

    /// Create the directory tree and rebuild the index; queue this first
    pub fn initialize(&self) -> impl Future<Output = CacheResult<ScanSummary>> + Send + 'static {
        self.submit(|engine, _| engine.initialize())
    }

    pub fn get_cache_entry(
        &self,
        resource_id: &str,
        content_hash: &str,
    ) -> impl Future<Output = CacheResult<Option<CacheEntry>>> + Send + 'static {
        let (id, hash) = (resource_id.to_string(), content_hash.to_string());
        self.post(move |engine| engine.get_cache_entry(&id, &hash))
    }

    pub fn get_file(
        &self,
        resource_id: &str,
        content_hash: &str,
    ) -> impl Future<Output = CacheResult<PathBuf>> + Send + 'static {
        let (id, hash) = (resource_id.to_string(), content_hash.to_string());
        self.submit(move |engine, _| engine.get_file(&id, &hash))
    }

    pub fn store(
        &self,
        resource_id: &str,
        content_hash: &str,
        source: PathBuf,
        operation: FileOperation,
    ) -> impl Future<Output = CacheResult<()>> + Send + 'static {
        let (id, hash) = (resource_id.to_string(), content_hash.to_string());
        self.submit(move |engine, _| engine.store(&id, &hash, &source, operation))
    }

    pub fn pin(
        &self,
        resource_id: &str,
        content_hash: &str,
    ) -> impl Future<Output = CacheResult<()>> + Send + 'static {
        let (id, hash) = (resource_id.to_string(), content_hash.to_string());
        self.submit(move |engine, observers| {
            engine.pin(&id, &hash)?;
            observers.notify(&CacheEvent::Pinned {
                resource_id: id,
                content_hash: hash,
            });
            Ok(())
        })
    }

    pub fn unpin(
        &self,
        resource_id: &str,
        content_hash: &str,
    ) -> impl Future<Output = CacheResult<()>> + Send + 'static {
        let (id, hash) = (resource_id.to_string(), content_hash.to_string());
        self.submit(move |engine, observers| {
            engine.unpin(&id, &hash)?;
            observers.notify(&CacheEvent::Unpinned {
                resource_id: id,
                content_hash: hash,
            });
            Ok(())
        })
    }

    /// Resolves to the dirty file's path
    pub fn mark_dirty(
        &self,
        resource_id: &str,
        content_hash: &str,
    ) -> impl Future<Output = CacheResult<PathBuf>> + Send + 'static {
        let (id, hash) = (resource_id.to_string(), content_hash.to_string());
        self.submit(move |engine, _| engine.mark_dirty(&id, &hash))
    }

    pub fn commit_dirty(&self, resource_id: &str) -> impl Future<Output = CacheResult<()>> + Send + 'static {
        let id = resource_id.to_string();
        self.submit(move |engine, observers| {
            engine.commit_dirty(&id)?;
            observers.notify(&CacheEvent::Committed { resource_id: id });
            Ok(())
        })
    }

    pub fn clear_dirty(
        &self,
        resource_id: &str,
        content_hash: &str,
    ) -> impl Future<Output = CacheResult<()>> + Send + 'static {
        let (id, hash) = (resource_id.to_string(), content_hash.to_string());
        self.submit(move |engine, _| engine.clear_dirty(&id, &hash))
    }

    /// Resolves to the blob's path in its new state
    pub fn set_mounted_state(
        &self,
        resource_id: &str,
        content_hash: &str,
        to_mount: bool,
    ) -> impl Future<Output = CacheResult<PathBuf>> + Send + 'static {
        let (id, hash) = (resource_id.to_string(), content_hash.to_string());
        self.submit(move |engine, _| engine.set_mounted_state(&id, &hash, to_mount))
    }

    pub fn remove(&self, resource_id: &str) -> impl Future<Output = CacheResult<()>> + Send + 'static {
        let id = resource_id.to_string();
        self.submit(move |engine, _| engine.remove(&id))
    }

    /// (pinned-but-not-fetched ids, dirty ids)
    pub fn get_resource_ids_of_backlog(
        &self,
    ) -> impl Future<Output = CacheResult<(Vec<String>, Vec<String>)>> + Send + 'static {
        self.post(|engine| engine.backlog())
    }

    pub fn get_resource_ids_of_existing_pinned_files(
        &self,
    ) -> impl Future<Output = CacheResult<Vec<String>>> + Send + 'static {
        self.post(|engine| engine.existing_pinned_files())
    }

    pub fn entries(&self) -> impl Future<Output = CacheResult<Vec<CacheEntry>>> + Send + 'static {
        self.post(|engine| {
            engine.index().log_metrics();
            engine.entries()
        })
    }

    /// Evict Tmp if `bytes` more wouldn't fit; resolves to whether they fit now
    pub fn free_disk_space_if_needed_for(
        &self,
        bytes: u64,
    ) -> impl Future<Output = CacheResult<bool>> + Send + 'static {
        self.post(move |engine| engine.free_disk_space_if_needed_for(bytes))
    }

    pub fn clear_all(&self) -> impl Future<Output = CacheResult<()>> + Send + 'static {
        self.submit(|engine, _| engine.clear_all())
    }

    /// Path a cache file would have; computed without touching the worker
    pub fn cache_file_path(
        &self,
        resource_id: &str,
        content_hash: &str,
        sub_dir: SubDirKind,
        origin: CachedFileOrigin,
    ) -> PathBuf {
        self.layout
            .cache_file_path(resource_id, content_hash, sub_dir, origin)
    }

    pub fn is_under_cache_directory(&self, path: &Path) -> bool {
        self.layout.is_under_cache_directory(path)
    }

    pub fn layout(&self) -> &DirectoryLayout {
        &self.layout
    }

    pub fn add_observer(&self, observer: Arc<dyn CacheObserver>) {
        self.observers.add(observer);
    }

    pub fn remove_observer(&self, observer: &Arc<dyn CacheObserver>) -> bool {
        self.observers.remove(observer)
    }
}
