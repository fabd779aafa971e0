#![forbid(unsafe_code)]

// Worker pool management for mediasoup

use crate::media::config::{MediaConfig, WorkerConfig};
use crate::media::engine::{EngineEvent, LifecycleSender};
use crate::media::types::{MediaError, MediaResult};
use mediasoup::prelude::*;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Fixed pool of mediasoup Workers, addressed by index.
///
/// Workers are never replaced: a worker exiting is reported as
/// `EngineEvent::WorkerDied` and the process is expected to shut down.
pub struct WorkerManager {
    workers: Vec<Worker>,
    _mediasoup_worker_manager: mediasoup::worker_manager::WorkerManager,
}

impl WorkerManager {
    /// Spawns `num_workers` workers with the configured settings
    ///
    /// # Errors
    /// Returns an error if any worker fails to start
    pub async fn new(config: Arc<MediaConfig>, events: mpsc::Sender<EngineEvent>) -> MediaResult<Self> {
        let num_workers = config.worker_config.num_workers.max(1);
        info!("Creating WorkerManager with {} workers", num_workers);

        let mediasoup_worker_manager = mediasoup::worker_manager::WorkerManager::new();
        let mut workers = Vec::with_capacity(num_workers);

        for i in 0..num_workers {
            let worker = Self::create_worker(&config.worker_config, &mediasoup_worker_manager).await?;
            info!("Created worker {} with id: {}", i, worker.id());
            Self::setup_worker_handlers(&worker, i, LifecycleSender::new(events.clone()));
            workers.push(worker);
        }

        Ok(Self {
            workers,
            _mediasoup_worker_manager: mediasoup_worker_manager,
        })
    }

    async fn create_worker(
        config: &WorkerConfig,
        manager: &mediasoup::worker_manager::WorkerManager,
    ) -> MediaResult<Worker> {
        manager
            .create_worker(config.to_worker_settings())
            .await
            .map_err(|e| MediaError::WorkerError(format!("Failed to create worker: {e}")))
    }

    /// Sets up event handlers for a worker.
    /// Handlers are detached so they persist for the worker's lifetime.
    fn setup_worker_handlers(worker: &Worker, worker_index: usize, events: LifecycleSender) {
        let worker_id = worker.id();

        worker
            .on_dead(move |reason| {
                error!("Worker {} (index {}) died: {:?}", worker_id, worker_index, reason);
                events.send(EngineEvent::WorkerDied { worker_index });
            })
            .detach();

        worker
            .on_close(move || {
                debug!("Worker {} (index {}) closed", worker_id, worker_index);
            })
            .detach();
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Worker at `index`, if it is still running
    ///
    /// # Errors
    /// Returns `MediaError::WorkerError` for an unknown index or a closed worker
    pub fn worker(&self, index: usize) -> MediaResult<Worker> {
        match self.workers.get(index) {
            Some(worker) if !worker.closed() => Ok(worker.clone()),
            Some(_) => Err(MediaError::WorkerError(format!("Worker {index} is closed"))),
            None => Err(MediaError::WorkerError(format!("No worker with index {index}"))),
        }
    }

    pub fn is_worker_alive(&self, index: usize) -> bool {
        self.workers.get(index).is_some_and(|w| !w.closed())
    }
}

impl Drop for WorkerManager {
    fn drop(&mut self) {
        // Workers close when the last handle is dropped
        debug!("WorkerManager being dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_worker_creation() {
        let mut config = MediaConfig::default();
        config.worker_config.num_workers = 2;
        let (tx, _rx) = mpsc::channel(8);
        let manager = WorkerManager::new(Arc::new(config), tx).await;
        assert!(manager.is_ok());

        if let Ok(manager) = manager {
            assert_eq!(manager.worker_count(), 2);
            assert!(manager.worker(1).is_ok());
            assert!(manager.worker(2).is_err());
            assert!(manager.is_worker_alive(0));
        }
    }
}
