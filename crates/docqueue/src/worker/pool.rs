use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, error, info};

use crate::db::Database;
use crate::engine::EngineRegistry;
use crate::error::WorkerError;
use crate::worker::{worker_id, ShutdownSignal, Worker, WorkerHealth, WorkerSettings};

/// Several workers polling one store from threads of this process.
pub struct WorkerPool {
    workers: Vec<Arc<Worker>>,
    handles: Vec<JoinHandle<()>>,
    shutdown: ShutdownSignal,
}

impl WorkerPool {
    /// Starts `workers_per_device` workers for every device in `devices`.
    ///
    /// Worker ids carry an index suffix when a device runs more than one
    /// worker.
    pub fn start(
        db: &Database,
        engines: &EngineRegistry,
        settings: &WorkerSettings,
        devices: &[String],
        workers_per_device: usize,
        shutdown: ShutdownSignal,
    ) -> Result<Self, WorkerError> {
        if devices.is_empty() || workers_per_device == 0 {
            return Err(WorkerError::SpawnFailed(
                "a pool needs at least one device and one worker per device".to_string(),
            ));
        }

        let mut pool = Self {
            workers: Vec::with_capacity(devices.len() * workers_per_device),
            handles: Vec::with_capacity(devices.len() * workers_per_device),
            shutdown,
        };

        for device in devices {
            for index in 0..workers_per_device {
                let id = worker_id(device, (workers_per_device > 1).then_some(index));
                let worker_settings = WorkerSettings {
                    device: device.clone(),
                    ..settings.clone()
                };
                let worker = Arc::new(Worker::with_id(
                    id.clone(),
                    db.clone(),
                    engines.clone(),
                    worker_settings,
                ));

                let thread_worker = Arc::clone(&worker);
                let thread_shutdown = pool.shutdown.clone();
                let spawned = thread::Builder::new()
                    .name(id.clone())
                    .spawn(move || thread_worker.run(&thread_shutdown));

                match spawned {
                    Ok(handle) => {
                        pool.workers.push(worker);
                        pool.handles.push(handle);
                    }
                    Err(e) => {
                        // Stop whatever already started before reporting.
                        pool.shutdown();
                        let _ = pool.wait();
                        return Err(WorkerError::SpawnFailed(format!("{}: {}", id, e)));
                    }
                }
            }
        }

        info!("Started {} workers", pool.workers.len());
        Ok(pool)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn health(&self) -> Vec<WorkerHealth> {
        self.workers.iter().map(|w| w.health()).collect()
    }

    pub fn shutdown(&self) {
        info!("Shutting down worker pool...");
        self.shutdown.trigger();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_triggered()
    }

    /// Joins every worker thread. Returns an error naming the first worker
    /// that panicked.
    pub fn wait(self) -> Result<(), WorkerError> {
        let mut first_panic = None;

        for (worker, handle) in self.workers.iter().zip(self.handles) {
            if handle.join().is_err() {
                error!("Worker {} panicked", worker.id());
                first_panic.get_or_insert_with(|| worker.id().to_string());
            } else {
                debug!("Worker {} finished", worker.id());
            }
        }

        info!("All workers have stopped");
        match first_panic {
            Some(id) => Err(WorkerError::Panicked(id)),
            None => Ok(()),
        }
    }
}
