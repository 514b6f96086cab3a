//! Single-threaded backend (§4.4.1): the producer runs every simulator
//! in-line on each `send`. No ring, no semaphore — used for deterministic
//! debugging and for tests that want to reason about a trace without any
//! concurrency.

use parking_lot::Mutex;

use super::{dispatch, StreamBackend};
use crate::error::Result;
use crate::kinds::{Simulator, StreamKind};
use crate::platform::PlatformInfo;

struct Worker<K: StreamKind> {
    sim: Box<dyn Simulator<K>>,
    model: K::Model,
    data: K::Data,
}

pub struct SingleThreaded<K: StreamKind> {
    workers: Mutex<Vec<Worker<K>>>,
}

impl<K: StreamKind> SingleThreaded<K> {
    pub fn new() -> Self {
        SingleThreaded { workers: Mutex::new(Vec::new()) }
    }
}

impl<K: StreamKind> Default for SingleThreaded<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: StreamKind> StreamBackend<K> for SingleThreaded<K> {
    fn run(&mut self, workers: Vec<Box<dyn Simulator<K>>>, platform: PlatformInfo) -> Result<()> {
        let mut built = Vec::with_capacity(workers.len());
        for mut sim in workers {
            sim.set_platform_info(platform);
            let mut model = K::Model::default();
            sim.build(&mut model)?;
            built.push(Worker { sim, model, data: K::Data::default() });
        }
        *self.workers.lock() = built;
        Ok(())
    }

    fn send(&self, refs: &[K::Reference]) {
        let mut workers = self.workers.lock();
        for reference in refs {
            for worker in workers.iter_mut() {
                dispatch(worker.sim.as_mut(), 0, reference, &mut worker.data);
            }
        }
    }

    fn reset(&self) {
        let mut workers = self.workers.lock();
        for worker in workers.iter_mut() {
            worker.sim.reset(&mut worker.data);
        }
    }

    fn sync(&self) -> Result<()> {
        let mut workers = self.workers.lock();
        for worker in workers.iter_mut() {
            worker.sim.barrier(0, &mut worker.data);
        }
        Ok(())
    }

    fn sync_none_blocking(&self) {
        let _ = self.sync();
    }

    fn sync_data(&self) -> Result<()> {
        self.sync()
    }

    fn dump(&self) -> Result<()> {
        let mut workers = self.workers.lock();
        for (id, worker) in workers.iter_mut().enumerate() {
            worker.sim.dump(id, &worker.data);
        }
        Ok(())
    }

    fn get_data(&self, worker_idx: usize) -> Option<K::Data> {
        self.workers.lock().get(worker_idx).map(|w| w.data.clone())
    }

    fn get_model(&self, worker_idx: usize) -> Option<K::Model> {
        self.workers.lock().get(worker_idx).map(|w| w.model.clone())
    }

    fn num_workers(&self) -> usize {
        self.workers.lock().len()
    }

    fn destroy(&mut self) {
        self.workers.lock().clear();
    }
}
