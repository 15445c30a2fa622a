#![allow(dead_code)]

use kernel_mapdb::{CpuSet, Mapper, MapperConfig, RamQuota, Space, TlbHardware};
use std::sync::{Arc, Mutex};

/// One local flush performed on a CPU.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Flush {
    All { cpu: usize },
    Space { cpu: usize, space: u64 },
}

/// TLB hardware that records what it was asked to do.
#[derive(Default)]
pub struct RecordingTlb {
    pub calls: Mutex<Vec<CpuSet>>,
    pub flushes: Mutex<Vec<Flush>>,
}

impl RecordingTlb {
    pub fn take(&self) -> Vec<Flush> {
        std::mem::take(&mut *self.flushes.lock().unwrap())
    }

    pub fn cross_cpu_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl TlbHardware for RecordingTlb {
    fn cpu_call_many(&self, cpus: CpuSet, f: &(dyn Fn(usize) + Sync)) {
        self.calls.lock().unwrap().push(cpus);
        for cpu in cpus.iter() {
            f(cpu);
        }
    }

    fn flush_all(&self, cpu: usize) {
        self.flushes.lock().unwrap().push(Flush::All { cpu });
    }

    fn flush_space(&self, cpu: usize, space: &Space) {
        self.flushes.lock().unwrap().push(Flush::Space {
            cpu,
            space: space.id(),
        });
    }
}

pub struct World {
    pub config: MapperConfig,
    pub sigma0: Arc<Space>,
    pub mapper: Mapper<RecordingTlb>,
}

impl World {
    pub fn new() -> Self {
        let config = MapperConfig::default();
        let sigma0 = Space::new_sigma0(0, Arc::new(RamQuota::unlimited()), &config);
        let mapper = Mapper::new(sigma0.clone(), config, RecordingTlb::default())
            .expect("default config is valid");
        Self {
            config,
            sigma0,
            mapper,
        }
    }

    pub fn task(&self, id: u64) -> Arc<Space> {
        self.task_with_quota(id, usize::MAX)
    }

    pub fn task_with_quota(&self, id: u64, limit: usize) -> Arc<Space> {
        Space::new(id, Arc::new(RamQuota::new(limit)), &self.config)
    }

    pub fn tlb(&self) -> &RecordingTlb {
        self.mapper.hardware()
    }
}
