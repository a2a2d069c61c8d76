#![allow(dead_code)]

use ash::vk;
use parking_lot::Mutex;
use std::sync::Arc;

use vk_dispatch::{Device, Report, ReportSink, SimConfig, SimDriver};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Reports collected by a test sink
#[derive(Default)]
pub struct Captured {
    reports: Mutex<Vec<(vk::DebugReportFlagsEXT, String)>>,
}

impl Captured {
    pub fn count(&self, flags: vk::DebugReportFlagsEXT) -> usize {
        self.reports
            .lock()
            .iter()
            .filter(|(f, _)| f.contains(flags))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.lock().is_empty()
    }

    pub fn messages(&self) -> Vec<String> {
        self.reports.lock().iter().map(|(_, m)| m.clone()).collect()
    }
}

impl ReportSink for Captured {
    fn report(&self, report: &Report<'_>) -> bool {
        self.reports
            .lock()
            .push((report.flags, report.message.to_string()));
        false
    }
}

pub struct Rig {
    pub sim: Arc<SimDriver>,
    pub device: Arc<Device>,
    pub reports: Arc<Captured>,
}

pub fn rig(config: SimConfig) -> Rig {
    init_logger();
    let sim = SimDriver::new(config);
    let reports = Arc::new(Captured::default());
    let device = Device::new(sim.clone(), reports.clone()).expect("open simulated device");
    Rig {
        sim,
        device,
        reports,
    }
}

pub fn discrete() -> Rig {
    rig(SimConfig::default())
}

/// Only plain host-visible memory
pub fn host_only() -> SimConfig {
    SimConfig::default().with_memory_types([
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
    ])
}
