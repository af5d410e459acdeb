//! System usage sampling for the periodic SystemUsageReport.

use sysinfo::{Disks, System};

use crate::protocol::SystemUsageReport;

pub struct UsageSampler {
    device_id: String,
    sys: System,
    disks: Disks,
}

impl UsageSampler {
    pub fn new(device_id: String) -> Self {
        let mut sys = System::new();
        // Prime the CPU counters; the first delta-based reading needs a
        // previous sample to diff against.
        sys.refresh_cpu_usage();
        Self {
            device_id,
            sys,
            disks: Disks::new_with_refreshed_list(),
        }
    }

    pub fn sample(&mut self) -> SystemUsageReport {
        self.sys.refresh_cpu_usage();
        self.sys.refresh_memory();
        self.disks.refresh();

        let cpu_percent = self.sys.global_cpu_usage() as u32;

        let mem_total = self.sys.total_memory();
        let mem_percent = if mem_total > 0 {
            (self.sys.used_memory() * 100 / mem_total) as u32
        } else {
            0
        };

        // Root partition only, matching what operators watch on devices.
        let disk_percent = self
            .disks
            .list()
            .iter()
            .find(|d| d.mount_point() == std::path::Path::new("/"))
            .or_else(|| self.disks.list().first())
            .map(|d| {
                let total = d.total_space();
                if total > 0 {
                    ((total - d.available_space()) * 100 / total) as u32
                } else {
                    0
                }
            })
            .unwrap_or(0);

        let load1 = System::load_average().one as f32;

        SystemUsageReport {
            device_id: self.device_id.clone(),
            cpu_percent,
            mem_percent,
            disk_percent,
            load1,
        }
    }
}
