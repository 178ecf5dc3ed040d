//! Metric sampling and the rotating poll buffer.

use crate::core::{Gauge, MonitorError, Result};
use std::collections::BTreeMap;
use sysinfo::{Pid, System};

/// Gauges collected at one poll tick.
pub type Sample = BTreeMap<String, Gauge>;

/// Where the agent reads its metrics from.
pub trait MetricSource: Send {
    /// Write the runtime gauges into `sample`. Gauges the source cannot read
    /// this cycle are left out.
    fn sample_runtime(&mut self, sample: &mut Sample);

    /// Host memory and per-CPU utilization, read once per report.
    fn host_stats(&mut self) -> Result<Vec<(String, Gauge)>>;
}

/// [`MetricSource`] backed by the operating system.
pub struct SystemSource {
    system: System,
    pid: Option<Pid>,
}

impl SystemSource {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                tracing::warn!("Process metrics unavailable: {}", e);
                None
            },
        };
        Self {
            system: System::new_all(),
            pid,
        }
    }
}

impl Default for SystemSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricSource for SystemSource {
    fn sample_runtime(&mut self, sample: &mut Sample) {
        self.system.refresh_all();
        let mut put = |name: &str, value: f64| {
            sample.insert(name.to_string(), value);
        };

        if let Some(process) = self.pid.and_then(|pid| self.system.process(pid)) {
            let disk = process.disk_usage();
            put("ProcessResidentMemory", process.memory() as f64);
            put("ProcessVirtualMemory", process.virtual_memory() as f64);
            put("ProcessCPUUsage", f64::from(process.cpu_usage()));
            put("ProcessRunTime", process.run_time() as f64);
            put("ProcessDiskRead", disk.read_bytes as f64);
            put("ProcessDiskWritten", disk.written_bytes as f64);
            put("ProcessDiskTotalRead", disk.total_read_bytes as f64);
            put("ProcessDiskTotalWritten", disk.total_written_bytes as f64);
        }

        put("UsedMemory", self.system.used_memory() as f64);
        put("AvailableMemory", self.system.available_memory() as f64);
        put("TotalSwap", self.system.total_swap() as f64);
        put("UsedSwap", self.system.used_swap() as f64);
        put("FreeSwap", self.system.free_swap() as f64);
        put("GlobalCPUUsage", f64::from(self.system.global_cpu_usage()));
        put("CPUCount", self.system.cpus().len() as f64);
        put("ProcessCount", self.system.processes().len() as f64);

        let load = System::load_average();
        put("LoadAverage1", load.one);
        put("LoadAverage5", load.five);
        put("LoadAverage15", load.fifteen);
        put("Uptime", System::uptime() as f64);
        put("BootTime", System::boot_time() as f64);

        put("RandomValue", rand::random::<f64>());
    }

    fn host_stats(&mut self) -> Result<Vec<(String, Gauge)>> {
        self.system.refresh_memory();
        self.system.refresh_cpu_usage();

        let total = self.system.total_memory();
        if total == 0 {
            return Err(MonitorError::host_stats("memory information unavailable"));
        }
        let cpus = self.system.cpus();
        if cpus.is_empty() {
            return Err(MonitorError::host_stats("CPU information unavailable"));
        }

        let mut stats = Vec::with_capacity(cpus.len() + 2);
        stats.push(("TotalMemory".to_string(), total as f64));
        stats.push(("FreeMemory".to_string(), self.system.free_memory() as f64));
        for (i, cpu) in cpus.iter().enumerate() {
            stats.push((format!("CPUutilization{}", i), f64::from(cpu.cpu_usage())));
        }
        Ok(stats)
    }
}

/// Ring of `report_step` samples, one per poll since the last report.
#[derive(Debug, Clone)]
pub struct PollBuffer {
    slots: Vec<Sample>,
}

impl PollBuffer {
    pub fn new(report_step: usize) -> Self {
        Self {
            slots: vec![Sample::new(); report_step.max(1)],
        }
    }

    pub fn report_step(&self) -> usize {
        self.slots.len()
    }

    /// Sample `source` into the slot owned by `poll_count`, replacing what the
    /// previous cycle left there.
    pub fn poll(&mut self, poll_count: u64, source: &mut dyn MetricSource) {
        let index = (poll_count % self.slots.len() as u64) as usize;
        let slot = &mut self.slots[index];
        slot.clear();
        source.sample_runtime(slot);
    }

    pub fn slots(&self) -> &[Sample] {
        &self.slots
    }
}
