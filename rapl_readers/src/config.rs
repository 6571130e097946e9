use std::{
    path::{Path, PathBuf},
    time::Duration,
};

/// Default time between the two sweeps of a measurement.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Configuration of a sampling session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Where to find the cpu and RAPL interfaces.
    pub paths: Paths,
    /// Time between the two sweeps of a measurement.
    pub interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            paths: Paths::default(),
            interval: DEFAULT_INTERVAL,
        }
    }
}

/// Canonical locations of the interfaces that the readers consume (read-only).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    /// One record block per logical cpu.
    pub cpuinfo: PathBuf,
    /// Contains `cpu<N>/topology/physical_package_id`.
    pub cpu_sysfs: PathBuf,
    /// Control type directory of the powercap framework, contains the `intel-rapl:<n>` zones.
    pub powercap: PathBuf,
    /// The RAPL PMU of perf_event, contains `type`, `cpumask` and `events/`.
    pub perf_event: PathBuf,
    /// Contains `<cpu>/msr`.
    pub msr_dev: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Paths {
            cpuinfo: PathBuf::from("/proc/cpuinfo"),
            cpu_sysfs: PathBuf::from("/sys/devices/system/cpu"),
            powercap: PathBuf::from("/sys/class/powercap/intel-rapl"),
            perf_event: PathBuf::from("/sys/bus/event_source/devices/power"),
            msr_dev: PathBuf::from("/dev/cpu"),
        }
    }
}

impl Paths {
    /// Moves every default path under `root`, for instance
    /// `/proc/cpuinfo` becomes `<root>/proc/cpuinfo`.
    pub fn with_root(root: &Path) -> Paths {
        let rebase = |p: PathBuf| root.join(p.strip_prefix("/").unwrap_or(&p));
        let d = Paths::default();
        Paths {
            cpuinfo: rebase(d.cpuinfo),
            cpu_sysfs: rebase(d.cpu_sysfs),
            powercap: rebase(d.powercap),
            perf_event: rebase(d.perf_event),
            msr_dev: rebase(d.msr_dev),
        }
    }

    pub fn package_id_file(&self, cpu: u32) -> PathBuf {
        self.cpu_sysfs.join(format!("cpu{cpu}/topology/physical_package_id"))
    }

    pub fn powercap_zone(&self, zone: u32) -> PathBuf {
        self.powercap.join(format!("intel-rapl:{zone}"))
    }

    pub fn perf_event_type(&self) -> PathBuf {
        self.perf_event.join("type")
    }

    pub fn perf_event_cpumask(&self) -> PathBuf {
        self.perf_event.join("cpumask")
    }

    pub fn perf_event_events(&self) -> PathBuf {
        self.perf_event.join("events")
    }

    pub fn msr_device(&self, cpu: u32) -> PathBuf {
        self.msr_dev.join(format!("{cpu}/msr"))
    }
}
