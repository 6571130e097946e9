// See https://github.com/torvalds/linux/commit/4788e5b4b2338f85fa42a712a182d8afd65d7c58
// for an explaination of the RAPL PMU driver.

use std::{
    collections::BTreeMap,
    fs, io,
    path::Path,
    sync::Arc,
};

use log::{debug, warn};
use regex::Regex;

use crate::{
    config::Paths,
    error::{RaplError, Result},
    topology::{PackageId, ProcessorTopology},
    Context, Measurement, RaplDomainType, Slot,
};

/// The power events that we know, named like in `events/energy-<name>`.
pub const POWER_EVENTS: [(&str, RaplDomainType); 5] = [
    ("cores", RaplDomainType::PP0),
    ("gpu", RaplDomainType::PP1),
    ("pkg", RaplDomainType::Package),
    ("ram", RaplDomainType::Dram),
    ("psys", RaplDomainType::Platform),
];

#[derive(Debug, Clone, PartialEq)]
pub struct PowerEvent {
    /// The name of the power event, as reported by the sysfs. This corresponds to a RAPL **domain name**, like "pkg".
    pub name: String,
    /// The RAPL domain type, as an enum.
    pub domain: RaplDomainType,
    /// The raw content of the event file, like "event=0x02".
    pub descriptor: String,
    /// The event code to use as a "config" field for perf_event_open, `None` if the descriptor is invalid.
    pub config: Option<u64>,
    /// should be "Joules"
    pub unit: String,
    /// The scale to apply in order to get joules (`energy_j = count * scale`).
    /// `None` if the scale file is missing or malformed: the event is then unusable.
    pub scale: Option<f64>,
}

impl PowerEvent {
    pub fn is_usable(&self) -> bool {
        self.config.is_some() && self.scale.is_some()
    }
}

/// Retrieves the type of the RAPL PMU (Power Monitoring Unit) in the Linux kernel.
pub fn pmu_type(paths: &Paths) -> Result<u32> {
    let path = paths.perf_event_type();
    let read = fs::read_to_string(&path).map_err(|e| RaplError::io(&path, e))?;
    read.trim_end()
        .parse()
        .map_err(|e| RaplError::decode(format!("{path:?}"), format!("'{}': {e}", read.trim_end())))
}

/// Retrieves the RAPL power events exposed in sysfs, for the domains that we know.
///
/// A malformed scale or descriptor does not fail the discovery: the event is kept but unusable.
pub fn all_power_events(paths: &Paths) -> Result<BTreeMap<RaplDomainType, PowerEvent>> {
    let dir = paths.perf_event_events();
    let config_regex = Regex::new(r"(?:^|,)event=0x([0-9a-fA-F]+)").expect("valid regex");
    let mut events = BTreeMap::new();

    for (name, domain) in POWER_EVENTS {
        let main = dir.join(format!("energy-{name}"));
        let descriptor = match fs::read_to_string(&main) {
            Ok(s) => s.trim_end().to_owned(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("power event {name} is not exposed");
                continue;
            }
            Err(e) => return Err(RaplError::io(&main, e)),
        };

        let config = parse_event_config(&config_regex, &descriptor);
        if config.is_none() {
            warn!("invalid descriptor for power event {name}: '{descriptor}'");
        }
        let scale = read_event_scale(&dir.join(format!("energy-{name}.scale")));
        let unit = fs::read_to_string(dir.join(format!("energy-{name}.unit")))
            .map(|s| s.trim_end().to_owned())
            .unwrap_or_default();

        events.insert(
            domain,
            PowerEvent {
                name: name.to_owned(),
                domain,
                descriptor,
                config,
                unit,
                scale,
            },
        );
    }
    Ok(events)
}

fn parse_event_config(regex: &Regex, descriptor: &str) -> Option<u64> {
    let code = regex.captures(descriptor)?.get(1)?;
    u64::from_str_radix(code.as_str(), 16).ok()
}

fn read_event_scale(path: &Path) -> Option<f64> {
    let read = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            warn!("cannot read {path:?}: {e}");
            return None;
        }
    };
    match read.trim_end().parse::<f64>() {
        Ok(scale) if scale.is_finite() && scale > 0.0 => Some(scale),
        Ok(scale) => {
            warn!("unusable scale in {path:?}: {scale}");
            None
        }
        Err(e) => {
            warn!("failed to parse {path:?}: '{}' ({e})", read.trim_end());
            None
        }
    }
}

/// Retrieves the cpus to open the events on, one per package.
///
/// Uses the cpumask of the PMU if possible, otherwise the first cpu of each package.
pub fn cpus_to_monitor(paths: &Paths, topology: &ProcessorTopology) -> Vec<(PackageId, u32)> {
    let path = paths.perf_event_cpumask();
    let from_mask = fs::read_to_string(&path)
        .map_err(|e| e.to_string())
        .and_then(|mask| crate::parse_cpu_list(&mask));

    match from_mask {
        Ok(cpus) => cpus
            .into_iter()
            .filter_map(|cpu| match topology.core(cpu).and_then(|c| c.package) {
                Some(package) => Some((package, cpu)),
                None => {
                    warn!("cpu {cpu} of the RAPL cpumask is not in the topology, ignoring it");
                    None
                }
            })
            .collect(),
        Err(e) => {
            debug!("cannot use {path:?} ({e}), falling back to the topology");
            topology
                .packages()
                .into_iter()
                .filter_map(|p| topology.cores_of(p).next().map(|c| (p, c.id)))
                .collect()
        }
    }
}

/// Reads the RAPL counters with the perf_event subsystem.
/// Requires `perf_event_paranoid` to be at most 0, or the CAP_PERFMON capability.
#[derive(Debug)]
pub struct PerfEventReader {
    ctx: Arc<Context>,
    pmu_type: u32,
    /// The usable events
    events: Vec<PowerEvent>,
    /// One cpu per package
    cpus: Vec<(PackageId, u32)>,
}

impl PerfEventReader {
    /// Checks that the RAPL PMU exists.
    pub fn is_available(paths: &Paths) -> bool {
        paths.perf_event_type().exists()
    }

    pub fn new(ctx: Arc<Context>) -> Result<PerfEventReader> {
        let paths = &ctx.config.paths;
        let pmu_type = pmu_type(paths)?;
        let events: Vec<PowerEvent> = all_power_events(paths)?
            .into_values()
            .filter(|e| {
                if !e.is_usable() {
                    warn!("power event {} is unusable and will not be measured", e.name);
                }
                e.is_usable()
            })
            .collect();
        let cpus = cpus_to_monitor(paths, &ctx.topology);
        debug!("perf_event: pmu type {pmu_type}, events {events:?}, cpus {cpus:?}");
        Ok(PerfEventReader {
            ctx,
            pmu_type,
            events,
            cpus,
        })
    }

    pub fn events(&self) -> &[PowerEvent] {
        &self.events
    }

    /// Counts the energy consumed during the configured interval.
    ///
    /// The counters are opened for this read only, and closed before returning.
    #[cfg(target_os = "linux")]
    pub fn read(&self) -> Result<Measurement> {
        use session::Counter;

        let mut counters = Vec::with_capacity(self.cpus.len() * self.events.len());
        for (package, cpu) in &self.cpus {
            for event in &self.events {
                let (Some(config), Some(scale)) = (event.config, event.scale) else {
                    continue;
                };
                match Counter::open(self.pmu_type, config, *cpu) {
                    Ok(counter) => counters.push((*package, event.domain, scale, counter)),
                    Err(e) => warn!("failed to open power event {} on cpu {cpu}: {e}", event.name),
                }
            }
        }
        if counters.is_empty() {
            let err = io::Error::new(io::ErrorKind::Other, "no power event could be opened");
            return Err(RaplError::io(self.ctx.config.paths.perf_event_events(), err));
        }

        let path = self.ctx.config.paths.perf_event_events();
        for (_, _, _, c) in &counters {
            c.start().map_err(|e| RaplError::io(&path, e))?;
        }
        std::thread::sleep(self.ctx.config.interval);
        for (_, _, _, c) in &counters {
            c.stop().map_err(|e| RaplError::io(&path, e))?;
        }

        let mut energies = Vec::with_capacity(counters.len());
        for (package, domain, scale, c) in &counters {
            match c.count() {
                Ok(count) => energies.push((*package, *domain, count as f64 * scale)),
                Err(e) => warn!("{}", RaplError::decode(format!("{domain} counter of package {package}"), e)),
            }
        }
        Ok(sum_per_package(energies))
    }

    #[cfg(not(target_os = "linux"))]
    pub fn read(&self) -> Result<Measurement> {
        Err(RaplError::Unimplemented(crate::reader::Strategy::PerfEvent))
    }
}

/// Adds the energies counted on the cpus of each package.
/// A package can have several monitored cpus, one per die.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn sum_per_package(energies: impl IntoIterator<Item = (PackageId, RaplDomainType, f64)>) -> Measurement {
    let mut measurement = Measurement::new();
    for (package, domain, joules) in energies {
        measurement.entry(package, Slot::Package).accumulate(domain, joules);
    }
    measurement
}

#[cfg(target_os = "linux")]
mod session {
    use std::{
        fs::File,
        io::{self, Read},
        os::fd::{AsRawFd, FromRawFd},
    };

    use log::debug;
    use perf_event_open_sys as sys;

    /// An open perf_event counter, closed on drop.
    pub(super) struct Counter {
        fd: File,
    }

    impl Counter {
        /// Make a system call to [perf_event_open](https://www.man7.org/linux/man-pages/man2/perf_event_open.2.html)
        /// with `attr.config = config` and `attr.type = pmu_type`.
        /// The counter is created disabled.
        pub(super) fn open(pmu_type: u32, config: u64, cpu: u32) -> io::Result<Counter> {
            // Only some combination of (pid, cpu) are valid.
            // For RAPL PMU events, we use (-1, cpu) which means "all processes, one cpu".
            let pid = -1;
            let cpu = cpu as i32;

            let mut attr = sys::bindings::perf_event_attr::default();
            attr.config = config;
            attr.type_ = pmu_type;
            attr.size = core::mem::size_of_val(&attr) as u32;
            attr.set_disabled(1);
            debug!("{attr:?}");

            let result = unsafe { sys::perf_event_open(&mut attr, pid, cpu, -1, 0) };
            if result == -1 {
                Err(io::Error::last_os_error())
            } else {
                // SAFETY: the fd has just been returned by perf_event_open and is not owned by anything else
                let fd = unsafe { File::from_raw_fd(result) };
                Ok(Counter { fd })
            }
        }

        /// Resets the count to zero and enables the counter.
        pub(super) fn start(&self) -> io::Result<()> {
            let fd = self.fd.as_raw_fd();
            check(unsafe { sys::ioctls::RESET(fd, 0) })?;
            check(unsafe { sys::ioctls::ENABLE(fd, 0) })
        }

        pub(super) fn stop(&self) -> io::Result<()> {
            check(unsafe { sys::ioctls::DISABLE(self.fd.as_raw_fd(), 0) })
        }

        pub(super) fn count(&self) -> io::Result<u64> {
            let mut buf = [0u8; 8];
            // rewind() is INVALID for perf events, we must read "at the cursor" every time
            let n = (&self.fd).read(&mut buf)?;
            if n != buf.len() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("expected 8 bytes, got {n}"),
                ));
            }
            Ok(u64::from_ne_bytes(buf))
        }
    }

    fn check(res: i32) -> io::Result<()> {
        if res == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}
