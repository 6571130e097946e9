//! Reads the energy counters of RAPL (Running Average Power Limit) through one of three
//! interfaces: the powercap sysfs, the perf_event RAPL PMU or the raw MSRs.
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use rapl_readers::{config::Config, reader::{new_reader, Strategy}, Context};
//!
//! // Detect the topology once, it's shared by the reader.
//! let ctx = Arc::new(Context::detect(Config::default())?);
//!
//! // Pick a reader. Falls back to another strategy if the preferred one is not available.
//! let reader = new_reader(Strategy::FirstAvailable, ctx)?;
//!
//! // Each read takes two samples, one interval apart, and returns the difference.
//! let measurement = reader.read()?;
//! for (package, slots) in &measurement.per_package {
//!     for (slot, energy) in slots {
//!         println!("package {package} {slot}: {energy}");
//!     }
//! }
//! # Ok::<(), rapl_readers::RaplError>(())
//! ```

use std::{
    collections::BTreeMap,
    fmt,
    num::ParseIntError,
    ops::{Add, Sub},
};

use enum_map::{Enum, EnumMap};

pub mod config;
pub mod error;
pub mod msr;
pub mod perf_event;
pub mod powercap;
pub mod reader;
pub mod sampler;
pub mod topology;

pub use error::{RaplError, Result};

use config::Config;
use topology::{PackageId, ProcessorTopology};

/// Conversion factor from Joules to kWh.
pub const JOULE_TO_KWH: f64 = 2.7777777777778e-7;

#[derive(Enum, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RaplDomainType {
    /// entire socket
    Package,
    /// power plane 0: core
    PP0,
    /// power plane 1: uncore
    PP1,
    ///  DRAM
    Dram,
    /// psys
    Platform,
}

impl RaplDomainType {
    pub const ALL: [RaplDomainType; 5] = [
        RaplDomainType::Package,
        RaplDomainType::PP0,
        RaplDomainType::PP1,
        RaplDomainType::Dram,
        RaplDomainType::Platform,
    ];
}

impl fmt::Display for RaplDomainType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let str = match self {
            RaplDomainType::Package => "package",
            RaplDomainType::PP0 => "core",
            RaplDomainType::PP1 => "uncore",
            RaplDomainType::Dram => "dram",
            RaplDomainType::Platform => "psys",
        };
        f.write_str(str)
    }
}

/// Energy per RAPL domain, in Joules.
///
/// A domain is `None` when it's not supported or could not be read.
// NOTE: the energy can be a floating-point number in Joules without any loss of precision,
// because the RAPL energy units are powers of two. A f32 cannot hold the counter values
// exactly (only up to 2^24), hence the f64.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Energy {
    joules: EnumMap<RaplDomainType, Option<f64>>,
}

impl Energy {
    pub fn get(&self, domain: RaplDomainType) -> Option<f64> {
        self.joules[domain]
    }

    pub fn set(&mut self, domain: RaplDomainType, joules: f64) {
        self.joules[domain] = Some(joules);
    }

    /// Adds `joules` to the value of `domain`, which is set if it was absent.
    pub fn accumulate(&mut self, domain: RaplDomainType, joules: f64) {
        self.joules[domain] = Some(self.joules[domain].unwrap_or(0.0) + joules);
    }

    pub fn remove(&mut self, domain: RaplDomainType) {
        self.joules[domain] = None;
    }

    pub fn with(mut self, domain: RaplDomainType, joules: f64) -> Energy {
        self.set(domain, joules);
        self
    }

    /// The domains that have a value.
    pub fn domains(&self) -> impl Iterator<Item = (RaplDomainType, f64)> + '_ {
        self.joules.iter().filter_map(|(d, j)| j.map(|j| (d, j)))
    }

    pub fn is_empty(&self) -> bool {
        self.domains().next().is_none()
    }

    pub fn to_kilowatt_hours(&self) -> Power {
        let mut kwh = EnumMap::default();
        for (domain, joules) in self.domains() {
            kwh[domain] = Some(joules * JOULE_TO_KWH);
        }
        Power { kwh }
    }

    fn zip_with(self, rhs: Energy, f: impl Fn(Option<f64>, Option<f64>) -> Option<f64>) -> Energy {
        let mut res = Energy::default();
        for (domain, value) in res.joules.iter_mut() {
            *value = f(self.joules[domain], rhs.joules[domain]);
        }
        res
    }
}

/// Keeps the domains that are present on at least one side.
impl Add for Energy {
    type Output = Energy;

    fn add(self, rhs: Energy) -> Energy {
        self.zip_with(rhs, |a, b| match (a, b) {
            (Some(a), Some(b)) => Some(a + b),
            (a, b) => a.or(b),
        })
    }
}

/// Keeps the domains that are present on both sides.
impl Sub for Energy {
    type Output = Energy;

    fn sub(self, rhs: Energy) -> Energy {
        self.zip_with(rhs, |a, b| Some(a? - b?))
    }
}

impl fmt::Display for Energy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (domain, joules) in self.domains() {
            if !first {
                f.write_str(", ")?;
            }
            write!(f, "{domain}: {joules} J")?;
            first = false;
        }
        Ok(())
    }
}

/// Energy per RAPL domain, in kWh.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Power {
    kwh: EnumMap<RaplDomainType, Option<f64>>,
}

impl Power {
    pub fn get(&self, domain: RaplDomainType) -> Option<f64> {
        self.kwh[domain]
    }

    pub fn domains(&self) -> impl Iterator<Item = (RaplDomainType, f64)> + '_ {
        self.kwh.iter().filter_map(|(d, j)| j.map(|j| (d, j)))
    }
}

/// Where a value comes from, inside of a package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Slot {
    /// The whole package (powercap and perf_event only give per-package values).
    Package,
    /// One logical cpu, identified by its index.
    Core(u32),
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Package => f.write_str("total"),
            Slot::Core(cpu) => write!(f, "cpu {cpu}"),
        }
    }
}

/// Energy values of a sweep, or the difference between two sweeps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Measurement {
    pub per_package: BTreeMap<PackageId, BTreeMap<Slot, Energy>>,
}

impl Measurement {
    pub fn new() -> Measurement {
        Measurement::default()
    }

    pub fn get(&self, package: PackageId, slot: Slot) -> Option<&Energy> {
        self.per_package.get(&package)?.get(&slot)
    }

    pub fn entry(&mut self, package: PackageId, slot: Slot) -> &mut Energy {
        self.per_package.entry(package).or_default().entry(slot).or_default()
    }

    /// Iterates on all the values: `(package, slot, energy)`.
    pub fn iter(&self) -> impl Iterator<Item = (PackageId, Slot, &Energy)> {
        self.per_package
            .iter()
            .flat_map(|(p, slots)| slots.iter().map(move |(s, e)| (*p, *s, e)))
    }

    /// `after - before`, for every package and slot that are present in both measurements.
    pub fn delta(before: &Measurement, after: &Measurement) -> Measurement {
        let mut res = Measurement::new();
        for (package, slot, b) in after.iter() {
            if let Some(a) = before.get(package, slot) {
                res.per_package.entry(package).or_default().insert(slot, *b - *a);
            }
        }
        res
    }

    /// Sums all the slots of each package.
    ///
    /// Every counter appears in exactly one slot: package-wide counters in [`Slot::Package`],
    /// per-core counters in [`Slot::Core`]. The sum is therefore the energy of the package.
    pub fn total(&self) -> BTreeMap<PackageId, Energy> {
        self.per_package
            .iter()
            .map(|(p, slots)| (*p, slots.values().fold(Energy::default(), |acc, e| acc + *e)))
            .collect()
    }

    pub fn to_kilowatt_hours(&self) -> BTreeMap<PackageId, BTreeMap<Slot, Power>> {
        self.per_package
            .iter()
            .map(|(p, slots)| (*p, slots.iter().map(|(s, e)| (*s, e.to_kilowatt_hours())).collect()))
            .collect()
    }
}

/// What the readers need to know about the machine. Built once, then shared.
#[derive(Debug, Clone)]
pub struct Context {
    pub config: Config,
    pub topology: ProcessorTopology,
}

impl Context {
    /// Detects the topology. Any failure here is fatal for the session.
    pub fn detect(config: Config) -> Result<Context> {
        let topology = ProcessorTopology::detect(&config.paths).map_err(|e| match e {
            RaplError::FatalInit(_) => e,
            other => RaplError::FatalInit(format!("topology detection failed: {other}")),
        })?;
        Ok(Context { config, topology })
    }
}

/// Parses a list of cpus like "0,64" or "0-1" or "0-1,64-66".
pub fn parse_cpu_list(cpulist: &str) -> std::result::Result<Vec<u32>, String> {
    // handles "n" or "start-end"
    fn parse_cpulist_item(item: &str) -> std::result::Result<Vec<u32>, String> {
        let bounds: Vec<u32> = item
            .split('-')
            .map(str::parse)
            .collect::<std::result::Result<Vec<u32>, ParseIntError>>()
            .map_err(|e| format!("invalid cpulist item '{item}': {e}"))?;

        match bounds.as_slice() {
            &[start, end] => Ok((start..=end).collect()),
            &[n] => Ok(vec![n]),
            _ => Err(format!("invalid cpulist item '{item}'")),
        }
    }

    let cpus: Vec<u32> = cpulist
        .trim_end()
        .split(',')
        .map(parse_cpulist_item)
        .collect::<std::result::Result<Vec<Vec<u32>>, String>>()?
        .into_iter() // not the same as iter() !
        .flatten()
        .collect();

    Ok(cpus)
}
