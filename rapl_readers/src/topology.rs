// Processor topology, as described by /proc/cpuinfo and the sysfs cpu topology.
// See https://www.kernel.org/doc/html/latest/admin-guide/cputopology.html

use std::{collections::BTreeSet, fmt, fs};

use log::{debug, warn};

use crate::{
    config::Paths,
    error::{RaplError, Result},
};

/// Oldest Intel family with RAPL support that we handle (family 6 covers all RAPL-capable Intel cpus).
pub const INTEL_MIN_FAMILY: u32 = 6;

/// Oldest AMD family with RAPL support (Zen, family 17h).
pub const AMD_MIN_FAMILY: u32 = 0x17;

/// Codename of the models that are not in our table.
pub const UNKNOWN_MODEL: &str = "unknown model";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Vendor {
    #[default]
    Unknown,
    Intel,
    Amd,
}

impl Vendor {
    pub fn from_vendor_id(vendor_id: &str) -> Vendor {
        match vendor_id {
            "GenuineIntel" => Vendor::Intel,
            "AuthenticAMD" => Vendor::Amd,
            _ => Vendor::Unknown,
        }
    }

    /// The minimum cpu family that supports RAPL, or `None` if the vendor is not supported at all.
    pub fn min_family(self) -> Option<u32> {
        match self {
            Vendor::Intel => Some(INTEL_MIN_FAMILY),
            Vendor::Amd => Some(AMD_MIN_FAMILY),
            Vendor::Unknown => None,
        }
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let str = match self {
            Vendor::Unknown => "Unknown",
            Vendor::Intel => "Intel",
            Vendor::Amd => "AMD",
        };
        f.write_str(str)
    }
}

/// Identifier of a physical package (socket), as reported by `topology/physical_package_id`.
///
/// This is not a cpu index: the two namespaces are unrelated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PackageId(pub u32);

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A logical cpu.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Core {
    /// OS-visible index, as in `/dev/cpu/<id>/msr`.
    pub id: u32,
    /// The package that contains this cpu, `None` if it could not be resolved.
    pub package: Option<PackageId>,
}

/// Native byte order of the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    /// Writes a known pattern in memory and looks at how it's laid out.
    pub fn native() -> Result<ByteOrder> {
        ByteOrder::from_probe(0xABCD_u16.to_ne_bytes())
    }

    fn from_probe(bytes: [u8; 2]) -> Result<ByteOrder> {
        match bytes {
            [0xCD, 0xAB] => Ok(ByteOrder::Little),
            [0xAB, 0xCD] => Ok(ByteOrder::Big),
            other => Err(RaplError::FatalInit(format!(
                "could not determine the native byte order, probe gave {other:02x?}"
            ))),
        }
    }

    pub fn read_u64(self, bytes: [u8; 8]) -> u64 {
        match self {
            ByteOrder::Little => u64::from_le_bytes(bytes),
            ByteOrder::Big => u64::from_be_bytes(bytes),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorModel {
    /// The `model` number of cpuinfo.
    pub id: u32,
    /// The `model name` of cpuinfo, for instance "Intel(R) Core(TM) i7-8650U CPU @ 1.90GHz".
    pub name: String,
    /// The microarchitecture codename, or [`UNKNOWN_MODEL`].
    pub codename: &'static str,
}

impl ProcessorModel {
    pub fn new(vendor: Vendor, id: u32, name: String) -> ProcessorModel {
        ProcessorModel {
            id,
            name,
            codename: codename(vendor, id),
        }
    }
}

/// Looks up the codename of a model. Only Intel family 6 models are known,
/// AMD reuses the same model numbers for unrelated designs.
pub fn codename(vendor: Vendor, model: u32) -> &'static str {
    if vendor != Vendor::Intel {
        return UNKNOWN_MODEL;
    }
    match model {
        42 => "SandyBridge",
        45 => "SandyBridge-EP",
        58 => "IvyBridge",
        62 => "IvyBridge-EP",
        60 => "Haswell",
        63 => "Haswell-EP",
        69 => "Haswell-ULT",
        70 => "Haswell-GT3E",
        61 => "Broadwell",
        71 => "Broadwell-GT3E",
        79 => "Broadwell-EP",
        86 => "Broadwell-DE",
        78 => "Skylake-mobile",
        94 => "Skylake",
        85 => "Skylake-X",
        87 => "KnightsLanding",
        133 => "KnightsMill",
        142 => "KabyLake-mobile",
        158 => "KabyLake",
        102 => "CannonLake",
        106 => "IceLake-X",
        126 => "IceLake-mobile",
        140 => "TigerLake-mobile",
        143 => "SapphireRapids",
        151 => "AlderLake",
        154 => "AlderLake-mobile",
        183 => "RaptorLake",
        186 => "RaptorLake-P",
        55 => "Atom-Silvermont",
        74 => "Atom-Merrifield",
        76 => "Atom-Airmont",
        90 => "Atom-Moorefield",
        92 => "Atom-Goldmont",
        95 => "Atom-Denverton",
        122 => "Atom-GeminiLake",
        _ => UNKNOWN_MODEL,
    }
}

/// One entry of the topology: all the logical cpus that share a cpuinfo `physical id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Processor {
    pub physical_id: u32,
    pub vendor: Vendor,
    pub family: u32,
    pub model: ProcessorModel,
    pub byte_order: ByteOrder,
    /// Ordered as in cpuinfo.
    pub cores: Vec<Core>,
    /// Packages of the cores, filled by [`ProcessorTopology::resolve_packages`].
    pub packages: BTreeSet<PackageId>,
}

impl fmt::Display for Processor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} '{}/{}/Fam:{}' on socket {} (packages: {}, cores: {})",
            self.vendor,
            self.model.name,
            self.model.codename,
            self.family,
            self.physical_id,
            self.packages.len(),
            self.cores.len()
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorTopology {
    /// Sorted by physical id.
    pub processors: Vec<Processor>,
}

/// The fields of one cpuinfo record that we care about.
#[derive(Default)]
struct CpuRecord {
    processor: Option<u32>,
    vendor: Vendor,
    family: u32,
    model: u32,
    model_name: String,
    physical_id: Option<u32>,
}

impl ProcessorTopology {
    /// Detects the topology of the machine.
    ///
    /// Fails with [`RaplError::Io`] if the cpuinfo file cannot be read, and with
    /// [`RaplError::FatalInit`] if the processors are not supported or if no package
    /// can be resolved.
    pub fn detect(paths: &Paths) -> Result<ProcessorTopology> {
        let cpuinfo = fs::read_to_string(&paths.cpuinfo).map_err(|e| RaplError::io(&paths.cpuinfo, e))?;
        let byte_order = ByteOrder::native()?;

        let mut topology = ProcessorTopology::parse_cpuinfo(&cpuinfo, byte_order)?;
        topology.check_supported()?;
        topology.resolve_packages(|cpu| read_package_id(paths, cpu));

        if topology.packages().is_empty() {
            return Err(RaplError::FatalInit(format!(
                "no physical package could be resolved from {}",
                paths.cpu_sysfs.display()
            )));
        }
        Ok(topology)
    }

    /// Groups the cpuinfo records by `physical id`.
    /// The packages are not resolved yet: every core has `package: None`.
    pub fn parse_cpuinfo(cpuinfo: &str, byte_order: ByteOrder) -> Result<ProcessorTopology> {
        let mut processors: Vec<Processor> = Vec::new();
        let mut record = CpuRecord::default();

        let flush = |record: CpuRecord, processors: &mut Vec<Processor>| {
            let Some(cpu) = record.processor else {
                return;
            };
            let core = Core { id: cpu, package: None };
            let physical_id = record.physical_id.unwrap_or_else(|| {
                debug!("cpu {cpu} has no physical id in cpuinfo, assuming 0");
                0
            });
            match processors.iter_mut().find(|p| p.physical_id == physical_id) {
                Some(existing) => existing.cores.push(core),
                None => processors.push(Processor {
                    physical_id,
                    vendor: record.vendor,
                    family: record.family,
                    model: ProcessorModel::new(record.vendor, record.model, record.model_name),
                    byte_order,
                    cores: vec![core],
                    packages: BTreeSet::new(),
                }),
            }
        };

        for line in cpuinfo.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "processor" => {
                    flush(std::mem::take(&mut record), &mut processors);
                    record.processor = Some(parse_number(key, value)?);
                }
                "vendor_id" => record.vendor = Vendor::from_vendor_id(value),
                "cpu family" => record.family = parse_number(key, value)?,
                "model" => record.model = parse_number(key, value)?,
                "model name" => record.model_name = value.to_owned(),
                "physical id" => record.physical_id = Some(parse_number(key, value)?),
                _ => (),
            }
        }
        flush(record, &mut processors);

        if processors.is_empty() {
            return Err(RaplError::FatalInit("no processor found in cpuinfo".to_owned()));
        }
        processors.sort_by_key(|p| p.physical_id);
        Ok(ProcessorTopology { processors })
    }

    /// Checks that every processor has a known vendor and a family recent enough
    /// for the register offsets that we use.
    pub fn check_supported(&self) -> Result<()> {
        for p in &self.processors {
            match p.vendor.min_family() {
                None => {
                    return Err(RaplError::FatalInit(format!(
                        "unsupported cpu vendor on socket {}",
                        p.physical_id
                    )))
                }
                Some(min) if p.family < min => {
                    return Err(RaplError::FatalInit(format!(
                        "{} cpu family {} on socket {} is not supported (minimum: {min})",
                        p.vendor, p.family, p.physical_id
                    )))
                }
                Some(_) => (),
            }
        }
        Ok(())
    }

    /// Assigns a package to each core with `lookup`.
    /// A core whose package is unknown is left out of the package set.
    pub fn resolve_packages(&mut self, lookup: impl Fn(u32) -> Option<PackageId>) {
        for processor in &mut self.processors {
            for core in &mut processor.cores {
                core.package = lookup(core.id);
                match core.package {
                    Some(pkg) => {
                        processor.packages.insert(pkg);
                    }
                    None => debug!("cpu {} has no known package, it will not be measured", core.id),
                }
            }
        }
    }

    /// All the resolved packages, in order.
    pub fn packages(&self) -> BTreeSet<PackageId> {
        self.processors.iter().flat_map(|p| p.packages.iter().copied()).collect()
    }

    /// All the cores that belong to a package, with the processor they're part of.
    pub fn cores(&self) -> impl Iterator<Item = (&Processor, Core)> + '_ {
        self.processors
            .iter()
            .flat_map(|p| p.cores.iter().filter(|c| c.package.is_some()).map(move |c| (p, *c)))
    }

    pub fn cores_of(&self, package: PackageId) -> impl Iterator<Item = Core> + '_ {
        self.cores()
            .map(|(_, c)| c)
            .filter(move |c| c.package == Some(package))
    }

    pub fn core(&self, cpu: u32) -> Option<Core> {
        self.cores().map(|(_, c)| c).find(|c| c.id == cpu)
    }

    pub fn processor_of(&self, package: PackageId) -> Option<&Processor> {
        self.processors.iter().find(|p| p.packages.contains(&package))
    }
}

fn parse_number(key: &str, value: &str) -> Result<u32> {
    value.parse().map_err(|e| {
        RaplError::FatalInit(format!("invalid value for '{}' in cpuinfo: '{value}' ({e})", key.trim()))
    })
}

fn read_package_id(paths: &Paths, cpu: u32) -> Option<PackageId> {
    let path = paths.package_id_file(cpu);
    match fs::read_to_string(&path) {
        Ok(content) => match content.trim().parse() {
            Ok(id) => Some(PackageId(id)),
            Err(e) => {
                warn!("invalid package id in {path:?}: '{}' ({e})", content.trim());
                None
            }
        },
        Err(e) => {
            debug!("cannot read {path:?}: {e}");
            None
        }
    }
}
