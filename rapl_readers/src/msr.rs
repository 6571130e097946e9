// According to Intel 64 and IA-32 architectures software developer's manual, volume 3B,
// MSR_PKG_ENERGY_STATUS reports the measured energy usage of the package.
// The AMD registers are described in the PPR of family 17h (Zen).

use std::{
    collections::BTreeSet,
    fs::File,
    os::unix::prelude::FileExt,
    path::PathBuf,
    sync::Arc,
};

use log::{debug, trace, warn};

use crate::{
    config::Paths,
    error::{RaplError, Result},
    sampler::{self, Sweep},
    topology::{ByteOrder, Core, PackageId, Vendor},
    Context, Measurement, RaplDomainType, Slot,
};

type Addr = u64;

/// MSR registers' addresses for Intel RAPL domains
pub mod intel {
    use super::Addr;

    pub const MSR_RAPL_POWER_UNIT: Addr = 0x00000606;
    pub const MSR_PKG_ENERGY_STATUS: Addr = 0x00000611;
    pub const MSR_PP0_ENERGY_STATUS: Addr = 0x00000639;
    pub const MSR_PP1_ENERGY_STATUS: Addr = 0x00000641;
    pub const MSR_DRAM_ENERGY_STATUS: Addr = 0x00000619;
    pub const MSR_PLATFORM_ENERGY_STATUS: Addr = 0x0000064D;
}

/// MSR registers' addresses for AMD RAPL domains.
/// There is no uncore, DRAM nor platform counter.
pub mod amd {
    use super::Addr;

    pub const MSR_RAPL_POWER_UNIT: Addr = 0xc0010299;
    pub const MSR_CORE_ENERGY_STATUS: Addr = 0xc001029a;
    pub const MSR_PKG_ENERGY_STATUS: Addr = 0xc001029b;
}

/// The energy status counters are in bits 31:0, the upper bits are reserved.
const MSR_ENERGY_MASK: u64 = 0xffff_ffff;

/// Number of distinct values of the energy status counters (2^32).
const MSR_COUNTER_RANGE: f64 = (MSR_ENERGY_MASK as f64) + 1.0;

pub fn power_unit_address(vendor: Vendor) -> Option<Addr> {
    match vendor {
        Vendor::Intel => Some(intel::MSR_RAPL_POWER_UNIT),
        Vendor::Amd => Some(amd::MSR_RAPL_POWER_UNIT),
        Vendor::Unknown => None,
    }
}

pub fn domain_msr_address(domain: RaplDomainType, vendor: Vendor) -> Option<Addr> {
    match vendor {
        Vendor::Intel => match domain {
            RaplDomainType::Package => Some(intel::MSR_PKG_ENERGY_STATUS),
            RaplDomainType::PP0 => Some(intel::MSR_PP0_ENERGY_STATUS),
            RaplDomainType::PP1 => Some(intel::MSR_PP1_ENERGY_STATUS),
            RaplDomainType::Dram => Some(intel::MSR_DRAM_ENERGY_STATUS),
            RaplDomainType::Platform => Some(intel::MSR_PLATFORM_ENERGY_STATUS),
        },
        Vendor::Amd => match domain {
            RaplDomainType::Package => Some(amd::MSR_PKG_ENERGY_STATUS),
            RaplDomainType::PP0 => Some(amd::MSR_CORE_ENERGY_STATUS),
            RaplDomainType::PP1 => None,
            RaplDomainType::Dram => None,
            RaplDomainType::Platform => None,
        },
        Vendor::Unknown => None,
    }
}

/// The domains that have a register on this vendor, with the address of the register.
pub fn domain_addresses(vendor: Vendor) -> Vec<(RaplDomainType, Addr)> {
    RaplDomainType::ALL
        .into_iter()
        .filter_map(|d| domain_msr_address(d, vendor).map(|addr| (d, addr)))
        .collect()
}

/// `true` if each core has its own counter for this domain.
/// The other counters are shared by all the cores of a package.
pub fn is_per_core(domain: RaplDomainType, vendor: Vendor) -> bool {
    matches!((vendor, domain), (Vendor::Amd, RaplDomainType::PP0))
}

/// Power unit exponent: bits 3:0 of the power unit register.
pub fn power_unit_exponent(msr_value: u64) -> u32 {
    (msr_value & 0xF) as u32
}

/// Energy status unit exponent: bits 12:8 of the power unit register (mask 0x1F00).
pub fn energy_unit_exponent(msr_value: u64) -> u32 {
    ((msr_value & 0x1F00) >> 8) as u32
}

/// DRAM energy unit exponent. Same bits as [`energy_unit_exponent`]: the hardware we
/// support reports a single energy unit.
pub fn dram_energy_unit_exponent(msr_value: u64) -> u32 {
    energy_unit_exponent(msr_value)
}

/// Time unit exponent: bits 19:16 of the power unit register.
pub fn time_unit_exponent(msr_value: u64) -> u32 {
    ((msr_value & 0xF_0000) >> 16) as u32
}

/// The unit, aka "multiplier", is 1/(2^exponent) = (1/2)^exponent
pub fn unit_from_exponent(exponent: u32) -> f64 {
    0.5_f64.powi(exponent as i32)
}

/// Units of the RAPL registers. A raw value multiplied by its unit gives Watts, seconds or Joules.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Units {
    pub power: f64,
    pub time: f64,
    pub cpu_energy: f64,
    pub dram_energy: f64,
}

impl Units {
    /// Decodes the content of the power unit register.
    ///
    /// See [Linux source code - rapl.c](https://github.com/torvalds/linux/blob/0036fb00a756a2f6e360d44e2e3d2200a8afbc9b/arch/x86/events/rapl.c#L612)
    pub fn from_register(msr_value: u64) -> Units {
        Units {
            power: unit_from_exponent(power_unit_exponent(msr_value)),
            time: unit_from_exponent(time_unit_exponent(msr_value)),
            cpu_energy: unit_from_exponent(energy_unit_exponent(msr_value)),
            dram_energy: unit_from_exponent(dram_energy_unit_exponent(msr_value)),
        }
    }

    pub fn energy_unit(&self, domain: RaplDomainType) -> f64 {
        match domain {
            RaplDomainType::Dram => self.dram_energy,
            _ => self.cpu_energy,
        }
    }
}

/// An open MSR device file. The file is closed when the device is dropped.
struct MsrDevice {
    file: File,
    path: PathBuf,
}

impl MsrDevice {
    fn open(path: PathBuf) -> Result<MsrDevice> {
        let file = File::open(&path).map_err(|e| RaplError::io(&path, e))?;
        Ok(MsrDevice { file, path })
    }

    /// Reads the 8 bytes of the register at `addr`.
    fn read(&self, addr: Addr, byte_order: ByteOrder) -> Result<u64> {
        let mut buf = [0u8; 8];
        let n = self.file.read_at(&mut buf, addr).map_err(|e| RaplError::io(&self.path, e))?;
        decode_register(&buf[..n], byte_order)
            .map_err(|reason| RaplError::decode(format!("MSR {addr:#x} of {:?}", self.path), reason))
    }
}

impl Drop for MsrDevice {
    fn drop(&mut self) {
        trace!("closing {:?}", self.path);
    }
}

/// Interprets the bytes of a register, which must be exactly 8 bytes long.
fn decode_register(bytes: &[u8], byte_order: ByteOrder) -> std::result::Result<u64, String> {
    let bytes: [u8; 8] = bytes
        .try_into()
        .map_err(|_| format!("expected 8 bytes, got {}", bytes.len()))?;
    Ok(byte_order.read_u64(bytes))
}

#[derive(Debug)]
struct CoreRegisters {
    cpu: u32,
    package: PackageId,
    vendor: Vendor,
    byte_order: ByteOrder,
    units: Units,
    /// The registers to read on this cpu, and where to put their values.
    domains: Vec<(RaplDomainType, Addr, Slot)>,
}

/// Reads the RAPL MSR values via `/dev/cpu/<cpu_id>/msr`, for every cpu. This requires root.
#[derive(Debug)]
pub struct MsrReader {
    ctx: Arc<Context>,
    /// Computed once in [`MsrReader::new`], never modified afterwards.
    cores: Vec<CoreRegisters>,
}

impl MsrReader {
    /// Checks that the MSR device of the first cpu exists.
    pub fn is_available(paths: &Paths) -> bool {
        paths.msr_device(0).exists()
    }

    /// Chooses the registers to read on each cpu, and reads their units.
    ///
    /// The package-wide registers are read on the first cpu of each package only,
    /// the per-core registers on every cpu that belongs to a package.
    pub fn new(ctx: Arc<Context>) -> Result<MsrReader> {
        let mut cores = Vec::new();
        let mut seen_packages = BTreeSet::new();
        for (processor, core) in ctx.topology.cores() {
            let Core { id: cpu, package } = core;
            let Some(package) = package else { continue };
            let vendor = processor.vendor;
            let addr = power_unit_address(vendor)
                .ok_or_else(|| RaplError::FatalInit(format!("no RAPL registers for vendor {vendor}")))?;

            let first_of_package = seen_packages.insert(package);
            let domains: Vec<_> = domain_addresses(vendor)
                .into_iter()
                .filter_map(|(d, addr)| {
                    if is_per_core(d, vendor) {
                        Some((d, addr, Slot::Core(cpu)))
                    } else if first_of_package {
                        Some((d, addr, Slot::Package))
                    } else {
                        None
                    }
                })
                .collect();
            if domains.is_empty() {
                continue;
            }

            let device = MsrDevice::open(ctx.config.paths.msr_device(cpu))?;
            let units = Units::from_register(device.read(addr, processor.byte_order)?);
            debug!("units of cpu {cpu}: {units:?}");

            cores.push(CoreRegisters {
                cpu,
                package,
                vendor,
                byte_order: processor.byte_order,
                units,
                domains,
            });
        }
        Ok(MsrReader { ctx, cores })
    }

    /// Returns the energy consumed during the configured interval.
    /// Package-wide values are in [`Slot::Package`], per-core values in [`Slot::Core`].
    pub fn read(&self) -> Result<Measurement> {
        sampler::sample_delta(self.ctx.config.interval, || self.sweep())
    }

    /// Reads the chosen energy registers once.
    ///
    /// Fails if a device cannot be opened. A register that cannot be read is skipped.
    pub fn sweep(&self) -> Result<Sweep> {
        let mut sweep = Sweep::new();
        for core in &self.cores {
            let device = MsrDevice::open(self.ctx.config.paths.msr_device(core.cpu))?;
            read_core(&device, core, &mut sweep);
        }
        Ok(sweep)
    }

    /// The units of a cpu, `None` if no register is read on this cpu.
    pub fn units(&self, cpu: u32) -> Option<Units> {
        self.cores.iter().find(|c| c.cpu == cpu).map(|c| c.units)
    }
}

fn read_core(device: &MsrDevice, core: &CoreRegisters, sweep: &mut Sweep) {
    for (domain, addr, slot) in &core.domains {
        match device.read(*addr, core.byte_order) {
            Ok(msr_value) => {
                let counter = msr_value & MSR_ENERGY_MASK;
                let unit = core.units.energy_unit(*domain);
                sweep.push(
                    core.package,
                    *slot,
                    *domain,
                    counter as f64 * unit,
                    Some(MSR_COUNTER_RANGE * unit),
                );
            }
            Err(e @ RaplError::Decode { .. }) => warn!("{e}"),
            // unsupported registers (e.g. psys on old cpus) fail with EIO
            Err(e) => debug!("{} cpu {}, domain {domain}: {e}", core.vendor, core.cpu),
        }
    }
}
