// See https://www.kernel.org/doc/html/latest/power/powercap/powercap.html
// for an explanation of the Power Capping framework.

use std::{
    fs,
    num::ParseIntError,
    path::{Path, PathBuf},
    sync::Arc,
};

use log::{debug, warn};
use regex::Regex;

use crate::{
    config::Paths,
    error::{RaplError, Result},
    sampler::{self, Sweep},
    topology::PackageId,
    Context, Measurement, RaplDomainType, Slot,
};

const POWERCAP_ENERGY_UNIT: f64 = 0.000_001; // 1 microJoules

/// Reads the RAPL counters exposed by the powercap framework, in
/// `/sys/class/powercap/intel-rapl/intel-rapl:<zone>[:<subzone>]/energy_uj`.
/// This requires no special permissions.
#[derive(Debug)]
pub struct PowercapReader {
    ctx: Arc<Context>,
    /// Matches the top-level zones, like `intel-rapl:0`
    zone_regex: Regex,
    /// Matches the sub-zones, like `intel-rapl:0:1`
    subzone_regex: Regex,
    /// Matches the zone names, like `package-0`, or `package-0-die-1` on multi-die packages
    package_regex: Regex,
}

/// The content of a zone directory.
#[derive(Debug)]
struct ZoneCounter {
    name: String,
    energy_uj: u64,
    max_energy_uj: Option<u64>,
}

impl ZoneCounter {
    fn read(dir: &Path) -> Result<ZoneCounter> {
        let name = read_trimmed(&dir.join("name"))?;
        let energy_path = dir.join("energy_uj");
        let energy_uj = parse_uj(&energy_path, &read_trimmed(&energy_path)?)?;

        // the range is only needed to correct overflows, don't fail without it
        let max_path = dir.join("max_energy_range_uj");
        let max_energy_uj = match read_trimmed(&max_path).and_then(|s| parse_uj(&max_path, &s)) {
            Ok(max) => Some(max),
            Err(e) => {
                debug!("no usable counter range for zone {name}: {e}");
                None
            }
        };
        Ok(ZoneCounter {
            name,
            energy_uj,
            max_energy_uj,
        })
    }

    fn joules(&self) -> f64 {
        self.energy_uj as f64 * POWERCAP_ENERGY_UNIT
    }

    fn range_joules(&self) -> Option<f64> {
        self.max_energy_uj.map(|max| max as f64 * POWERCAP_ENERGY_UNIT)
    }
}

impl PowercapReader {
    /// Checks that the first power zone exists.
    pub fn is_available(paths: &Paths) -> bool {
        paths.powercap_zone(0).exists()
    }

    pub fn new(ctx: Arc<Context>) -> PowercapReader {
        PowercapReader {
            ctx,
            zone_regex: Regex::new(r"^intel-rapl:(\d+)$").expect("valid regex"),
            subzone_regex: Regex::new(r"^intel-rapl:\d+:(\d+)$").expect("valid regex"),
            package_regex: Regex::new(r"^package-(\d+)(?:-die-(\d+))?$").expect("valid regex"),
        }
    }

    /// Returns the energy consumed during the configured interval.
    pub fn read(&self) -> Result<Measurement> {
        sampler::sample_delta(self.ctx.config.interval, || self.sweep())
    }

    /// Reads all the zones once.
    ///
    /// Fails if the powercap directory or a top-level zone cannot be read.
    /// A sub-zone that cannot be read is skipped.
    pub fn sweep(&self) -> Result<Sweep> {
        let mut sweep = Sweep::new();
        let mut psys: Option<ZoneCounter> = None;

        for zone_dir in subdirs(&self.ctx.config.paths.powercap, &self.zone_regex)? {
            let zone = ZoneCounter::read(&zone_dir)?;
            let (package, die) = match parse_package_zone(&self.package_regex, &zone.name) {
                Some(ids) => ids.map_err(|e| RaplError::decode(format!("name of zone {zone_dir:?}"), e))?,
                None if zone.name == "psys" => {
                    psys = Some(zone);
                    continue;
                }
                None => {
                    warn!("unknown RAPL powercap zone {} in {zone_dir:?}", zone.name);
                    continue;
                }
            };

            if !self.ctx.topology.packages().contains(&package) {
                warn!("powercap zone {} is not part of the detected topology", zone.name);
            }
            // the dies of a package are added together
            sweep.push_part(
                package,
                Slot::Package,
                RaplDomainType::Package,
                die,
                zone.joules(),
                zone.range_joules(),
            );
            self.sweep_subzones(&zone_dir, package, die, &mut sweep);
        }

        if let Some(zone) = psys {
            // psys is not tied to a socket, put it in the first package
            let package = self.ctx.topology.packages().into_iter().next().unwrap_or(PackageId(0));
            sweep.push(
                package,
                Slot::Package,
                RaplDomainType::Platform,
                zone.joules(),
                zone.range_joules(),
            );
        }
        Ok(sweep)
    }

    fn sweep_subzones(&self, zone_dir: &Path, package: PackageId, die: u32, sweep: &mut Sweep) {
        let dirs = match subdirs(zone_dir, &self.subzone_regex) {
            Ok(dirs) => dirs,
            Err(e) => {
                warn!("cannot list the sub-zones of {zone_dir:?}: {e}");
                return;
            }
        };
        for dir in dirs {
            let zone = match ZoneCounter::read(&dir) {
                Ok(z) => z,
                Err(e) => {
                    debug!("skipping sub-zone {dir:?}: {e}");
                    continue;
                }
            };
            let Some(domain) = parse_subzone_name(&zone.name) else {
                debug!("skipping sub-zone {dir:?} with unknown name {}", zone.name);
                continue;
            };
            sweep.push_part(package, Slot::Package, domain, die, zone.joules(), zone.range_joules());
        }
    }
}

/// Parses `package-<id>` or `package-<id>-die-<die>` into `(package, die)`.
/// Returns `None` if the zone is not a package.
fn parse_package_zone(regex: &Regex, name: &str) -> Option<Result<(PackageId, u32), ParseIntError>> {
    let ids = regex.captures(name)?;
    let package = ids[1].parse::<u32>();
    let die = ids.get(2).map_or(Ok(0), |d| d.as_str().parse::<u32>());
    Some(package.and_then(|p| die.map(|d| (PackageId(p), d))))
}

/// Case-sensitive, like the names written by the kernel.
fn parse_subzone_name(name: &str) -> Option<RaplDomainType> {
    match name {
        "core" => Some(RaplDomainType::PP0),
        "uncore" => Some(RaplDomainType::PP1),
        "dram" => Some(RaplDomainType::Dram),
        _ => None,
    }
}

/// Lists the subdirectories of `dir` whose name matches `pattern`, in order.
fn subdirs(dir: &Path, pattern: &Regex) -> Result<Vec<PathBuf>> {
    let mut res = Vec::new();
    for e in fs::read_dir(dir).map_err(|e| RaplError::io(dir, e))? {
        let path = e.map_err(|e| RaplError::io(dir, e))?.path();
        let matches = path
            .file_name()
            .map(|n| pattern.is_match(&n.to_string_lossy()))
            .unwrap_or(false);
        if matches && path.is_dir() {
            res.push(path);
        }
    }
    res.sort();
    Ok(res)
}

fn read_trimmed(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .map(|s| s.trim().to_owned())
        .map_err(|e| RaplError::io(path, e))
}

fn parse_uj(path: &Path, content: &str) -> Result<u64> {
    content
        .parse()
        .map_err(|e| RaplError::decode(format!("{path:?}"), format!("'{content}': {e}")))
}
