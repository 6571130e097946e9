use std::{
    fs::{self, File},
    os::unix::prelude::FileExt,
    path::Path,
    sync::Arc,
    time::Duration,
};

use rapl_readers::{
    config::{Config, Paths},
    msr::{self, MsrReader},
    perf_event,
    powercap::PowercapReader,
    reader::{new_reader, Strategy},
    sampler::wrapping_delta,
    topology::PackageId,
    Context, RaplDomainType, RaplError, Slot,
};

const PKG0: PackageId = PackageId(0);
const PKG1: PackageId = PackageId(1);

const INTEL_CPUINFO: &str = "\
processor	: 0
vendor_id	: GenuineIntel
cpu family	: 6
model		: 142
model name	: Intel(R) Core(TM) i7-8650U CPU @ 1.90GHz
physical id	: 0

processor	: 1
vendor_id	: GenuineIntel
cpu family	: 6
model		: 142
model name	: Intel(R) Core(TM) i7-8650U CPU @ 1.90GHz
physical id	: 0
";

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn write(path: &Path, content: &str) -> anyhow::Result<()> {
    fs::create_dir_all(path.parent().unwrap())?;
    fs::write(path, content)?;
    Ok(())
}

/// Writes a cpuinfo file and the package id of each given cpu.
fn fake_machine(root: &Path, cpuinfo: &str, package_ids: &[(u32, u32)]) -> anyhow::Result<Config> {
    let paths = Paths::with_root(root);
    write(&paths.cpuinfo, cpuinfo)?;
    for (cpu, package) in package_ids {
        write(&paths.package_id_file(*cpu), &format!("{package}\n"))?;
    }
    Ok(Config {
        paths,
        interval: Duration::from_millis(1),
    })
}

fn write_zone(dir: &Path, name: &str, energy_uj: Option<u64>, max_uj: Option<u64>) -> anyhow::Result<()> {
    write(&dir.join("name"), &format!("{name}\n"))?;
    if let Some(e) = energy_uj {
        write(&dir.join("energy_uj"), &format!("{e}\n"))?;
    }
    if let Some(m) = max_uj {
        write(&dir.join("max_energy_range_uj"), &format!("{m}\n"))?;
    }
    Ok(())
}

#[test]
fn detect_topology() -> anyhow::Result<()> {
    init_logger();
    let root = tempfile::tempdir()?;
    let config = fake_machine(root.path(), INTEL_CPUINFO, &[(0, 0), (1, 0)])?;

    let ctx = Context::detect(config)?;
    let topology = &ctx.topology;
    assert_eq!(topology.processors.len(), 1);
    assert_eq!(topology.packages().into_iter().collect::<Vec<_>>(), vec![PKG0]);
    assert_eq!(topology.cores_of(PKG0).map(|c| c.id).collect::<Vec<_>>(), vec![0, 1]);

    let processor = &topology.processors[0];
    assert_eq!(processor.family, 6);
    assert_eq!(processor.model.id, 142);
    assert_eq!(processor.model.codename, "KabyLake-mobile");
    Ok(())
}

#[test]
fn missing_package_descriptor_excludes_the_core() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let config = fake_machine(root.path(), INTEL_CPUINFO, &[(0, 0)])?;

    let ctx = Context::detect(config)?;
    assert!(ctx.topology.core(0).is_some());
    assert!(ctx.topology.core(1).is_none());
    assert_eq!(ctx.topology.cores_of(PKG0).count(), 1);
    // the processor still lists it, without a package
    assert_eq!(ctx.topology.processors[0].cores.len(), 2);
    Ok(())
}

#[test]
fn old_amd_family_is_fatal() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let cpuinfo = "\
processor	: 0
vendor_id	: AuthenticAMD
cpu family	: 21
model		: 2
model name	: AMD FX(tm)-8350 Eight-Core Processor
physical id	: 0
";
    let config = fake_machine(root.path(), cpuinfo, &[(0, 0)])?;
    let res = Context::detect(config);
    assert!(matches!(res, Err(RaplError::FatalInit(_))), "{res:?}");
    Ok(())
}

#[test]
fn missing_cpuinfo_is_fatal() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let config = Config {
        paths: Paths::with_root(root.path()),
        ..Config::default()
    };
    let res = Context::detect(config);
    assert!(matches!(res, Err(RaplError::FatalInit(_))), "{res:?}");
    Ok(())
}

#[test]
fn powercap_sweep() -> anyhow::Result<()> {
    init_logger();
    let root = tempfile::tempdir()?;
    let config = fake_machine(root.path(), INTEL_CPUINFO, &[(0, 0), (1, 0)])?;
    let pkg = config.paths.powercap_zone(0);
    write_zone(&pkg, "package-0", Some(1_500_000), Some(262_143_328_850))?;
    write_zone(&pkg.join("intel-rapl:0:0"), "core", Some(400_000), None)?;
    // no energy_uj: the dram value is absent, the rest is still read
    write_zone(&pkg.join("intel-rapl:0:1"), "dram", None, None)?;
    write_zone(&config.paths.powercap_zone(1), "psys", Some(2_000_000), None)?;

    let ctx = Arc::new(Context::detect(config)?);
    let reader = PowercapReader::new(ctx);
    let sweep = reader.sweep()?;

    let values = sweep.values();
    let energy = values.get(PKG0, Slot::Package).unwrap();
    assert_eq!(energy.get(RaplDomainType::Package), Some(1.5));
    assert_eq!(energy.get(RaplDomainType::PP0), Some(400_000.0 * 1e-6));
    assert_eq!(energy.get(RaplDomainType::Dram), None);
    assert_eq!(energy.get(RaplDomainType::Platform), Some(2.0));
    assert_eq!(sweep.range((PKG0, Slot::Package, RaplDomainType::Package, 0)), Some(262_143.328_85));
    assert_eq!(sweep.range((PKG0, Slot::Package, RaplDomainType::PP0, 0)), None);

    // the counters don't move, every delta is zero
    let measurement = reader.read()?;
    let delta = measurement.get(PKG0, Slot::Package).unwrap();
    assert_eq!(delta.get(RaplDomainType::Package), Some(0.0));
    assert_eq!(delta.get(RaplDomainType::PP0), Some(0.0));
    assert_eq!(delta.get(RaplDomainType::Dram), None);
    Ok(())
}

#[test]
fn powercap_two_packages() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let cpuinfo = format!(
        "{INTEL_CPUINFO}\nprocessor	: 2\nvendor_id	: GenuineIntel\ncpu family	: 6\nmodel		: 85\nmodel name	: Xeon\nphysical id	: 1\n"
    );
    let config = fake_machine(root.path(), &cpuinfo, &[(0, 0), (1, 0), (2, 1)])?;
    write_zone(&config.paths.powercap_zone(0), "package-0", Some(1_000_000), None)?;
    write_zone(&config.paths.powercap_zone(1), "package-1", Some(2_000_000), None)?;

    let ctx = Arc::new(Context::detect(config)?);
    assert_eq!(ctx.topology.processors.len(), 2);

    let values = PowercapReader::new(ctx).sweep()?.values();
    assert_eq!(
        values.get(PKG1, Slot::Package).and_then(|e| e.get(RaplDomainType::Package)),
        Some(2.0)
    );
    assert_eq!(values.per_package.len(), 2);
    Ok(())
}

#[test]
fn powercap_multi_die_package() -> anyhow::Result<()> {
    init_logger();
    let root = tempfile::tempdir()?;
    let config = fake_machine(root.path(), INTEL_CPUINFO, &[(0, 0), (1, 0)])?;
    let die0 = config.paths.powercap_zone(0);
    let die1 = config.paths.powercap_zone(1);
    let range = Some(10_000_000);
    write_zone(&die0, "package-0-die-0", Some(1_000_000), range)?;
    write_zone(&die0.join("intel-rapl:0:0"), "dram", Some(250_000), None)?;
    write_zone(&die1, "package-0-die-1", Some(9_500_000), range)?;
    write_zone(&die1.join("intel-rapl:1:0"), "dram", Some(500_000), None)?;

    let ctx = Arc::new(Context::detect(config)?);
    let reader = PowercapReader::new(ctx);
    let before = reader.sweep()?;

    let values = before.values();
    assert_eq!(values.per_package.len(), 1);
    let energy = values.get(PKG0, Slot::Package).unwrap();
    assert_eq!(energy.get(RaplDomainType::Package), Some(10.5));
    assert_eq!(energy.get(RaplDomainType::Dram), Some(0.75));

    // die 0 consumes 2 J, die 1 consumes 1 J and wraps around
    write_zone(&die0, "package-0-die-0", Some(3_000_000), range)?;
    write_zone(&die1, "package-0-die-1", Some(500_000), range)?;
    let after = reader.sweep()?;

    let delta = wrapping_delta(&before, &after);
    let energy = delta.get(PKG0, Slot::Package).unwrap();
    assert_eq!(energy.get(RaplDomainType::Package), Some(3.0));
    assert_eq!(energy.get(RaplDomainType::Dram), Some(0.0));
    Ok(())
}

#[test]
fn fallback_to_available_strategy() -> anyhow::Result<()> {
    init_logger();
    let root = tempfile::tempdir()?;
    let config = fake_machine(root.path(), INTEL_CPUINFO, &[(0, 0), (1, 0)])?;
    write(&config.paths.perf_event_type(), "19\n")?;

    let ctx = Arc::new(Context::detect(config)?);
    let reader = new_reader(Strategy::Powercap, ctx.clone())?;
    assert_eq!(reader.strategy(), Strategy::PerfEvent);

    write_zone(&ctx.config.paths.powercap_zone(0), "package-0", Some(1), None)?;
    let reader = new_reader(Strategy::Msr, ctx)?;
    assert_eq!(reader.strategy(), Strategy::Powercap);
    Ok(())
}

#[test]
fn no_strategy_available() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let config = fake_machine(root.path(), INTEL_CPUINFO, &[(0, 0)])?;
    let ctx = Arc::new(Context::detect(config)?);

    let res = new_reader(Strategy::FirstAvailable, ctx);
    assert!(matches!(res, Err(RaplError::NoStrategyAvailable)), "{res:?}");
    Ok(())
}

#[test]
fn perf_event_discovery() -> anyhow::Result<()> {
    init_logger();
    let root = tempfile::tempdir()?;
    let paths = Paths::with_root(root.path());
    let events = paths.perf_event_events();
    write(&paths.perf_event_type(), "19\n")?;
    write(&events.join("energy-cores"), "event=0x01\n")?;
    write(&events.join("energy-cores.scale"), "2.3283064365386962890625e-10\n")?;
    write(&events.join("energy-cores.unit"), "Joules\n")?;
    write(&events.join("energy-pkg"), "event=0x02\n")?;
    write(&events.join("energy-pkg.scale"), "not a number\n")?;
    write(&events.join("energy-ram"), "garbage\n")?;
    write(&events.join("energy-ram.scale"), "2.3283064365386962890625e-10\n")?;

    assert_eq!(perf_event::pmu_type(&paths)?, 19);

    let all = perf_event::all_power_events(&paths)?;
    assert_eq!(all.len(), 3);

    let cores = &all[&RaplDomainType::PP0];
    assert_eq!(cores.config, Some(1));
    assert_eq!(cores.scale, Some(2.3283064365386962890625e-10));
    assert_eq!(cores.unit, "Joules");
    assert!(cores.is_usable());

    let pkg = &all[&RaplDomainType::Package];
    assert_eq!(pkg.config, Some(2));
    assert_eq!(pkg.scale, None);
    assert!(!pkg.is_usable());

    let ram = &all[&RaplDomainType::Dram];
    assert_eq!(ram.config, None);
    assert!(!ram.is_usable());
    assert!(!all.contains_key(&RaplDomainType::PP1));
    Ok(())
}

#[test]
fn perf_event_cpus_to_monitor() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let config = fake_machine(root.path(), INTEL_CPUINFO, &[(0, 0), (1, 0)])?;
    let ctx = Context::detect(config)?;
    let paths = &ctx.config.paths;

    // no cpumask: first cpu of each package
    assert_eq!(perf_event::cpus_to_monitor(paths, &ctx.topology), vec![(PKG0, 0)]);

    // cpus that are not in the topology are ignored
    write(&paths.perf_event_cpumask(), "1,8\n")?;
    assert_eq!(perf_event::cpus_to_monitor(paths, &ctx.topology), vec![(PKG0, 1)]);

    // one cpu per die: both are kept, their counts are added to the same package
    write(&paths.perf_event_cpumask(), "0,1\n")?;
    assert_eq!(
        perf_event::cpus_to_monitor(paths, &ctx.topology),
        vec![(PKG0, 0), (PKG0, 1)]
    );
    Ok(())
}

/// Creates a fake MSR device of `len` bytes, with some registers set.
fn fake_msr_device(path: &Path, len: u64, registers: &[(u64, u64)]) -> anyhow::Result<()> {
    fs::create_dir_all(path.parent().unwrap())?;
    let file = File::create(path)?;
    file.set_len(len)?;
    for (addr, value) in registers {
        file.write_all_at(&value.to_ne_bytes(), *addr)?;
    }
    Ok(())
}

#[test]
fn msr_sweep() -> anyhow::Result<()> {
    init_logger();
    let root = tempfile::tempdir()?;
    let config = fake_machine(root.path(), INTEL_CPUINFO, &[(0, 0), (1, 0)])?;
    // energy unit: 1/2^14 J
    let units = 0x000A_0E03;
    // too short for the psys register, which is then absent
    fake_msr_device(
        &config.paths.msr_device(0),
        msr::intel::MSR_PLATFORM_ENERGY_STATUS + 4,
        &[
            (msr::intel::MSR_RAPL_POWER_UNIT, units),
            (msr::intel::MSR_PKG_ENERGY_STATUS, 16384 * 3),
            // the reserved upper bits are ignored
            (msr::intel::MSR_PP0_ENERGY_STATUS, (1 << 40) | 8192),
        ],
    )?;
    // no device for cpu 1: the Intel counters are package-wide, only cpu 0 is read

    let ctx = Arc::new(Context::detect(config)?);
    let reader = MsrReader::new(ctx)?;
    assert_eq!(reader.units(0).map(|u| u.cpu_energy), Some(0.5_f64.powi(14)));
    assert_eq!(reader.units(0).map(|u| u.power), Some(0.125));
    assert_eq!(reader.units(1), None);

    let sweep = reader.sweep()?;
    let values = sweep.values();
    let pkg = values.get(PKG0, Slot::Package).unwrap();
    assert_eq!(pkg.get(RaplDomainType::Package), Some(3.0));
    assert_eq!(pkg.get(RaplDomainType::PP0), Some(0.5));
    assert_eq!(pkg.get(RaplDomainType::Dram), Some(0.0));
    assert_eq!(pkg.get(RaplDomainType::Platform), None);
    assert_eq!(values.per_package[&PKG0].len(), 1);

    // range of a 32-bit counter
    let range = sweep.range((PKG0, Slot::Package, RaplDomainType::Package, 0));
    assert_eq!(range, Some(4294967296.0 * 0.5_f64.powi(14)));

    let total = reader.read()?.total();
    assert_eq!(total[&PKG0].get(RaplDomainType::Package), Some(0.0));
    Ok(())
}

#[test]
fn msr_package_total_counts_each_counter_once() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let config = fake_machine(root.path(), INTEL_CPUINFO, &[(0, 0), (1, 0)])?;
    let units = 0x000A_0E03;
    let write_devices = |pkg_joules: u64| -> anyhow::Result<()> {
        for cpu in [0, 1] {
            fake_msr_device(
                &config.paths.msr_device(cpu),
                0x700,
                &[
                    (msr::intel::MSR_RAPL_POWER_UNIT, units),
                    (msr::intel::MSR_PKG_ENERGY_STATUS, 16384 * pkg_joules),
                ],
            )?;
        }
        Ok(())
    };

    write_devices(3)?;
    let ctx = Arc::new(Context::detect(config.clone())?);
    let reader = MsrReader::new(ctx)?;
    let before = reader.sweep()?;
    write_devices(5)?;
    let after = reader.sweep()?;

    let total = wrapping_delta(&before, &after).total();
    assert_eq!(total[&PKG0].get(RaplDomainType::Package), Some(2.0));
    Ok(())
}

const AMD_CPUINFO: &str = "\
processor	: 0
vendor_id	: AuthenticAMD
cpu family	: 23
model		: 113
model name	: AMD Ryzen 7 3700X 8-Core Processor
physical id	: 0

processor	: 1
vendor_id	: AuthenticAMD
cpu family	: 23
model		: 113
model name	: AMD Ryzen 7 3700X 8-Core Processor
physical id	: 0
";

#[test]
fn msr_amd() -> anyhow::Result<()> {
    init_logger();
    let root = tempfile::tempdir()?;
    let config = fake_machine(root.path(), AMD_CPUINFO, &[(0, 0), (1, 0)])?;
    // energy unit: 1/2^16 J
    let units = 0x000A_1003;
    // sparse files that reach the AMD registers
    let len = msr::amd::MSR_PKG_ENERGY_STATUS + 8;
    fake_msr_device(
        &config.paths.msr_device(0),
        len,
        &[
            (msr::amd::MSR_RAPL_POWER_UNIT, units),
            (msr::amd::MSR_PKG_ENERGY_STATUS, 65536 * 2),
            (msr::amd::MSR_CORE_ENERGY_STATUS, 65536),
        ],
    )?;
    fake_msr_device(
        &config.paths.msr_device(1),
        len,
        &[
            (msr::amd::MSR_RAPL_POWER_UNIT, units),
            (msr::amd::MSR_PKG_ENERGY_STATUS, 65536 * 2),
            (msr::amd::MSR_CORE_ENERGY_STATUS, 32768),
        ],
    )?;

    let ctx = Arc::new(Context::detect(config)?);
    let reader = MsrReader::new(ctx)?;
    assert_eq!(reader.units(1).map(|u| u.cpu_energy), Some(0.5_f64.powi(16)));

    let values = reader.sweep()?.values();
    let pkg = values.get(PKG0, Slot::Package).unwrap();
    assert_eq!(pkg.get(RaplDomainType::Package), Some(2.0));
    assert_eq!(pkg.get(RaplDomainType::PP0), None);
    assert_eq!(
        values.get(PKG0, Slot::Core(0)).and_then(|e| e.get(RaplDomainType::PP0)),
        Some(1.0)
    );
    assert_eq!(
        values.get(PKG0, Slot::Core(1)).and_then(|e| e.get(RaplDomainType::PP0)),
        Some(0.5)
    );

    let total = values.total();
    let total = &total[&PKG0];
    assert_eq!(total.get(RaplDomainType::Package), Some(2.0));
    assert_eq!(total.get(RaplDomainType::PP0), Some(1.5));
    for domain in [RaplDomainType::PP1, RaplDomainType::Dram, RaplDomainType::Platform] {
        assert_eq!(total.get(domain), None, "{domain} should be absent");
    }
    Ok(())
}

#[test]
fn msr_missing_device() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let config = fake_machine(root.path(), INTEL_CPUINFO, &[(0, 0)])?;
    let ctx = Arc::new(Context::detect(config)?);

    let res = MsrReader::new(ctx);
    match res {
        Err(e) => assert!(e.is_not_found(), "{e}"),
        Ok(r) => panic!("unexpected reader {r:?}"),
    }
    Ok(())
}
