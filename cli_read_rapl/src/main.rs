use std::{sync::Arc, time::Duration};

use anyhow::Context as _;
use clap::Parser;
use log::{info, warn};

use cli::Cli;
use rapl_readers::{
    config::Config,
    perf_event,
    reader::{self, RaplReader, Strategy},
    Context, Measurement, Slot,
};

mod cli;

fn main() -> Result<(), anyhow::Error> {
    // initialize logger
    let env = env_logger::Env::default().default_filter_or("info");
    env_logger::init_from_env(env);

    // parse CLI arguments
    let cli = Cli::parse();
    if cli.interval == 0 {
        anyhow::bail!("the interval must be positive");
    }
    let config = Config {
        interval: Duration::from_millis(cli.interval),
        ..Config::default()
    };

    // get cpu info, once for the whole session
    let ctx = Arc::new(Context::detect(config).context("cannot detect the cpu topology")?);
    for processor in &ctx.topology.processors {
        info!("{processor}");
    }

    if cli.info {
        print_info(&ctx);
        return Ok(());
    }

    let reader = reader::new_reader(cli.strategy, ctx)?;
    if let RaplReader::PerfEvent(r) = &reader {
        let names: Vec<&str> = r.events().iter().map(|e| e.name.as_str()).collect();
        info!("measured power events: {}", names.join(", "));
    }
    for i in 0..cli.count {
        let measurement = reader
            .read()
            .with_context(|| format!("measurement {i} failed with strategy {}", reader.strategy()))?;
        print_measurement(&measurement);
    }
    Ok(())
}

fn print_info(ctx: &Context) {
    let paths = &ctx.config.paths;

    println!("Packages:");
    for package in ctx.topology.packages() {
        let cpus: Vec<String> = ctx.topology.cores_of(package).map(|c| c.id.to_string()).collect();
        println!("- package {package}: cpus {}", cpus.join(","));
    }

    println!("\nAvailable strategies:");
    for s in Strategy::PRIORITY {
        println!("- {s}: {}", if s.is_available(paths) { "yes" } else { "no" });
    }

    if Strategy::PerfEvent.is_available(paths) {
        println!("\nFound RAPL perf events:");
        match perf_event::all_power_events(paths) {
            Ok(events) => {
                for evt in events.values() {
                    println!("- {evt:?}");
                }
            }
            Err(e) => warn!("cannot list the perf events: {e}"),
        }
    }
}

fn print_measurement(m: &Measurement) {
    let kwh = m.to_kilowatt_hours();
    for (package, slots) in &m.per_package {
        for (slot, energy) in slots {
            println!("package {package} {slot}: {energy}");
            if let Some(power) = kwh.get(package).and_then(|s| s.get(slot)) {
                for (domain, value) in power.domains() {
                    println!("    {domain}: {value:.9} kWh");
                }
            }
        }
    }
    for (package, energy) in m.total() {
        if m.per_package[&package].keys().any(|s| *s != Slot::Package) {
            println!("package {package} all slots: {energy}");
        }
    }
}
