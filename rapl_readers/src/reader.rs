use std::{fmt, sync::Arc};

use clap::ValueEnum;
use log::{info, warn};

use crate::{
    config::Paths,
    error::{RaplError, Result},
    msr::MsrReader,
    perf_event::PerfEventReader,
    powercap::PowercapReader,
    Context, Measurement,
};

/// How to access the RAPL counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum Strategy {
    /// The first available strategy, in order: powercap, perf-event, msr.
    #[default]
    FirstAvailable,
    /// Powercap sysfs files.
    Powercap,
    /// The RAPL PMU of perf_event.
    PerfEvent,
    /// Raw Model Specific Registers.
    Msr,
}

impl Strategy {
    /// Fallback order, when the preferred strategy is not available.
    pub const PRIORITY: [Strategy; 3] = [Strategy::Powercap, Strategy::PerfEvent, Strategy::Msr];

    /// Checks whether this strategy can be used, without side effects.
    pub fn is_available(self, paths: &Paths) -> bool {
        match self {
            Strategy::FirstAvailable => Strategy::PRIORITY.iter().any(|s| s.is_available(paths)),
            Strategy::Powercap => PowercapReader::is_available(paths),
            Strategy::PerfEvent => PerfEventReader::is_available(paths),
            Strategy::Msr => MsrReader::is_available(paths),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let str = match self {
            Strategy::FirstAvailable => "first-available",
            Strategy::Powercap => "powercap",
            Strategy::PerfEvent => "perf-event",
            Strategy::Msr => "msr",
        };
        f.write_str(str)
    }
}

/// A reader of RAPL energy counters, bound to one strategy for its whole life.
#[derive(Debug)]
pub enum RaplReader {
    Powercap(PowercapReader),
    PerfEvent(PerfEventReader),
    Msr(MsrReader),
}

impl RaplReader {
    pub fn strategy(&self) -> Strategy {
        match self {
            RaplReader::Powercap(_) => Strategy::Powercap,
            RaplReader::PerfEvent(_) => Strategy::PerfEvent,
            RaplReader::Msr(_) => Strategy::Msr,
        }
    }

    /// Returns the energy consumed during the configured interval, in Joules.
    /// Blocks for the duration of the interval.
    pub fn read(&self) -> Result<Measurement> {
        match self {
            RaplReader::Powercap(r) => r.read(),
            RaplReader::PerfEvent(r) => r.read(),
            RaplReader::Msr(r) => r.read(),
        }
    }
}

/// Chooses a strategy: `preference` if it's available, otherwise the first available
/// one in [`Strategy::PRIORITY`].
pub fn select_strategy(preference: Strategy, available: impl Fn(Strategy) -> bool) -> Result<Strategy> {
    if preference != Strategy::FirstAvailable {
        if available(preference) {
            return Ok(preference);
        }
        warn!("RAPL strategy {preference} is not available, trying the others");
    }
    Strategy::PRIORITY
        .into_iter()
        .find(|s| available(*s))
        .ok_or(RaplError::NoStrategyAvailable)
}

/// Creates the reader to use for the whole session.
pub fn new_reader(preference: Strategy, ctx: Arc<Context>) -> Result<RaplReader> {
    let strategy = select_strategy(preference, |s| s.is_available(&ctx.config.paths))?;
    info!("reading RAPL counters with the {strategy} strategy");
    let reader = match strategy {
        Strategy::Powercap => RaplReader::Powercap(PowercapReader::new(ctx)),
        Strategy::PerfEvent => RaplReader::PerfEvent(PerfEventReader::new(ctx)?),
        Strategy::Msr => RaplReader::Msr(MsrReader::new(ctx)?),
        Strategy::FirstAvailable => unreachable!("select_strategy returns a concrete strategy"),
    };
    Ok(reader)
}
