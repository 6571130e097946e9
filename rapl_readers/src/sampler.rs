use std::{
    collections::{BTreeMap, BTreeSet},
    thread,
    time::Duration,
};

use log::{debug, warn};

use crate::{error::Result, topology::PackageId, Measurement, RaplDomainType, Slot};

/// Identifies a hardware counter: `(package, slot, domain, part)`.
///
/// Several parts can feed the same value of a [`Measurement`], for instance the
/// dies of a multi-die package. Their deltas are computed separately, then added.
pub type CounterId = (PackageId, Slot, RaplDomainType, u32);

#[derive(Debug, Clone, Copy, PartialEq)]
struct Counter {
    /// Value converted to Joules.
    joules: f64,
    /// The counter goes back to zero when it reaches this value, in Joules.
    range: Option<f64>,
}

/// The values of all the counters at some point in time.
#[derive(Debug, Clone, Default)]
pub struct Sweep {
    counters: BTreeMap<CounterId, Counter>,
}

impl Sweep {
    pub fn new() -> Sweep {
        Sweep::default()
    }

    /// Records the value of a counter that is the only part of its domain.
    pub fn push(&mut self, package: PackageId, slot: Slot, domain: RaplDomainType, joules: f64, range: Option<f64>) {
        self.push_part(package, slot, domain, 0, joules, range);
    }

    /// Records the value of one part of a domain.
    pub fn push_part(
        &mut self,
        package: PackageId,
        slot: Slot,
        domain: RaplDomainType,
        part: u32,
        joules: f64,
        range: Option<f64>,
    ) {
        self.counters.insert((package, slot, domain, part), Counter { joules, range });
    }

    /// The range of a counter, if it's known.
    pub fn range(&self, id: CounterId) -> Option<f64> {
        self.counters.get(&id)?.range
    }

    /// The counter values, with the parts of each domain added together.
    pub fn values(&self) -> Measurement {
        let mut res = Measurement::new();
        for ((package, slot, domain, _), counter) in &self.counters {
            res.entry(*package, *slot).accumulate(*domain, counter.joules);
        }
        res
    }
}

/// Takes a sweep, waits for `interval`, takes another sweep and returns the difference.
/// The wait blocks the current thread.
pub fn sample_delta<F>(interval: Duration, mut sweep: F) -> Result<Measurement>
where
    F: FnMut() -> Result<Sweep>,
{
    let before = sweep()?;
    thread::sleep(interval);
    let after = sweep()?;
    Ok(wrapping_delta(&before, &after))
}

/// Computes `after - before` for every counter present in both sweeps, correcting the
/// counters that have overflowed, then adds the parts of each domain together.
///
/// ## Overflows
///
/// RAPL counters overflow after some time, which depends on the consumption of the domain
/// (it can be lower than one minute on big servers with the MSR interface).
/// We cannot know how many overflows have occured, so we correct only one: the interval
/// must be short enough for the counters to wrap at most once.
///
/// A negative difference on a counter whose range is unknown cannot be corrected,
/// the whole domain is then removed from the result.
pub fn wrapping_delta(before: &Sweep, after: &Sweep) -> Measurement {
    let mut delta = Measurement::new();
    let mut dropped = BTreeSet::new();

    for (id, b) in &after.counters {
        let Some(a) = before.counters.get(id) else {
            continue;
        };
        let (package, slot, domain, part) = *id;
        let mut diff = b.joules - a.joules;
        if diff < 0.0 {
            match b.range {
                Some(range) => {
                    debug!("counter overflow on package {package}, {slot}, {domain} (part {part})");
                    diff += range;
                }
                None => {
                    warn!("counter of package {package}, {slot}, {domain} went backwards and its range is unknown, ignoring it");
                    dropped.insert((package, slot, domain));
                    continue;
                }
            }
        }
        delta.entry(package, slot).accumulate(domain, diff);
    }

    // a partial sum would be wrong
    for (package, slot, domain) in dropped {
        if let Some(energy) = delta.per_package.get_mut(&package).and_then(|s| s.get_mut(&slot)) {
            energy.remove(domain);
        }
    }
    delta
}
