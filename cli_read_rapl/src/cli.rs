use clap::Parser;
use rapl_readers::reader::Strategy;

#[derive(Parser)]
#[command(author, version, about = "Measures the energy consumption of the cpu packages with RAPL")]
pub struct Cli {
    /// How to access RAPL counters.
    #[arg(short, long, value_enum, default_value_t = Strategy::FirstAvailable)]
    pub strategy: Strategy,

    /// Time between the two samples of a measurement, in milliseconds.
    #[arg(short, long, default_value_t = 1000)]
    pub interval: u64,

    /// Number of measurements to take.
    #[arg(short, long, default_value_t = 1)]
    pub count: u32,

    /// Only show info about CPU and RAPL domains, then exit.
    #[arg(long)]
    pub info: bool,
}
