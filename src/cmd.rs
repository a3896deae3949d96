use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(
        short,
        long,
        required = true,
        help = "Csv flow profile to synthesize traffic from"
    )]
    pub profile: PathBuf,
    #[arg(short, long, default_value = None, help = "Path to the toml run configuration")]
    pub config: Option<PathBuf>,
    #[arg(
        short,
        long,
        default_value = "output.pcap",
        help = "Output pcap file for the synthetic packets"
    )]
    pub outfile: PathBuf,
    #[arg(short, long, default_value = None, help = "Replicate the profile this many times, overriding the configuration")]
    pub loops: Option<u64>,
    #[arg(long, default_value = None, help = "Target throughput in mbit/s, overriding the configuration")]
    pub mbps: Option<f64>,
    #[arg(long, default_value = None, help = "Target packet rate in packets/s, overriding the configuration")]
    pub pps: Option<f64>,
    #[arg(long, default_value = None, help = "Time compression factor, overriding the configuration")]
    pub speed_multiplier: Option<f64>,
    #[arg(long, default_value = None, help = "Flow sampling fraction in (0, 1], overriding the configuration")]
    pub sampling: Option<f64>,
    #[arg(short, long, help = "Seed for random number generation")]
    pub seed: Option<u64>,
    #[arg(short, long, default_value = None, help = "Number of worker threads. Defaults to half the available cores")]
    pub jobs: Option<usize>,
    #[arg(long, default_value = None, help = "Write the run summary as json to this path")]
    pub summary: Option<PathBuf>,
}
