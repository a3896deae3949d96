mod cmd;

use std::cmp::max;
use std::process;
use std::sync::Arc;
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::Parser;
use indicatif::HumanBytes;

use flowgen::config::{import_config_file, GeneratorConfig};
use flowgen::error::Error;
use flowgen::{export, meter, planner, profile, scheduler};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = cmd::Args::parse();
    if let Err(e) = run(args) {
        log::error!("{e}");
        process::exit(1);
    }
}

fn run(args: cmd::Args) -> Result<(), Error> {
    let mut config = match &args.config {
        Some(path) => import_config_file(path)?,
        None => GeneratorConfig::default(),
    };
    apply_overrides(&mut config, &args)?;

    let seed = args.seed.unwrap_or_else(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
    });
    log::info!("Generating with seed {seed}");

    let records = profile::read_profile_file(&args.profile)?;
    log::info!(
        "Loaded {} flows from {}",
        records.len(),
        args.profile.display()
    );

    let plan = planner::plan(&records, &config, seed)?;
    let total_packets: u64 = plan.entries.iter().map(|e| e.schedule.len() as u64).sum();
    log::info!(
        "Planned {} flows, {total_packets} packets over {:.3}s (time divisor {:.2})",
        plan.entries.len(),
        plan.duration.as_secs_f64(),
        plan.time_divisor
    );

    let traffic_meter = Arc::new(meter::Meter::new(Some(total_packets)));
    let ui = {
        let traffic_meter = Arc::clone(&traffic_meter);
        thread::Builder::new()
            .name("progress".into())
            .spawn(move || meter::run(traffic_meter))?
    };

    let jobs = args.jobs.unwrap_or(max(1, num_cpus::get() / 2));
    let packets = scheduler::generate(&plan, jobs, Arc::clone(&traffic_meter))?;
    let written = export::write_pcap(&args.outfile, packets)?;
    let _ = ui.join();

    let summary = traffic_meter.summary(plan.duration, config.mbps_required, config.mbps_accuracy);
    if summary.throughput_shortfall {
        log::warn!(
            "achieved {:.1} mbit/s, short of the required rate beyond tolerance",
            summary.mbps
        );
    }
    log::info!(
        "Wrote {written} packets ({}) to {}",
        HumanBytes(summary.bytes),
        args.outfile.display()
    );

    if let Some(path) = &args.summary {
        let json =
            serde_json::to_string_pretty(&summary).map_err(|e| Error::Format(e.to_string()))?;
        std::fs::write(path, json).map_err(|source| Error::Write {
            path: path.clone(),
            source,
        })?;
        log::info!("Summary written to {}", path.display());
    }
    Ok(())
}

/// CLI flags take precedence over the configuration file.
fn apply_overrides(config: &mut GeneratorConfig, args: &cmd::Args) -> Result<(), Error> {
    if let Some(loops) = args.loops {
        if loops == 0 {
            return Err(Error::range("loops must be at least 1"));
        }
        config.loops = loops;
    }
    if let Some(mbps) = args.mbps {
        if mbps <= 0.0 {
            return Err(Error::range("mbps must be positive"));
        }
        config.mbps = Some(mbps);
    }
    if let Some(pps) = args.pps {
        if pps <= 0.0 {
            return Err(Error::range("pps must be positive"));
        }
        config.pps = Some(pps);
    }
    if let Some(speed) = args.speed_multiplier {
        if speed <= 0.0 {
            return Err(Error::range("speed multiplier must be positive"));
        }
        config.speed_multiplier = speed;
    }
    if let Some(sampling) = args.sampling {
        if sampling <= 0.0 || sampling > 1.0 {
            return Err(Error::range("sampling must be in (0, 1]"));
        }
        config.sampling = sampling;
    }
    Ok(())
}
