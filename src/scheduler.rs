//! Shards the flow plan across worker threads and merges their output back
//! into one globally timestamp-ordered stream.

use std::sync::Arc;
use std::thread;

use crossbeam_channel::unbounded;
use itertools::kmerge;

use crate::assembler::assemble_flow;
use crate::error::Error;
use crate::meter::Meter;
use crate::planner::FlowPlan;
use crate::structs::Packet;

/// Runs the whole plan on `jobs` workers and returns the merged stream.
/// Per-entry seeds make the result identical for any worker count.
pub fn generate(
    plan: &FlowPlan,
    jobs: usize,
    meter: Arc<Meter>,
) -> Result<impl Iterator<Item = Packet>, Error> {
    let jobs = jobs.max(1);
    log::trace!("starting {jobs} assembly workers");
    let (tx, rx) = unbounded();
    let mut threads = Vec::with_capacity(jobs);

    for worker in 0..jobs {
        // round-robin sharding spreads large and small flows evenly
        let shard: Vec<_> = plan
            .entries
            .iter()
            .skip(worker)
            .step_by(jobs)
            .cloned()
            .collect();
        let tx = tx.clone();
        let meter = Arc::clone(&meter);
        let handle = thread::Builder::new()
            .name(format!("assembler-{worker}"))
            .spawn(move || {
                let mut packets = Vec::new();
                for entry in &shard {
                    match assemble_flow(entry) {
                        Ok(mut flow_packets) => {
                            meter.record_flow(&flow_packets);
                            packets.append(&mut flow_packets);
                        }
                        Err(e) => {
                            let _ = tx.send(Err(e));
                            return;
                        }
                    }
                }
                packets.sort_unstable();
                let _ = tx.send(Ok(packets));
            })?;
        threads.push(handle);
    }
    drop(tx);

    let results: Vec<Result<Vec<Packet>, Error>> = rx.iter().collect();
    for handle in threads {
        if handle.join().is_err() {
            return Err(Error::ProtocolBuild(
                "assembly worker panicked".to_string(),
            ));
        }
    }

    let mut shards = Vec::with_capacity(results.len());
    for result in results {
        shards.push(result?);
    }
    log::trace!("assembly workers done, merging shards");
    Ok(kmerge(shards))
}
