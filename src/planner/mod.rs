//! Flow planner: expands the raw profile into fully resolved flow plan
//! entries, with sampling, loop replication, throughput scaling, address
//! assignment and per-packet schedules all decided up front. Workers only
//! ever read the plan. Schedules are byte-accurate: TCP control slots are
//! pinned at header length and data slots never fall below what the
//! application builders can fill.

pub mod scaling;

use std::time::Duration;

use rand_core::{RngCore, SeedableRng};
use rand_pcg::Pcg32;

use crate::addr::{Ipv4Generator, Ipv6Generator, MacGenerator};
use crate::config::{GeneratorConfig, ProtocolOption};
use crate::error::Error;
use crate::layers::{self, http, tls, validate_stack};
use crate::profile;
use crate::sizegen::generate_sizes;
use crate::structs::{
    FlowAddresses, FlowPlanEntry, FlowProfileRecord, L3Protocol, L4Protocol, LayerKind,
    PacketDirection, PacketSchedule,
};
use crate::timegen::generate_timestamps;

// stream salts keeping the derived rngs independent of one another
const STREAM_SAMPLING: u64 = 0x01;
const STREAM_MAC: u64 = 0x02;
const STREAM_IPV4: u64 = 0x03;
const STREAM_IPV6: u64 = 0x04;
const STREAM_FLOW: u64 = 0x05;

const EPHEMERAL_PORT_BASE: u16 = 49152;

/// The complete generation plan for one run.
#[derive(Debug, Clone)]
pub struct FlowPlan {
    pub entries: Vec<FlowPlanEntry>,
    /// Wall-clock span the generated capture covers.
    pub duration: Duration,
    pub time_divisor: f64,
}

/// splitmix64; decorrelates seeds derived from the run seed.
fn mix(seed: u64, stream: u64, id: u64) -> u64 {
    let mut x = seed
        .wrapping_add(stream.wrapping_mul(0x9e3779b97f4a7c15))
        .wrapping_add(id.wrapping_mul(0xbf58476d1ce4e5b9));
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d049bb133111eb);
    x ^ (x >> 31)
}

/// Builds the run plan from a parsed profile. Everything fallible about a
/// run's configuration surfaces here, before any packet is generated.
pub fn plan(
    records: &[FlowProfileRecord],
    config: &GeneratorConfig,
    seed: u64,
) -> Result<FlowPlan, Error> {
    let span_ms = records
        .iter()
        .map(|r| r.end_time)
        .max()
        .unwrap_or(0)
        .max(1);

    let sampled = apply_sampling(records, config.sampling, seed);
    if sampled.is_empty() {
        log::warn!("sampling removed every flow, the capture will be empty");
    }

    let volume = scaling::ProfileVolume {
        packets: sampled.iter().map(|r| r.total_packets()).sum(),
        bytes: sampled.iter().map(|r| r.total_bytes()).sum(),
        span: span_ms as f64 / 1000.0,
    };
    let solution = scaling::solve(&volume, config)?;
    let divisor = solution.time_divisor;
    log::debug!(
        "planning {} flows x{} loops, time divisor {divisor:.3}",
        sampled.len(),
        config.loops
    );

    let mut macs = MacGenerator::new(config.mac_range, mix(seed, STREAM_MAC, 0));
    let mut ipv4s = Ipv4Generator::new(config.ipv4_range, mix(seed, STREAM_IPV4, 0));
    let mut ipv6s = Ipv6Generator::new(config.ipv6_range, mix(seed, STREAM_IPV6, 0));

    let scaled_span = Duration::from_secs_f64(span_ms as f64 / 1000.0 / divisor);
    let mut entries = Vec::with_capacity(sampled.len() * config.loops as usize);
    let mut flow_id = 0u64;

    for loop_idx in 0..config.loops {
        let offset = Duration::from_secs_f64(scaled_span.as_secs_f64() * loop_idx as f64);
        for record in &sampled {
            let entry_seed = mix(seed, STREAM_FLOW, flow_id);
            let mut rng = Pcg32::seed_from_u64(entry_seed);

            let stack = resolve_stack(record, config);
            validate_stack(&stack)?;
            let addrs = assign_addresses(
                record,
                &mut rng,
                &mut macs,
                &mut ipv4s,
                &mut ipv6s,
            )?;

            let header_len = layers::stack_overhead(&stack);
            let link_oh = layers::link_overhead(&stack);
            let count = record.total_packets();
            let start = Duration::from_secs_f64(
                record.start_time as f64 / 1000.0 / divisor,
            ) + offset;
            let duration =
                Duration::from_secs_f64(record.duration().as_secs_f64() / divisor);

            // profile byte counts stop at L3; add the link layers on top
            let target_bytes = record.total_bytes() + count * link_oh as u64;
            // TCP handshake and teardown slots go out at bare header
            // length, so only the data packets draw from the distribution
            let control = if record.l4 == L4Protocol::TCP && count >= 4 {
                4u64
            } else {
                0
            };
            let data_sizes = generate_sizes(
                &mut rng,
                &solution.buckets,
                count - control,
                target_bytes.saturating_sub(control * header_len as u64),
                header_len + payload_floor(&stack),
                config.mtu + link_oh,
            );
            let sizes = if control > 0 {
                let mut sizes = vec![header_len; 3];
                sizes.extend(data_sizes);
                sizes.push(header_len);
                sizes
            } else {
                data_sizes
            };
            let times = generate_timestamps(&mut rng, count, duration);
            let directions = direction_sequence(record.packets, record.packets_rev);

            let schedule = times
                .into_iter()
                .zip(directions)
                .zip(sizes)
                .map(|((ts, direction), size)| PacketSchedule {
                    ts,
                    direction,
                    size,
                })
                .collect();

            entries.push(FlowPlanEntry {
                flow_id,
                seed: entry_seed,
                start,
                duration,
                addrs,
                stack,
                schedule,
            });
            flow_id += 1;
        }
    }

    Ok(FlowPlan {
        entries,
        duration: Duration::from_secs_f64(
            scaled_span.as_secs_f64() * config.loops as f64,
        ),
        time_divisor: divisor,
    })
}

/// Smallest payload the application builders can fill exactly. Data packets
/// below it would come out longer than their scheduled size.
fn payload_floor(stack: &[LayerKind]) -> usize {
    match stack.last() {
        Some(LayerKind::Http) => http::MIN_REQUEST_LEN.max(http::MIN_RESPONSE_LEN),
        Some(LayerKind::Tls) => tls::MIN_FLIGHT_LEN,
        _ => 0,
    }
}

/// Thins or replicates the flow population by the sampling fraction. The
/// integer part of `1/sampling` replicates every flow; the fractional part
/// adds one more copy probabilistically, per flow, deterministic in the
/// run seed.
fn apply_sampling(
    records: &[FlowProfileRecord],
    sampling: f64,
    seed: u64,
) -> Vec<FlowProfileRecord> {
    let factor = 1.0 / sampling;
    let copies = factor.floor() as u64;
    let frac = factor - factor.floor();

    let mut out = Vec::with_capacity((records.len() as f64 * factor).ceil() as usize);
    for (idx, record) in records.iter().enumerate() {
        let mut rng = Pcg32::seed_from_u64(mix(seed, STREAM_SAMPLING, idx as u64));
        for _ in 0..copies {
            out.push(record.clone());
        }
        if frac > 0.0 && (rng.next_u32() as f64) < frac * f64::from(u32::MAX) {
            out.push(record.clone());
        }
    }
    out
}

/// Resolves the layer stack of one flow from its protocol ids, the enabled
/// protocol set, and the well-known destination port.
fn resolve_stack(record: &FlowProfileRecord, config: &GeneratorConfig) -> Vec<LayerKind> {
    let mut stack = vec![LayerKind::Ethernet];
    if config.protocol_enabled(ProtocolOption::Vlan) {
        stack.push(LayerKind::Vlan(config.vlan_id));
    }
    if config.protocol_enabled(ProtocolOption::Mpls) {
        stack.push(LayerKind::Mpls(config.mpls_label));
    }
    stack.push(match record.l3 {
        L3Protocol::Ipv4 => LayerKind::Ipv4,
        L3Protocol::Ipv6 => LayerKind::Ipv6,
    });
    stack.push(match record.l4 {
        L4Protocol::TCP => LayerKind::Tcp,
        L4Protocol::UDP => LayerKind::Udp,
        L4Protocol::ICMP => LayerKind::Icmp,
        L4Protocol::ICMPv6 => LayerKind::Icmpv6,
    });

    if record.l4.uses_ports() {
        let app = match record.dst_port {
            profile::PORT_DNS if config.protocol_enabled(ProtocolOption::Dns) => {
                Some(LayerKind::Dns)
            }
            profile::PORT_HTTP if config.protocol_enabled(ProtocolOption::Http) => {
                Some(LayerKind::Http)
            }
            profile::PORT_TLS
                if record.l4 == L4Protocol::TCP
                    && config.protocol_enabled(ProtocolOption::Tls) =>
            {
                Some(LayerKind::Tls)
            }
            _ => None,
        };
        if let Some(app) = app {
            stack.push(app);
        }
    }
    stack
}

/// Draws fresh addresses for one flow. Ports come from the profile when
/// set; a missing source port becomes an ephemeral one.
fn assign_addresses(
    record: &FlowProfileRecord,
    rng: &mut Pcg32,
    macs: &mut MacGenerator,
    ipv4s: &mut Ipv4Generator,
    ipv6s: &mut Ipv6Generator,
) -> Result<FlowAddresses, Error> {
    let src_mac = macs.next()?;
    let dst_mac = macs.next()?;
    let (src_ip, dst_ip) = match record.l3 {
        L3Protocol::Ipv4 => (ipv4s.next()?.into(), ipv4s.next()?.into()),
        L3Protocol::Ipv6 => (ipv6s.next()?.into(), ipv6s.next()?.into()),
    };
    let src_port = if !record.l4.uses_ports() {
        0
    } else if record.src_port != 0 {
        record.src_port
    } else {
        EPHEMERAL_PORT_BASE + (rng.next_u32() % u32::from(u16::MAX - EPHEMERAL_PORT_BASE)) as u16
    };
    Ok(FlowAddresses {
        src_mac,
        dst_mac,
        src_ip,
        dst_ip,
        src_port,
        dst_port: record.dst_port,
    })
}

/// Spreads forward and backward packets through the flow proportionally,
/// largest-remainder style, starting with the forward direction.
fn direction_sequence(fwd: u64, bwd: u64) -> Vec<PacketDirection> {
    let total = fwd + bwd;
    let mut out = Vec::with_capacity(total as usize);
    let (mut f_credit, mut b_credit) = (0i64, 0i64);
    let (mut f_left, mut b_left) = (fwd, bwd);
    for _ in 0..total {
        f_credit += fwd as i64;
        b_credit += bwd as i64;
        let forward = if f_left == 0 {
            false
        } else if b_left == 0 {
            true
        } else {
            f_credit >= b_credit
        };
        if forward {
            f_credit -= total as i64;
            f_left -= 1;
            out.push(PacketDirection::Forward);
        } else {
            b_credit -= total as i64;
            b_left -= 1;
            out.push(PacketDirection::Backward);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::import_config;

    fn record(packets: u64, bytes: u64) -> FlowProfileRecord {
        FlowProfileRecord {
            start_time: 0,
            end_time: 1000,
            l3: L3Protocol::Ipv4,
            l4: L4Protocol::TCP,
            src_port: 40000,
            dst_port: 443,
            packets,
            bytes,
            packets_rev: packets / 2,
            bytes_rev: bytes / 2,
        }
    }

    #[test]
    fn plan_preserves_packet_counts() {
        let config = import_config("").unwrap();
        let records = vec![record(10, 5000), record(4, 2000)];
        let out = plan(&records, &config, 7).unwrap();
        assert_eq!(out.entries.len(), 2);
        assert_eq!(out.entries[0].schedule.len(), 15);
        assert_eq!(out.entries[1].schedule.len(), 6);
    }

    #[test]
    fn loops_replicate_and_offset() {
        let mut config = import_config("").unwrap();
        config.loops = 3;
        let records = vec![record(10, 5000)];
        let out = plan(&records, &config, 7).unwrap();
        assert_eq!(out.entries.len(), 3);
        assert!(out.entries[1].start > out.entries[0].start);
        assert!(out.entries[2].start > out.entries[1].start);
        // replicas draw distinct addresses
        assert_ne!(out.entries[0].addrs.src_ip, out.entries[1].addrs.src_ip);
    }

    #[test]
    fn sampling_half_doubles_flows() {
        let mut config = import_config("").unwrap();
        config.sampling = 0.5;
        let records = vec![record(10, 5000); 4];
        let out = plan(&records, &config, 7).unwrap();
        assert_eq!(out.entries.len(), 8);
    }

    #[test]
    fn speed_multiplier_compresses_time() {
        let mut config = import_config("").unwrap();
        config.speed_multiplier = 2.0;
        let records = vec![record(10, 5000)];
        let out = plan(&records, &config, 7).unwrap();
        assert_eq!(out.entries[0].duration, Duration::from_millis(500));
        assert_eq!(out.duration, Duration::from_millis(500));
    }

    #[test]
    fn tls_port_gets_a_tls_layer() {
        let config = import_config("").unwrap();
        let records = vec![record(10, 5000)];
        let out = plan(&records, &config, 7).unwrap();
        assert_eq!(out.entries[0].stack.last(), Some(&LayerKind::Tls));
    }

    #[test]
    fn vlan_and_mpls_appear_when_enabled() {
        let mut config =
            import_config("protocols = [\"vlan\", \"mpls\"]\nvlan_id = 7\nmpls_label = 99")
                .unwrap();
        config.loops = 1;
        let records = vec![record(10, 5000)];
        let out = plan(&records, &config, 7).unwrap();
        assert_eq!(out.entries[0].stack[1], LayerKind::Vlan(7));
        assert_eq!(out.entries[0].stack[2], LayerKind::Mpls(99));
        // tls disabled because it is not in the enabled set
        assert_eq!(out.entries[0].stack.last(), Some(&LayerKind::Tcp));
    }

    #[test]
    fn direction_sequence_spreads_both_ways() {
        let dirs = direction_sequence(6, 3);
        assert_eq!(dirs.len(), 9);
        assert_eq!(dirs[0], PacketDirection::Forward);
        let fwd = dirs
            .iter()
            .filter(|d| **d == PacketDirection::Forward)
            .count();
        assert_eq!(fwd, 6);
        // with a 2:1 ratio the backward packets never bunch up
        assert!(dirs
            .windows(2)
            .all(|w| w != [PacketDirection::Backward, PacketDirection::Backward]));
    }

    #[test]
    fn assembled_bytes_match_the_planned_total() {
        let config = import_config("protocols = []").unwrap();
        let rec = FlowProfileRecord {
            start_time: 0,
            end_time: 1000,
            l3: L3Protocol::Ipv4,
            l4: L4Protocol::TCP,
            src_port: 40000,
            dst_port: 443,
            packets: 12,
            bytes: 9000,
            packets_rev: 8,
            bytes_rev: 6000,
        };
        let out = plan(&[rec], &config, 7).unwrap();
        let entry = &out.entries[0];
        // L3 bytes plus one Ethernet header per packet
        let planned: u64 = entry.schedule.iter().map(|s| s.size as u64).sum();
        assert_eq!(planned, 15_000 + 20 * 14);
        // handshake and teardown slots are pinned at bare header length
        assert_eq!(entry.schedule[0].size, 54);
        assert_eq!(entry.schedule[1].size, 54);
        assert_eq!(entry.schedule[2].size, 54);
        assert_eq!(entry.schedule[19].size, 54);
        // the assembled frames spend exactly the planned bytes
        let frames = crate::assembler::assemble_flow(entry).unwrap();
        let built: u64 = frames.iter().map(|p| p.data.len() as u64).sum();
        assert_eq!(built, planned);
    }

    #[test]
    fn tls_data_sizes_clear_the_record_floor() {
        let config = import_config("").unwrap();
        let records = vec![record(12, 9000)];
        let out = plan(&records, &config, 7).unwrap();
        let entry = &out.entries[0];
        assert_eq!(entry.stack.last(), Some(&LayerKind::Tls));
        let n = entry.schedule.len();
        for s in &entry.schedule[3..n - 1] {
            assert!(s.size >= 54 + tls::MIN_FLIGHT_LEN, "data slot {}", s.size);
        }
        let planned: u64 = entry.schedule.iter().map(|s| s.size as u64).sum();
        let frames = crate::assembler::assemble_flow(entry).unwrap();
        let built: u64 = frames.iter().map(|p| p.data.len() as u64).sum();
        assert_eq!(built, planned);
    }

    #[test]
    fn identical_seeds_give_identical_plans() {
        let config = import_config("").unwrap();
        let records = vec![record(10, 5000), record(4, 2000)];
        let a = plan(&records, &config, 99).unwrap();
        let b = plan(&records, &config, 99).unwrap();
        assert_eq!(a.entries.len(), b.entries.len());
        for (x, y) in a.entries.iter().zip(&b.entries) {
            assert_eq!(x.seed, y.seed);
            assert_eq!(x.addrs.src_ip, y.addrs.src_ip);
            assert_eq!(x.schedule.len(), y.schedule.len());
        }
    }
}
