use pnet::util::MacAddr;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt::Display;
use std::net::IpAddr;
use std::time::Duration;

use crate::error::Error;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum L3Protocol {
    Ipv4,
    Ipv6,
}

impl L3Protocol {
    /// Ethertype as found in the profile's L3 identifier column.
    pub fn from_profile_id(id: u16) -> Result<Self, Error> {
        match id {
            4 => Ok(L3Protocol::Ipv4),
            6 => Ok(L3Protocol::Ipv6),
            other => Err(Error::format(format!("unknown L3 protocol id {other}"))),
        }
    }
}

#[allow(clippy::upper_case_acronyms)]
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum L4Protocol {
    TCP,
    UDP,
    ICMP,
    ICMPv6,
}

impl L4Protocol {
    /// IANA protocol number, used both for parsing and the IP header field.
    pub fn from_profile_id(id: u8) -> Result<Self, Error> {
        match id {
            6 => Ok(L4Protocol::TCP),
            17 => Ok(L4Protocol::UDP),
            1 => Ok(L4Protocol::ICMP),
            58 => Ok(L4Protocol::ICMPv6),
            other => Err(Error::format(format!("unknown L4 protocol id {other}"))),
        }
    }

    pub fn protocol_number(&self) -> u8 {
        match self {
            L4Protocol::TCP => 6,
            L4Protocol::UDP => 17,
            L4Protocol::ICMP => 1,
            L4Protocol::ICMPv6 => 58,
        }
    }

    pub fn uses_ports(&self) -> bool {
        matches!(self, L4Protocol::TCP | L4Protocol::UDP)
    }
}

impl Display for L4Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            L4Protocol::TCP => write!(f, "TCP"),
            L4Protocol::UDP => write!(f, "UDP"),
            L4Protocol::ICMP => write!(f, "ICMP"),
            L4Protocol::ICMPv6 => write!(f, "ICMPv6"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PacketDirection {
    Forward,  // client to server
    Backward, // server to client
}

/// One row of the aggregated flow profile. Immutable once loaded, and the
/// loader guarantees the per-direction totals fit in `u64`.
/// Times are offsets in milliseconds relative to the profile start.
#[derive(Debug, Clone)]
pub struct FlowProfileRecord {
    pub start_time: u64,
    pub end_time: u64,
    pub l3: L3Protocol,
    pub l4: L4Protocol,
    pub src_port: u16,
    pub dst_port: u16,
    pub packets: u64,
    pub bytes: u64,
    pub packets_rev: u64,
    pub bytes_rev: u64,
}

impl FlowProfileRecord {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.end_time - self.start_time)
    }

    pub fn total_packets(&self) -> u64 {
        self.packets + self.packets_rev
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes + self.bytes_rev
    }
}

/// One protocol layer of a flow's stack. The stack is resolved at flow-plan
/// time and composed as an ordered list; builders never dispatch dynamically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    Ethernet,
    Vlan(u16),
    Mpls(u32),
    Ipv4,
    Ipv6,
    Tcp,
    Udp,
    Icmp,
    Icmpv6,
    Dns,
    Http,
    Tls,
}

impl LayerKind {
    pub fn is_link(&self) -> bool {
        matches!(
            self,
            LayerKind::Ethernet | LayerKind::Vlan(_) | LayerKind::Mpls(_)
        )
    }

    pub fn is_l3(&self) -> bool {
        matches!(self, LayerKind::Ipv4 | LayerKind::Ipv6)
    }

    pub fn is_l4(&self) -> bool {
        matches!(
            self,
            LayerKind::Tcp | LayerKind::Udp | LayerKind::Icmp | LayerKind::Icmpv6
        )
    }

    pub fn is_app(&self) -> bool {
        matches!(self, LayerKind::Dns | LayerKind::Http | LayerKind::Tls)
    }
}

/// Addresses assigned to one planned flow. Drawn once from the address
/// generators, never reused while the ranges have capacity left.
#[derive(Debug, Clone, Copy)]
pub struct FlowAddresses {
    pub src_mac: MacAddr,
    pub dst_mac: MacAddr,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
}

/// Schedule of a single packet inside a planned flow.
#[derive(Debug, Clone, Copy)]
pub struct PacketSchedule {
    pub ts: Duration,
    pub direction: PacketDirection,
    pub size: usize,
}

/// A fully resolved flow, ready for packet assembly. Created by the planner,
/// consumed read-only by the workers.
#[derive(Debug, Clone)]
pub struct FlowPlanEntry {
    pub flow_id: u64,
    /// Per-flow seed derived from the run seed; makes assembly independent
    /// of worker scheduling.
    pub seed: u64,
    pub start: Duration,
    pub duration: Duration,
    pub addrs: FlowAddresses,
    pub stack: Vec<LayerKind>,
    pub schedule: Vec<PacketSchedule>,
}

impl FlowPlanEntry {
    pub fn l4(&self) -> Option<L4Protocol> {
        self.stack.iter().find_map(|l| match l {
            LayerKind::Tcp => Some(L4Protocol::TCP),
            LayerKind::Udp => Some(L4Protocol::UDP),
            LayerKind::Icmp => Some(L4Protocol::ICMP),
            LayerKind::Icmpv6 => Some(L4Protocol::ICMPv6),
            _ => None,
        })
    }
}

/// A finished packet: raw bytes plus capture metadata. Handed to the merge
/// stage and discarded after serialization.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Packet {
    pub timestamp: Duration,
    pub data: Vec<u8>,
}

/// Used for packet ordering before pcap export
impl Ord for Packet {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.timestamp == other.timestamp {
            self.data.cmp(&other.data) // use data in case both timestamps are equal
        } else {
            self.timestamp.cmp(&other.timestamp)
        }
    }
}

impl PartialOrd for Packet {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_ordering_is_by_timestamp_then_data() {
        let a = Packet {
            timestamp: Duration::from_millis(1),
            data: vec![9],
        };
        let b = Packet {
            timestamp: Duration::from_millis(2),
            data: vec![0],
        };
        let c = Packet {
            timestamp: Duration::from_millis(1),
            data: vec![1],
        };
        let mut v = vec![b.clone(), a.clone(), c.clone()];
        v.sort_unstable();
        assert_eq!(v, vec![c, a, b]);
    }

    #[test]
    fn l4_from_profile_id() {
        assert_eq!(L4Protocol::from_profile_id(6).unwrap(), L4Protocol::TCP);
        assert_eq!(L4Protocol::from_profile_id(17).unwrap(), L4Protocol::UDP);
        assert!(L4Protocol::from_profile_id(99).is_err());
    }
}
