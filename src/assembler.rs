//! Turns a planned flow into finished frames. Every byte of every packet is
//! produced here, layer by layer, from the flow's resolved stack.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::num::Wrapping;

use pnet_packet::icmp::{self, IcmpCode, IcmpTypes, MutableIcmpPacket};
use pnet_packet::icmpv6::{self, Icmpv6Code, Icmpv6Types, MutableIcmpv6Packet};
use pnet_packet::ip::IpNextHeaderProtocol;
use pnet_packet::ipv4::{self, MutableIpv4Packet};
use pnet_packet::ipv6::MutableIpv6Packet;
use pnet_packet::tcp::{self, MutableTcpPacket, TcpFlags};
use pnet_packet::udp::{self, MutableUdpPacket};
use pnet::util::MacAddr;
use rand_core::{RngCore, SeedableRng};
use rand_pcg::Pcg32;

use crate::error::Error;
use crate::layers::{self, dns, http, tls};
use crate::layers::link;
use crate::layers::tls::{TlsSender, TlsSession, TlsState};
use crate::structs::{
    FlowAddresses, FlowPlanEntry, L4Protocol, LayerKind, Packet, PacketDirection,
};

const TTL: u8 = 64;
/// Encrypted close_notify: 2 alert bytes + inner type + tag + header.
const CLOSE_NOTIFY_LEN: usize = tls::RECORD_OVERHEAD + 2;

struct TcpFlowState {
    forward: Wrapping<u32>,  // forward SEQ and backward ACK
    backward: Wrapping<u32>, // forward ACK and backward SEQ
    cwnd: usize,
    rwnd: usize,
    ssthresh: usize,
    mss: usize,
}

impl TcpFlowState {
    fn new(rng: &mut impl RngCore) -> Self {
        TcpFlowState {
            forward: Wrapping(rng.next_u32()),
            backward: Wrapping(rng.next_u32()),
            cwnd: 65535,
            rwnd: 65535,
            ssthresh: 65535,
            mss: 1460,
        }
    }

    /// Advances the simulated congestion window and returns the effective
    /// window plus whether a congestion event occurred.
    fn step_window(&mut self, rng: &mut impl RngCore) -> (u16, bool) {
        let mut cwr = false;
        if rng.next_u32() % 100 < 5 {
            self.ssthresh = self.cwnd / 2;
            self.cwnd = self.ssthresh.max(self.mss);
            cwr = true;
        } else if self.cwnd < self.ssthresh {
            self.cwnd += self.mss;
        } else {
            self.cwnd += (self.mss * self.mss) / self.cwnd;
        }
        (self.cwnd.min(self.rwnd).min(65535) as u16, cwr)
    }
}

/// Application-layer state carried across a flow's packets.
enum AppSession {
    Raw,
    Dns { pending: Option<(u16, String, u16)> },
    Http,
    Tls(TlsSession),
}

impl AppSession {
    fn new(stack: &[LayerKind], rng: &mut Pcg32) -> Self {
        match stack.last() {
            Some(LayerKind::Dns) => AppSession::Dns { pending: None },
            Some(LayerKind::Http) => AppSession::Http,
            Some(LayerKind::Tls) => AppSession::Tls(TlsSession::new(rng)),
            _ => AppSession::Raw,
        }
    }
}

/// Builds all packets of one planned flow. Deterministic in the entry's
/// seed, so the result does not depend on which worker runs it.
pub fn assemble_flow(entry: &FlowPlanEntry) -> Result<Vec<Packet>, Error> {
    layers::validate_stack(&entry.stack)?;
    let mut rng = Pcg32::seed_from_u64(entry.seed);

    let is_tcp = entry.l4() == Some(L4Protocol::TCP);
    let n = entry.schedule.len();
    // SYN, SYN-ACK, ACK and a trailing FIN only fit with four packets or more
    let with_handshake = is_tcp && n >= 4;
    let header_len = layers::stack_overhead(&entry.stack);
    let qtype = if entry.stack.contains(&LayerKind::Ipv6) {
        dns::TYPE_AAAA
    } else {
        dns::TYPE_A
    };

    let mut tcp_state = if is_tcp {
        Some(TcpFlowState::new(&mut rng))
    } else {
        None
    };
    let mut session = AppSession::new(&entry.stack, &mut rng);
    let echo_id = entry.flow_id as u16;
    let last_data = if with_handshake { n.saturating_sub(2) } else { n.saturating_sub(1) };

    let mut packets = Vec::with_capacity(n);
    for (i, sched) in entry.schedule.iter().enumerate() {
        let budget = sched.size.saturating_sub(header_len);
        let (direction, flags, payload) = if with_handshake && i == 0 {
            (PacketDirection::Forward, TcpFlags::SYN, Vec::new())
        } else if with_handshake && i == 1 {
            (
                PacketDirection::Backward,
                TcpFlags::SYN | TcpFlags::ACK,
                Vec::new(),
            )
        } else if with_handshake && i == 2 {
            (PacketDirection::Forward, TcpFlags::ACK, Vec::new())
        } else if with_handshake && i == n - 1 {
            (sched.direction, TcpFlags::FIN | TcpFlags::ACK, Vec::new())
        } else {
            let payload = app_payload(
                &mut session,
                &mut rng,
                sched.direction,
                budget,
                i == last_data,
                qtype,
                &entry.addrs,
            )?;
            let flags = if is_tcp {
                TcpFlags::ACK | TcpFlags::PSH
            } else {
                0
            };
            (sched.direction, flags, payload)
        };

        let frame = build_frame(
            &entry.stack,
            &entry.addrs,
            direction,
            flags,
            &payload,
            tcp_state.as_mut(),
            (echo_id, i as u16),
            &mut rng,
        )?;
        packets.push(Packet {
            timestamp: entry.start + sched.ts,
            data: frame,
        });
    }
    Ok(packets)
}

/// Produces the application payload for one data packet. DNS messages keep
/// their natural size; everything else fills the byte budget exactly.
fn app_payload(
    session: &mut AppSession,
    rng: &mut Pcg32,
    direction: PacketDirection,
    budget: usize,
    final_data: bool,
    qtype: u16,
    addrs: &FlowAddresses,
) -> Result<Vec<u8>, Error> {
    match session {
        AppSession::Raw => {
            let mut payload = vec![0u8; budget];
            rng.fill_bytes(&mut payload);
            Ok(payload)
        }
        AppSession::Dns { pending } => match direction {
            PacketDirection::Forward => {
                let id = rng.next_u32() as u16;
                let name = dns::generate_name(rng);
                let query = dns::build_query(id, &name, qtype);
                *pending = Some((id, name, qtype));
                Ok(query)
            }
            PacketDirection::Backward => {
                let (id, name, qtype) = match pending.take() {
                    Some(q) => q,
                    None => (rng.next_u32() as u16, dns::generate_name(rng), qtype),
                };
                let v4 = match addrs.dst_ip {
                    IpAddr::V4(a) => a,
                    IpAddr::V6(_) => Ipv4Addr::new(192, 0, 2, 1),
                };
                let v6 = match addrs.dst_ip {
                    IpAddr::V6(a) => a,
                    IpAddr::V4(_) => Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1),
                };
                Ok(dns::build_response(id, &name, qtype, v4, v6))
            }
        },
        AppSession::Http => match direction {
            PacketDirection::Forward => Ok(http::build_request(rng, budget)),
            PacketDirection::Backward => Ok(http::build_response(rng, budget)),
        },
        AppSession::Tls(tls_session) => {
            tls_payload(tls_session, rng, direction, budget, final_data)
        }
    }
}

fn tls_payload(
    session: &mut TlsSession,
    rng: &mut Pcg32,
    direction: PacketDirection,
    budget: usize,
    final_data: bool,
) -> Result<Vec<u8>, Error> {
    match (session.state(), direction) {
        (TlsState::Unstarted, PacketDirection::Forward) => session.client_hello(budget),
        (TlsState::Unstarted, PacketDirection::Backward) => {
            // only the client opens; a server slot before the hello
            // carries opaque filler
            let mut payload = vec![0u8; budget];
            rng.fill_bytes(&mut payload);
            Ok(payload)
        }
        (TlsState::HandshakeInProgress, PacketDirection::Backward) => {
            session.server_flight(budget)
        }
        (TlsState::HandshakeInProgress, PacketDirection::Forward) => {
            // the server never got a handshake slot; derive keys anyway
            session.establish();
            let sender = TlsSender::Client;
            session.app_record(sender, rng, budget)
        }
        (TlsState::Established, _) => {
            let sender = match direction {
                PacketDirection::Forward => TlsSender::Client,
                PacketDirection::Backward => TlsSender::Server,
            };
            if final_data {
                if budget >= tls::MIN_APP_RECORD_LEN + CLOSE_NOTIFY_LEN {
                    let mut record =
                        session.app_record(sender, rng, budget - CLOSE_NOTIFY_LEN)?;
                    record.extend_from_slice(&session.close_notify(sender)?);
                    Ok(record)
                } else {
                    session.close_notify(sender)
                }
            } else {
                session.app_record(sender, rng, budget)
            }
        }
        (TlsState::Closed, _) => {
            // the close already went out; pad with a raw record-free tail
            let mut payload = vec![0u8; budget];
            rng.fill_bytes(&mut payload);
            Ok(payload)
        }
    }
}

fn build_err(layer: &str) -> Error {
    Error::ProtocolBuild(format!("buffer too small for {layer} header"))
}

/// Serializes one frame by walking the stack top-down, leaving payload bytes
/// where the transport builder placed them.
#[allow(clippy::too_many_arguments)]
fn build_frame(
    stack: &[LayerKind],
    addrs: &FlowAddresses,
    direction: PacketDirection,
    tcp_flags: u8,
    payload: &[u8],
    mut tcp_state: Option<&mut TcpFlowState>,
    echo: (u16, u16),
    rng: &mut Pcg32,
) -> Result<Vec<u8>, Error> {
    let header_len = layers::stack_overhead(stack);
    let mut data = vec![0u8; header_len + payload.len()];

    let (src_mac, dst_mac): (MacAddr, MacAddr) = match direction {
        PacketDirection::Forward => (addrs.src_mac, addrs.dst_mac),
        PacketDirection::Backward => (addrs.dst_mac, addrs.src_mac),
    };
    let (src_ip, dst_ip) = match direction {
        PacketDirection::Forward => (addrs.src_ip, addrs.dst_ip),
        PacketDirection::Backward => (addrs.dst_ip, addrs.src_ip),
    };
    let (src_port, dst_port) = match direction {
        PacketDirection::Forward => (addrs.src_port, addrs.dst_port),
        PacketDirection::Backward => (addrs.dst_port, addrs.src_port),
    };

    let proto_number = stack
        .iter()
        .find_map(|l| match l {
            LayerKind::Tcp => Some(L4Protocol::TCP.protocol_number()),
            LayerKind::Udp => Some(L4Protocol::UDP.protocol_number()),
            LayerKind::Icmp => Some(L4Protocol::ICMP.protocol_number()),
            LayerKind::Icmpv6 => Some(L4Protocol::ICMPv6.protocol_number()),
            _ => None,
        })
        .ok_or_else(|| Error::ProtocolBuild("stack has no transport layer".to_string()))?;

    let total_len = data.len();
    let mut offset = 0;
    for (idx, &layer) in stack.iter().enumerate() {
        match layer {
            LayerKind::Ethernet => {
                link::write_ethernet(&mut data[offset..], src_mac, dst_mac, stack[idx + 1])
                    .ok_or_else(|| build_err("Ethernet"))?;
                offset += layers::ETHERNET_LEN;
            }
            LayerKind::Vlan(vid) => {
                link::write_vlan(&mut data[offset..], vid, stack[idx + 1])
                    .ok_or_else(|| build_err("VLAN"))?;
                offset += layers::VLAN_LEN;
            }
            LayerKind::Mpls(label) => {
                let bottom = !matches!(stack.get(idx + 1), Some(LayerKind::Mpls(_)));
                link::write_mpls(&mut data[offset..], label, bottom, TTL)
                    .ok_or_else(|| build_err("MPLS"))?;
                offset += layers::MPLS_LEN;
            }
            LayerKind::Ipv4 => {
                let len = total_len - offset;
                let mut ip_packet = MutableIpv4Packet::new(&mut data[offset..])
                    .ok_or_else(|| build_err("IPv4"))?;
                ip_packet.set_version(4);
                ip_packet.set_header_length(5);
                ip_packet.set_total_length(len as u16);
                ip_packet.set_identification(rng.next_u32() as u16);
                ip_packet.set_ttl(TTL);
                ip_packet.set_next_level_protocol(IpNextHeaderProtocol::new(proto_number));
                let (src, dst) = ipv4_pair(src_ip, dst_ip)?;
                ip_packet.set_source(src);
                ip_packet.set_destination(dst);
                ip_packet.set_checksum(ipv4::checksum(&ip_packet.to_immutable()));
                offset += layers::IPV4_LEN;
            }
            LayerKind::Ipv6 => {
                let mut ip_packet = MutableIpv6Packet::new(&mut data[offset..])
                    .ok_or_else(|| build_err("IPv6"))?;
                ip_packet.set_version(6);
                ip_packet.set_payload_length((total_len - offset - layers::IPV6_LEN) as u16);
                ip_packet.set_next_header(IpNextHeaderProtocol::new(proto_number));
                ip_packet.set_hop_limit(TTL);
                let (src, dst) = ipv6_pair(src_ip, dst_ip)?;
                ip_packet.set_source(src);
                ip_packet.set_destination(dst);
                offset += layers::IPV6_LEN;
            }
            LayerKind::Tcp => {
                let state = tcp_state
                    .as_deref_mut()
                    .ok_or_else(|| Error::ProtocolBuild("TCP layer without state".to_string()))?;
                write_tcp(
                    &mut data[offset..],
                    direction,
                    src_port,
                    dst_port,
                    tcp_flags,
                    payload,
                    state,
                    src_ip,
                    dst_ip,
                    rng,
                )?;
                break;
            }
            LayerKind::Udp => {
                write_udp(&mut data[offset..], src_port, dst_port, payload, src_ip, dst_ip)?;
                break;
            }
            LayerKind::Icmp => {
                write_icmp(&mut data[offset..], direction, echo, payload)?;
                break;
            }
            LayerKind::Icmpv6 => {
                write_icmpv6(&mut data[offset..], direction, echo, payload, src_ip, dst_ip)?;
                break;
            }
            LayerKind::Dns | LayerKind::Http | LayerKind::Tls => {
                break;
            }
        }
    }

    Ok(data)
}

#[allow(clippy::too_many_arguments)]
fn write_tcp(
    buffer: &mut [u8],
    direction: PacketDirection,
    src_port: u16,
    dst_port: u16,
    flags: u8,
    payload: &[u8],
    state: &mut TcpFlowState,
    src_ip: IpAddr,
    dst_ip: IpAddr,
    rng: &mut Pcg32,
) -> Result<(), Error> {
    let mut tcp_packet = MutableTcpPacket::new(buffer).ok_or_else(|| build_err("TCP"))?;
    tcp_packet.set_source(src_port);
    tcp_packet.set_destination(dst_port);

    let syn = flags & TcpFlags::SYN != 0;
    let fin = flags & TcpFlags::FIN != 0;
    let consumed = if syn || fin {
        1u32
    } else {
        payload.len() as u32
    };
    match direction {
        PacketDirection::Forward => {
            tcp_packet.set_sequence(state.forward.0);
            if flags & TcpFlags::ACK != 0 {
                tcp_packet.set_acknowledgement(state.backward.0);
            }
            state.forward += consumed;
        }
        PacketDirection::Backward => {
            tcp_packet.set_sequence(state.backward.0);
            if flags & TcpFlags::ACK != 0 {
                tcp_packet.set_acknowledgement(state.forward.0);
            }
            state.backward += consumed;
        }
    }

    tcp_packet.set_payload(payload);
    tcp_packet.set_data_offset(5);

    let (window, cwr) = state.step_window(rng);
    tcp_packet.set_window(window);
    tcp_packet.set_flags(if cwr { flags | TcpFlags::CWR } else { flags });

    match (src_ip, dst_ip) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            tcp_packet.set_checksum(tcp::ipv4_checksum(&tcp_packet.to_immutable(), &src, &dst));
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            tcp_packet.set_checksum(tcp::ipv6_checksum(&tcp_packet.to_immutable(), &src, &dst));
        }
        _ => {
            return Err(Error::ProtocolBuild(
                "mixed address families in one flow".to_string(),
            ))
        }
    }
    Ok(())
}

fn write_udp(
    buffer: &mut [u8],
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
    src_ip: IpAddr,
    dst_ip: IpAddr,
) -> Result<(), Error> {
    let mut udp_packet = MutableUdpPacket::new(buffer).ok_or_else(|| build_err("UDP"))?;
    udp_packet.set_source(src_port);
    udp_packet.set_destination(dst_port);
    udp_packet.set_length((payload.len() + layers::UDP_LEN) as u16);
    udp_packet.set_payload(payload);

    match (src_ip, dst_ip) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            udp_packet.set_checksum(udp::ipv4_checksum(&udp_packet.to_immutable(), &src, &dst));
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            udp_packet.set_checksum(udp::ipv6_checksum(&udp_packet.to_immutable(), &src, &dst));
        }
        _ => {
            return Err(Error::ProtocolBuild(
                "mixed address families in one flow".to_string(),
            ))
        }
    }
    Ok(())
}

fn write_icmp(
    buffer: &mut [u8],
    direction: PacketDirection,
    echo: (u16, u16),
    payload: &[u8],
) -> Result<(), Error> {
    let mut icmp_packet = MutableIcmpPacket::new(buffer).ok_or_else(|| build_err("ICMP"))?;
    icmp_packet.set_icmp_type(match direction {
        PacketDirection::Forward => IcmpTypes::EchoRequest,
        PacketDirection::Backward => IcmpTypes::EchoReply,
    });
    icmp_packet.set_icmp_code(IcmpCode(0));
    icmp_packet.set_payload(&echo_body(echo, payload));
    icmp_packet.set_checksum(icmp::checksum(&icmp_packet.to_immutable()));
    Ok(())
}

fn write_icmpv6(
    buffer: &mut [u8],
    direction: PacketDirection,
    echo: (u16, u16),
    payload: &[u8],
    src_ip: IpAddr,
    dst_ip: IpAddr,
) -> Result<(), Error> {
    let mut icmp_packet = MutableIcmpv6Packet::new(buffer).ok_or_else(|| build_err("ICMPv6"))?;
    icmp_packet.set_icmpv6_type(match direction {
        PacketDirection::Forward => Icmpv6Types::EchoRequest,
        PacketDirection::Backward => Icmpv6Types::EchoReply,
    });
    icmp_packet.set_icmpv6_code(Icmpv6Code(0));
    icmp_packet.set_payload(&echo_body(echo, payload));
    let (src, dst) = ipv6_pair(src_ip, dst_ip)?;
    icmp_packet.set_checksum(icmpv6::checksum(&icmp_packet.to_immutable(), &src, &dst));
    Ok(())
}

/// Echo identifier and sequence, then the padding bytes.
fn echo_body(echo: (u16, u16), payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(4 + payload.len());
    body.extend_from_slice(&echo.0.to_be_bytes());
    body.extend_from_slice(&echo.1.to_be_bytes());
    body.extend_from_slice(payload);
    body
}

fn ipv4_pair(src: IpAddr, dst: IpAddr) -> Result<(Ipv4Addr, Ipv4Addr), Error> {
    match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => Ok((s, d)),
        _ => Err(Error::ProtocolBuild(
            "IPv4 layer with non-IPv4 addresses".to_string(),
        )),
    }
}

fn ipv6_pair(src: IpAddr, dst: IpAddr) -> Result<(Ipv6Addr, Ipv6Addr), Error> {
    match (src, dst) {
        (IpAddr::V6(s), IpAddr::V6(d)) => Ok((s, d)),
        _ => Err(Error::ProtocolBuild(
            "IPv6 layer with non-IPv6 addresses".to_string(),
        )),
    }
}
