use pnet::util::MacAddr;
use pnet_packet::ethernet::{EtherType, EtherTypes, MutableEthernetPacket};
use pnet_packet::vlan::MutableVlanPacket;

use crate::structs::LayerKind;

/// Ethertype announcing the layer that follows in the stack.
pub fn ethertype_for(next: LayerKind) -> EtherType {
    match next {
        LayerKind::Vlan(_) => EtherTypes::Vlan,
        LayerKind::Mpls(_) => EtherTypes::Mpls,
        LayerKind::Ipv6 => EtherTypes::Ipv6,
        _ => EtherTypes::Ipv4,
    }
}

pub fn write_ethernet(
    buffer: &mut [u8],
    src_mac: MacAddr,
    dst_mac: MacAddr,
    next: LayerKind,
) -> Option<()> {
    let mut eth_packet = MutableEthernetPacket::new(buffer)?;
    eth_packet.set_source(src_mac);
    eth_packet.set_destination(dst_mac);
    eth_packet.set_ethertype(ethertype_for(next));
    Some(())
}

pub fn write_vlan(buffer: &mut [u8], vlan_id: u16, next: LayerKind) -> Option<()> {
    let mut vlan_packet = MutableVlanPacket::new(buffer)?;
    vlan_packet.set_priority_code_point(pnet_packet::vlan::ClassOfService::new(0));
    vlan_packet.set_drop_eligible_indicator(0);
    vlan_packet.set_vlan_identifier(vlan_id & 0x0fff);
    vlan_packet.set_ethertype(ethertype_for(next));
    Some(())
}

/// MPLS label stack entry: label(20) | traffic class(3) | bottom(1) | ttl(8).
/// No pnet view exists for MPLS, so the word is laid out by hand.
pub fn write_mpls(buffer: &mut [u8], label: u32, bottom_of_stack: bool, ttl: u8) -> Option<()> {
    if buffer.len() < super::MPLS_LEN {
        return None;
    }
    let word = (label & 0x000f_ffff) << 12 | u32::from(bottom_of_stack) << 8 | u32::from(ttl);
    buffer[..4].copy_from_slice(&word.to_be_bytes());
    Some(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ethernet_frame_layout() {
        let mut buffer = vec![0u8; 14];
        write_ethernet(
            &mut buffer,
            MacAddr::new(2, 0, 0, 0, 0, 1),
            MacAddr::new(2, 0, 0, 0, 0, 2),
            LayerKind::Ipv4,
        )
        .unwrap();
        assert_eq!(&buffer[0..6], &[2, 0, 0, 0, 0, 2]); // destination first
        assert_eq!(&buffer[6..12], &[2, 0, 0, 0, 0, 1]);
        assert_eq!(&buffer[12..14], &[0x08, 0x00]);
    }

    #[test]
    fn vlan_tag_carries_id_and_next_ethertype() {
        let mut buffer = vec![0u8; 4];
        write_vlan(&mut buffer, 100, LayerKind::Ipv6).unwrap();
        assert_eq!(u16::from_be_bytes([buffer[0], buffer[1]]) & 0x0fff, 100);
        assert_eq!(&buffer[2..4], &[0x86, 0xdd]);
    }

    #[test]
    fn mpls_entry_sets_bottom_bit() {
        let mut buffer = vec![0u8; 4];
        write_mpls(&mut buffer, 16, true, 64).unwrap();
        let word = u32::from_be_bytes(buffer[..4].try_into().unwrap());
        assert_eq!(word >> 12, 16);
        assert_eq!(word >> 8 & 1, 1);
        assert_eq!(word & 0xff, 64);
    }
}
