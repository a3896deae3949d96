use crate::error::Error;
use crate::structs::LayerKind;

pub mod dns;
pub mod http;
pub mod link;
pub mod tls;

pub const ETHERNET_LEN: usize = 14;
pub const VLAN_LEN: usize = 4;
pub const MPLS_LEN: usize = 4;
pub const IPV4_LEN: usize = 20;
pub const IPV6_LEN: usize = 40;
pub const TCP_LEN: usize = 20;
pub const UDP_LEN: usize = 8;
pub const ICMP_LEN: usize = 8;

/// Worst-case link-layer overhead (Ethernet + VLAN + MPLS), used to bound
/// frame sizes against the MTU.
pub const MAX_LINK_OVERHEAD: usize = ETHERNET_LEN + VLAN_LEN + MPLS_LEN;

/// Header bytes a single layer consumes. Application layers have no fixed
/// header; their bytes live in the payload budget.
pub fn layer_overhead(layer: LayerKind) -> usize {
    match layer {
        LayerKind::Ethernet => ETHERNET_LEN,
        LayerKind::Vlan(_) => VLAN_LEN,
        LayerKind::Mpls(_) => MPLS_LEN,
        LayerKind::Ipv4 => IPV4_LEN,
        LayerKind::Ipv6 => IPV6_LEN,
        LayerKind::Tcp => TCP_LEN,
        LayerKind::Udp => UDP_LEN,
        LayerKind::Icmp | LayerKind::Icmpv6 => ICMP_LEN,
        LayerKind::Dns | LayerKind::Http | LayerKind::Tls => 0,
    }
}

/// Total header bytes of a stack: the per-packet size floor.
pub fn stack_overhead(stack: &[LayerKind]) -> usize {
    stack.iter().map(|&l| layer_overhead(l)).sum()
}

/// Link-layer bytes of a stack. The MTU bounds everything above the link
/// layer, so the frame ceiling is `mtu + link_overhead`.
pub fn link_overhead(stack: &[LayerKind]) -> usize {
    stack
        .iter()
        .filter(|l| l.is_link())
        .map(|&l| layer_overhead(l))
        .sum()
}

/// Checks that a stack is a buildable composition. Runs at flow-plan
/// validation, before any generation starts.
pub fn validate_stack(stack: &[LayerKind]) -> Result<(), Error> {
    let mut iter = stack.iter().copied().peekable();

    if iter.next() != Some(LayerKind::Ethernet) {
        return Err(Error::ProtocolBuild(format!(
            "stack {stack:?} must start with an Ethernet layer"
        )));
    }
    while matches!(iter.peek(), Some(LayerKind::Vlan(_))) {
        iter.next();
    }
    while matches!(iter.peek(), Some(LayerKind::Mpls(_))) {
        iter.next();
    }

    let l3 = iter.next().filter(|l| l.is_l3()).ok_or_else(|| {
        Error::ProtocolBuild(format!("stack {stack:?} has no network layer"))
    })?;
    let l4 = iter.next().filter(|l| l.is_l4()).ok_or_else(|| {
        Error::ProtocolBuild(format!("stack {stack:?} has no transport layer"))
    })?;

    match (l3, l4) {
        (LayerKind::Ipv4, LayerKind::Icmpv6) => {
            return Err(Error::ProtocolBuild("ICMPv6 over IPv4".to_string()));
        }
        (LayerKind::Ipv6, LayerKind::Icmp) => {
            return Err(Error::ProtocolBuild("ICMP over IPv6".to_string()));
        }
        _ => {}
    }

    if let Some(app) = iter.next() {
        if !app.is_app() {
            return Err(Error::ProtocolBuild(format!(
                "unexpected layer {app:?} above the transport layer"
            )));
        }
        match (app, l4) {
            (LayerKind::Tls, LayerKind::Tcp) => {}
            (LayerKind::Tls, _) => {
                return Err(Error::ProtocolBuild(
                    "TLS requires a TCP transport layer".to_string(),
                ));
            }
            (LayerKind::Dns | LayerKind::Http, LayerKind::Tcp | LayerKind::Udp) => {}
            (app, l4) => {
                return Err(Error::ProtocolBuild(format!("{app:?} over {l4:?}")));
            }
        }
    }

    if let Some(extra) = iter.next() {
        return Err(Error::ProtocolBuild(format!(
            "trailing layer {extra:?} in stack {stack:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use LayerKind::*;

    #[test]
    fn accepts_common_stacks() {
        validate_stack(&[Ethernet, Ipv4, Tcp]).unwrap();
        validate_stack(&[Ethernet, Vlan(5), Ipv6, Udp, Dns]).unwrap();
        validate_stack(&[Ethernet, Mpls(16), Ipv4, Tcp, Tls]).unwrap();
        validate_stack(&[Ethernet, Vlan(1), Mpls(16), Ipv4, Udp]).unwrap();
        validate_stack(&[Ethernet, Ipv4, Icmp]).unwrap();
        validate_stack(&[Ethernet, Ipv6, Icmpv6]).unwrap();
    }

    #[test]
    fn rejects_app_without_transport() {
        assert!(validate_stack(&[Ethernet, Ipv4, Icmp, Dns]).is_err());
        assert!(validate_stack(&[Ethernet, Ipv4]).is_err());
    }

    #[test]
    fn rejects_tls_over_udp() {
        assert!(matches!(
            validate_stack(&[Ethernet, Ipv4, Udp, Tls]),
            Err(Error::ProtocolBuild(_))
        ));
    }

    #[test]
    fn rejects_mismatched_icmp_version() {
        assert!(validate_stack(&[Ethernet, Ipv4, Icmpv6]).is_err());
        assert!(validate_stack(&[Ethernet, Ipv6, Icmp]).is_err());
    }

    #[test]
    fn rejects_link_after_network() {
        assert!(validate_stack(&[Ethernet, Ipv4, Vlan(1), Tcp]).is_err());
        assert!(validate_stack(&[Vlan(1), Ethernet, Ipv4, Tcp]).is_err());
    }

    #[test]
    fn overhead_matches_layer_sum() {
        assert_eq!(stack_overhead(&[Ethernet, Ipv4, Tcp]), 54);
        assert_eq!(stack_overhead(&[Ethernet, Vlan(1), Ipv6, Udp]), 66);
        assert_eq!(link_overhead(&[Ethernet, Vlan(1), Mpls(2), Ipv4, Udp]), 22);
    }
}
