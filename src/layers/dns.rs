use rand_core::RngCore;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Word corpus for generated domain names. Kept small on purpose: names
/// only need to look plausible, not be unique.
const WORDS: [&str; 32] = [
    "alder", "basil", "cedar", "delta", "ember", "fjord", "gale", "harbor", "iris", "juniper",
    "kelp", "lagoon", "maple", "nettle", "ocean", "pine", "quartz", "reef", "sable", "tundra",
    "umber", "vale", "willow", "xenon", "yarrow", "zephyr", "brook", "crag", "dune", "fern",
    "grove", "heath",
];

const TLDS: [&str; 4] = ["com", "net", "org", "io"];

pub const TYPE_A: u16 = 1;
pub const TYPE_AAAA: u16 = 28;

/// Draws a two-word domain name from the corpus.
pub fn generate_name(rng: &mut impl RngCore) -> String {
    let first = WORDS[rng.next_u32() as usize % WORDS.len()];
    let second = WORDS[rng.next_u32() as usize % WORDS.len()];
    let tld = TLDS[rng.next_u32() as usize % TLDS.len()];
    format!("{first}-{second}.{tld}")
}

/// DNS query in wire format: header, one question, no answers.
pub fn build_query(id: u16, name: &str, qtype: u16) -> Vec<u8> {
    let mut message = Vec::with_capacity(12 + name.len() + 6);
    message.extend_from_slice(&id.to_be_bytes());
    message.extend_from_slice(&0x0100u16.to_be_bytes()); // RD
    message.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    message.extend_from_slice(&[0; 6]); // AN/NS/AR
    write_name(&mut message, name);
    message.extend_from_slice(&qtype.to_be_bytes());
    message.extend_from_slice(&1u16.to_be_bytes()); // IN
    message
}

/// DNS response mirroring a query: same id and question, one address
/// answer pointing back at the question name via compression.
pub fn build_response(id: u16, name: &str, qtype: u16, v4: Ipv4Addr, v6: Ipv6Addr) -> Vec<u8> {
    let mut message = Vec::with_capacity(12 + name.len() + 34);
    message.extend_from_slice(&id.to_be_bytes());
    message.extend_from_slice(&0x8180u16.to_be_bytes()); // QR, RD, RA
    message.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    message.extend_from_slice(&1u16.to_be_bytes()); // ANCOUNT
    message.extend_from_slice(&[0; 4]); // NS/AR
    write_name(&mut message, name);
    message.extend_from_slice(&qtype.to_be_bytes());
    message.extend_from_slice(&1u16.to_be_bytes());
    // answer: pointer to offset 12 (the question name)
    message.extend_from_slice(&0xc00cu16.to_be_bytes());
    message.extend_from_slice(&qtype.to_be_bytes());
    message.extend_from_slice(&1u16.to_be_bytes());
    message.extend_from_slice(&300u32.to_be_bytes()); // TTL
    match qtype {
        TYPE_AAAA => {
            message.extend_from_slice(&16u16.to_be_bytes());
            message.extend_from_slice(&v6.octets());
        }
        _ => {
            message.extend_from_slice(&4u16.to_be_bytes());
            message.extend_from_slice(&v4.octets());
        }
    }
    message
}

fn write_name(message: &mut Vec<u8>, name: &str) {
    for label in name.split('.') {
        message.push(label.len() as u8);
        message.extend_from_slice(label.as_bytes());
    }
    message.push(0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::SeedableRng;
    use rand_pcg::Pcg32;

    /// Minimal wire-format decode of the question section, enough to prove
    /// the message is parseable.
    fn decode_question(message: &[u8]) -> (u16, String, u16) {
        let id = u16::from_be_bytes([message[0], message[1]]);
        let qdcount = u16::from_be_bytes([message[4], message[5]]);
        assert_eq!(qdcount, 1);
        let mut pos = 12;
        let mut labels = vec![];
        loop {
            let len = message[pos] as usize;
            pos += 1;
            if len == 0 {
                break;
            }
            labels.push(String::from_utf8(message[pos..pos + len].to_vec()).unwrap());
            pos += len;
        }
        let qtype = u16::from_be_bytes([message[pos], message[pos + 1]]);
        (id, labels.join("."), qtype)
    }

    #[test]
    fn query_round_trips_through_decode() {
        let message = build_query(0x1234, "alder-brook.net", TYPE_A);
        let (id, name, qtype) = decode_question(&message);
        assert_eq!(id, 0x1234);
        assert_eq!(name, "alder-brook.net");
        assert_eq!(qtype, TYPE_A);
    }

    #[test]
    fn response_mirrors_query_id_and_question() {
        let v4 = Ipv4Addr::new(10, 1, 2, 3);
        let v6 = Ipv6Addr::LOCALHOST;
        let message = build_response(0xbeef, "pine-vale.io", TYPE_A, v4, v6);
        let (id, name, _) = decode_question(&message);
        assert_eq!(id, 0xbeef);
        assert_eq!(name, "pine-vale.io");
        // QR bit set
        assert_eq!(message[2] & 0x80, 0x80);
        // ANCOUNT = 1
        assert_eq!(u16::from_be_bytes([message[6], message[7]]), 1);
        // answer rdata is the IPv4 address
        assert_eq!(&message[message.len() - 4..], &v4.octets());
    }

    #[test]
    fn aaaa_response_carries_ipv6_rdata() {
        let v6: Ipv6Addr = "fd00::42".parse().unwrap();
        let message = build_response(1, "kelp-dune.org", TYPE_AAAA, Ipv4Addr::UNSPECIFIED, v6);
        assert_eq!(&message[message.len() - 16..], &v6.octets());
    }

    #[test]
    fn generated_names_are_dns_safe() {
        let mut rng = Pcg32::seed_from_u64(9);
        for _ in 0..100 {
            let name = generate_name(&mut rng);
            assert!(name.split('.').all(|l| !l.is_empty() && l.len() < 64));
        }
    }
}
