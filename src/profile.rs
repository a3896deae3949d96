use serde::Deserialize;
use std::io::Read;
use std::path::Path;

use crate::error::Error;
use crate::structs::{FlowProfileRecord, L3Protocol, L4Protocol};

// well-known destination ports driving application-layer selection
pub const PORT_DNS: u16 = 53;
pub const PORT_HTTP: u16 = 80;
pub const PORT_TLS: u16 = 443;

/// Raw CSV row as produced by the profile collector. Column order does not
/// matter; names do.
#[derive(Deserialize, Debug)]
struct ProfileRow {
    #[serde(rename = "START_TIME")]
    start_time: u64,
    #[serde(rename = "END_TIME")]
    end_time: u64,
    #[serde(rename = "L3_PROTO")]
    l3_proto: u16,
    #[serde(rename = "L4_PROTO")]
    l4_proto: u8,
    #[serde(rename = "SRC_PORT")]
    src_port: u16,
    #[serde(rename = "DST_PORT")]
    dst_port: u16,
    #[serde(rename = "PACKETS")]
    packets: u64,
    #[serde(rename = "BYTES")]
    bytes: u64,
    #[serde(rename = "PACKETS_REV")]
    packets_rev: u64,
    #[serde(rename = "BYTES_REV")]
    bytes_rev: u64,
}

pub fn read_profile_file(path: &Path) -> Result<Vec<FlowProfileRecord>, Error> {
    let file = std::fs::File::open(path)?;
    read_profile(file)
}

/// Parses the aggregated flow profile. The whole profile is materialized up
/// front: the planner needs random access for scaling.
pub fn read_profile(reader: impl Read) -> Result<Vec<FlowProfileRecord>, Error> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader);
    let mut records = Vec::new();
    for (index, row) in csv_reader.deserialize::<ProfileRow>().enumerate() {
        let line = index + 2; // header is line 1
        let row = row.map_err(|e| Error::format(format!("profile line {line}: {e}")))?;
        records.push(validate_row(row, line)?);
    }
    if records.is_empty() {
        return Err(Error::format("profile contains no flows".to_string()));
    }
    log::info!("Loaded {} flow records", records.len());
    Ok(records)
}

fn validate_row(row: ProfileRow, line: usize) -> Result<FlowProfileRecord, Error> {
    if row.end_time < row.start_time {
        return Err(Error::format(format!(
            "profile line {line}: negative duration (end {} before start {})",
            row.end_time, row.start_time
        )));
    }
    let l3 = L3Protocol::from_profile_id(row.l3_proto)
        .map_err(|e| Error::format(format!("profile line {line}: {e}")))?;
    let l4 = L4Protocol::from_profile_id(row.l4_proto)
        .map_err(|e| Error::format(format!("profile line {line}: {e}")))?;

    // totals must fit in u64; everything downstream adds them freely
    let total_packets = row
        .packets
        .checked_add(row.packets_rev)
        .ok_or_else(|| Error::range(format!("profile line {line}: packet count overflow")))?;
    row.bytes
        .checked_add(row.bytes_rev)
        .ok_or_else(|| Error::range(format!("profile line {line}: byte count overflow")))?;
    if total_packets == 0 {
        return Err(Error::range(format!(
            "profile line {line}: flow with zero packets"
        )));
    }
    // unidirectional flows are fine, but bytes without packets are not
    for (packets, bytes, dir) in [
        (row.packets, row.bytes, "forward"),
        (row.packets_rev, row.bytes_rev, "reverse"),
    ] {
        if packets == 0 && bytes > 0 {
            return Err(Error::range(format!(
                "profile line {line}: {dir} bytes without packets"
            )));
        }
        // IPv4 header floor; anything below cannot be a real packet
        let floor = packets.checked_mul(20).ok_or_else(|| {
            Error::range(format!(
                "profile line {line}: {dir} packet count {packets} overflows the byte floor"
            ))
        })?;
        if packets > 0 && bytes < floor {
            return Err(Error::range(format!(
                "profile line {line}: {dir} byte count {bytes} below minimum for {packets} packets"
            )));
        }
    }
    if !l4.uses_ports() && (row.src_port != 0 || row.dst_port != 0) {
        return Err(Error::range(format!(
            "profile line {line}: ports set on a {l4} flow"
        )));
    }

    Ok(FlowProfileRecord {
        start_time: row.start_time,
        end_time: row.end_time,
        l3,
        l4,
        src_port: row.src_port,
        dst_port: row.dst_port,
        packets: row.packets,
        bytes: row.bytes,
        packets_rev: row.packets_rev,
        bytes_rev: row.bytes_rev,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str =
        "START_TIME,END_TIME,L3_PROTO,L4_PROTO,SRC_PORT,DST_PORT,PACKETS,BYTES,PACKETS_REV,BYTES_REV\n";

    fn parse(rows: &str) -> Result<Vec<FlowProfileRecord>, Error> {
        read_profile(format!("{HEADER}{rows}").as_bytes())
    }

    #[test]
    fn parses_a_bidirectional_tcp_flow() {
        let records = parse("0,1500,4,6,45321,443,10,4200,8,3100\n").unwrap();
        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r.l3, L3Protocol::Ipv4);
        assert_eq!(r.l4, L4Protocol::TCP);
        assert_eq!(r.total_packets(), 18);
        assert_eq!(r.total_bytes(), 7300);
        assert_eq!(r.duration().as_millis(), 1500);
    }

    #[test]
    fn parses_unidirectional_icmp() {
        let records = parse("100,100,4,1,0,0,1,64,0,0\n").unwrap();
        assert_eq!(records[0].l4, L4Protocol::ICMP);
        assert_eq!(records[0].packets_rev, 0);
    }

    #[test]
    fn rejects_non_numeric_counts() {
        assert!(matches!(
            parse("0,1000,4,6,1,2,ten,400,0,0\n"),
            Err(Error::Format(_))
        ));
    }

    #[test]
    fn rejects_negative_duration() {
        assert!(matches!(
            parse("2000,1000,4,6,1,2,5,400,0,0\n"),
            Err(Error::Format(_))
        ));
    }

    #[test]
    fn rejects_unknown_protocol() {
        assert!(matches!(
            parse("0,1000,4,99,1,2,5,400,0,0\n"),
            Err(Error::Format(_))
        ));
    }

    #[test]
    fn rejects_bytes_below_packet_floor() {
        assert!(matches!(
            parse("0,1000,4,6,1,2,5,50,0,0\n"),
            Err(Error::Range(_))
        ));
    }

    #[test]
    fn rejects_overflowing_counts() {
        let max = u64::MAX;
        // forward plus reverse packets wrap u64
        assert!(matches!(
            parse(&format!("0,1000,4,6,1,2,{max},{max},1,40\n")),
            Err(Error::Range(_))
        ));
        // packet count wraps the 20-byte floor product
        let half = u64::MAX / 2;
        assert!(matches!(
            parse(&format!("0,1000,4,6,1,2,{half},{max},0,0\n")),
            Err(Error::Range(_))
        ));
    }

    #[test]
    fn rejects_ports_on_icmp() {
        assert!(matches!(
            parse("0,1000,4,1,5,0,5,400,0,0\n"),
            Err(Error::Range(_))
        ));
    }

    #[test]
    fn rejects_empty_profile() {
        assert!(matches!(parse(""), Err(Error::Format(_))));
    }
}
