//! Pcap serialization of the merged packet stream. A failed write leaves
//! no partial artifact behind.

use std::fs::OpenOptions;
use std::io::BufWriter;
use std::path::Path;

use pcap_file::pcap::{PcapPacket, PcapWriter};

use crate::error::Error;
use crate::structs::Packet;

/// Writes the ordered stream to `path`. Returns the number of packets
/// written.
pub fn write_pcap(
    path: &Path,
    packets: impl Iterator<Item = Packet>,
) -> Result<u64, Error> {
    log::trace!("saving capture into {}", path.display());
    match try_write(path, packets) {
        Ok(count) => Ok(count),
        Err(e) => {
            // no partial artifact on failure
            let _ = std::fs::remove_file(path);
            Err(e)
        }
    }
}

fn try_write(path: &Path, packets: impl Iterator<Item = Packet>) -> Result<u64, Error> {
    let file_out = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(|source| Error::Write {
            path: path.to_path_buf(),
            source,
        })?;
    let mut pcap_writer = PcapWriter::new(BufWriter::new(file_out))?;

    let mut count = 0u64;
    for packet in packets {
        pcap_writer.write_packet(&PcapPacket::new(
            packet.timestamp,
            packet.data.len() as u32,
            &packet.data,
        ))?;
        count += 1;
    }
    Ok(count)
}
