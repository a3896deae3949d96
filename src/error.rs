use std::path::PathBuf;

/// Fatal error classes. Any of these aborts the whole run: the engine never
/// publishes a partially valid capture.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Malformed flow profile or configuration
    #[error("format error: {0}")]
    Format(String),
    /// A field is syntactically valid but out of its expected bounds
    #[error("out of range: {0}")]
    Range(String),
    /// The requested throughput cannot be met given the packet-size and
    /// duration constraints
    #[error("scaling infeasible: {0}")]
    ScalingInfeasible(String),
    /// An address generator ran out of unique addresses
    #[error("address space exhausted: {kind} range {range} holds {capacity} addresses")]
    AddressSpaceExhausted {
        kind: &'static str,
        range: String,
        capacity: u64,
    },
    /// The layer combination requested for a flow is inconsistent
    #[error("protocol build error: {0}")]
    ProtocolBuild(String),
    /// Writing the capture artifact failed
    #[error("write error on {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// Pcap serialization failed
    #[error("pcap error: {0}")]
    Pcap(#[from] pcap_file::PcapError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn format(msg: impl Into<String>) -> Self {
        Error::Format(msg.into())
    }

    pub fn range(msg: impl Into<String>) -> Self {
        Error::Range(msg.into())
    }
}
