//! Traffic meter: atomic counters shared by all workers, a progress bar
//! fed from them, and the final run summary.

use indicatif::HumanBytes;
use indicatif::{ProgressBar, ProgressState, ProgressStyle};
use serde::Serialize;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::structs::Packet;

pub struct Meter {
    pub packets_target: Option<u64>,
    pub packets_counter: AtomicU64,
    pub bytes_counter: AtomicU64,
    pub flows_counter: AtomicU64,
    pub progress_bar: ProgressBar,
}

impl Meter {
    pub fn new(packets_target: Option<u64>) -> Self {
        Meter {
            packets_counter: AtomicU64::new(0),
            bytes_counter: AtomicU64::new(0),
            flows_counter: AtomicU64::new(0),
            progress_bar: ProgressBar::new(packets_target.unwrap_or(0)),
            packets_target,
        }
    }

    /// Called once per assembled flow, from any worker.
    pub fn record_flow(&self, packets: &[Packet]) {
        self.flows_counter.fetch_add(1, Ordering::Relaxed);
        self.packets_counter
            .fetch_add(packets.len() as u64, Ordering::Relaxed);
        self.bytes_counter.fetch_add(
            packets.iter().map(|p| p.data.len()).sum::<usize>() as u64,
            Ordering::Relaxed,
        );
    }

    pub fn packets(&self) -> u64 {
        self.packets_counter.load(Ordering::Relaxed)
    }

    /// Final summary over the capture's covered span.
    pub fn summary(
        &self,
        duration: Duration,
        mbps_required: Option<f64>,
        mbps_accuracy: f64,
    ) -> Summary {
        let packets = self.packets_counter.load(Ordering::Relaxed);
        let bytes = self.bytes_counter.load(Ordering::Relaxed);
        let flows = self.flows_counter.load(Ordering::Relaxed);
        let secs = duration.as_secs_f64();
        let pps = if secs > 0.0 { packets as f64 / secs } else { 0.0 };
        let mbps = if secs > 0.0 {
            bytes as f64 * 8.0 / secs / 1e6
        } else {
            0.0
        };
        let shortfall = mbps_required
            .map(|required| (required - mbps) / required > mbps_accuracy)
            .unwrap_or(false);
        Summary {
            packets,
            bytes,
            flows,
            pps,
            mbps,
            duration: secs,
            throughput_shortfall: shortfall,
        }
    }
}

/// Counters of one finished run, serialized as the JSON report.
#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    #[serde(rename = "PACKETS")]
    pub packets: u64,
    #[serde(rename = "BYTES")]
    pub bytes: u64,
    #[serde(rename = "FLOWS")]
    pub flows: u64,
    #[serde(rename = "PACKETS/S")]
    pub pps: f64,
    #[serde(rename = "MB/S")]
    pub mbps: f64,
    #[serde(rename = "DURATION")]
    pub duration: f64,
    #[serde(rename = "THROUGHPUT_SHORTFALL")]
    pub throughput_shortfall: bool,
}

/// Drives the progress bar until the packet target is reached. Runs on its
/// own thread; returns when generation is complete.
pub fn run(meter: Arc<Meter>) {
    let Some(target) = meter.packets_target else {
        return;
    };
    let meter2 = Arc::clone(&meter);
    if let Ok(style) = ProgressStyle::with_template(
        "{spinner:.green} Generation [{throughput}] [{wide_bar}] ({eta})",
    ) {
        meter.progress_bar.set_style(style.with_key(
            "throughput",
            move |state: &ProgressState, w: &mut dyn Write| {
                if !state.elapsed().is_zero() {
                    let bc = meter2.bytes_counter.load(Ordering::Relaxed);
                    let throughput = (bc as f64) / state.elapsed().as_secs_f64();
                    let _ = write!(w, "{}/s", HumanBytes(throughput as u64));
                }
            },
        ));
    }

    loop {
        let c = meter.packets_counter.load(Ordering::Relaxed);
        meter.progress_bar.set_position(c);
        if c >= target {
            meter.progress_bar.finish();
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(len: usize) -> Packet {
        Packet {
            timestamp: Duration::ZERO,
            data: vec![0u8; len],
        }
    }

    #[test]
    fn counters_accumulate() {
        let meter = Meter::new(None);
        meter.record_flow(&[packet(100), packet(200)]);
        meter.record_flow(&[packet(50)]);
        let summary = meter.summary(Duration::from_secs(2), None, 0.05);
        assert_eq!(summary.packets, 3);
        assert_eq!(summary.bytes, 350);
        assert_eq!(summary.flows, 2);
        assert!((summary.pps - 1.5).abs() < 1e-9);
        assert!((summary.mbps - 350.0 * 8.0 / 2.0 / 1e6).abs() < 1e-9);
        assert!(!summary.throughput_shortfall);
    }

    #[test]
    fn shortfall_flagged_when_rate_misses_requirement() {
        let meter = Meter::new(None);
        meter.record_flow(&[packet(1000)]);
        // 1000 bytes over 1 s is 0.008 mbps, far below 100 mbps required
        let summary = meter.summary(Duration::from_secs(1), Some(100.0), 0.05);
        assert!(summary.throughput_shortfall);
        let relaxed = meter.summary(Duration::from_secs(1), Some(0.008), 0.05);
        assert!(!relaxed.throughput_shortfall);
    }

    #[test]
    fn summary_serializes_with_report_field_names() {
        let meter = Meter::new(None);
        meter.record_flow(&[packet(64)]);
        let summary = meter.summary(Duration::from_secs(1), None, 0.05);
        let json = serde_json::to_string(&summary).unwrap();
        assert!(json.contains("\"PACKETS\":1"));
        assert!(json.contains("\"MB/S\""));
        assert!(json.contains("\"DURATION\""));
    }
}
