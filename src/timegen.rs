use rand_core::RngCore;
use rand_distr::{Distribution, Uniform};
use std::time::Duration;

/// Intra-flow packet timestamps over `[0, duration]`, relative to the flow
/// start. The first packet sits at 0 and the last at `duration`; interior
/// packets sit on an even grid with bounded jitter that can never break
/// monotonicity or escape the flow's span.
pub fn generate_timestamps(rng: &mut impl RngCore, count: u64, duration: Duration) -> Vec<Duration> {
    match count {
        0 => Vec::new(),
        1 => vec![Duration::ZERO],
        _ => {
            let nanos = duration.as_nanos() as u64;
            let gap = nanos / (count - 1);
            // jitter stays within a quarter gap on each side, so
            // neighbouring points cannot cross
            let jitter = if gap >= 4 {
                Some(Uniform::new_inclusive(-(gap as i64 / 4), gap as i64 / 4))
            } else {
                None
            };
            let mut out = Vec::with_capacity(count as usize);
            out.push(Duration::ZERO);
            for i in 1..count - 1 {
                let base = i * gap;
                let offset = jitter.as_ref().map(|j| j.sample(rng)).unwrap_or(0);
                let ts = (base as i64 + offset).max(0) as u64;
                out.push(Duration::from_nanos(ts.min(nanos)));
            }
            out.push(duration);
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::SeedableRng;
    use rand_pcg::Pcg32;

    #[test]
    fn single_packet_emits_start_only() {
        let mut rng = Pcg32::seed_from_u64(0);
        let ts = generate_timestamps(&mut rng, 1, Duration::from_secs(10));
        assert_eq!(ts, vec![Duration::ZERO]);
    }

    #[test]
    fn endpoints_pin_start_and_duration() {
        let mut rng = Pcg32::seed_from_u64(1);
        let d = Duration::from_millis(1500);
        let ts = generate_timestamps(&mut rng, 10, d);
        assert_eq!(ts.first(), Some(&Duration::ZERO));
        assert_eq!(ts.last(), Some(&d));
    }

    #[test]
    fn timestamps_monotonic_and_bounded() {
        let mut rng = Pcg32::seed_from_u64(2);
        let d = Duration::from_secs(3);
        let ts = generate_timestamps(&mut rng, 1000, d);
        for pair in ts.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
        assert!(ts.iter().all(|&t| t <= d));
    }

    #[test]
    fn zero_duration_flow_collapses_to_start() {
        let mut rng = Pcg32::seed_from_u64(3);
        let ts = generate_timestamps(&mut rng, 5, Duration::ZERO);
        assert!(ts.iter().all(|&t| t == Duration::ZERO));
    }
}
