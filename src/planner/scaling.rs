//! Throughput scaling solve. Decides how much to compress time and, when
//! the compression cap is hit, how to shift the packet-size distribution
//! so the run still reaches the requested rate.

use crate::config::{GeneratorConfig, SizeBucket};
use crate::error::Error;

/// Aggregate shape of the sampled profile over one loop.
#[derive(Debug, Clone, Copy)]
pub struct ProfileVolume {
    pub packets: u64,
    pub bytes: u64,
    /// Seconds covered by one loop before any compression.
    pub span: f64,
}

impl ProfileVolume {
    pub fn mbps(&self) -> f64 {
        if self.span <= 0.0 {
            return 0.0;
        }
        self.bytes as f64 * 8.0 / self.span / 1e6
    }

    pub fn pps(&self) -> f64 {
        if self.span <= 0.0 {
            return 0.0;
        }
        self.packets as f64 / self.span
    }
}

/// Outcome of the solve: the factor all timestamps are divided by, and the
/// bucket table the size generator draws from.
#[derive(Debug, Clone)]
pub struct ScalingSolution {
    pub time_divisor: f64,
    pub buckets: Vec<SizeBucket>,
}

/// Picks scaling parameters for the run. Time compression is always tried
/// first; bucket adjustment only kicks in when `speed_max` caps it.
pub fn solve(volume: &ProfileVolume, config: &GeneratorConfig) -> Result<ScalingSolution, Error> {
    let mut divisor = config.speed_multiplier;
    let mut buckets = config.size_buckets.clone();

    if let Some(target) = config.mbps {
        let natural = volume.mbps();
        if natural <= 0.0 {
            return Err(Error::ScalingInfeasible(
                "profile carries no bytes, cannot scale to an mbps target".to_string(),
            ));
        }
        divisor = target / natural;
    } else if let Some(target) = config.pps {
        let natural = volume.pps();
        if natural <= 0.0 {
            return Err(Error::ScalingInfeasible(
                "profile carries no packets, cannot scale to a pps target".to_string(),
            ));
        }
        divisor = target / natural;
    }

    if let Some(required) = config.mbps_required {
        let natural = volume.mbps();
        if natural <= 0.0 {
            return Err(Error::ScalingInfeasible(
                "profile carries no bytes, cannot reach the required rate".to_string(),
            ));
        }
        let needed = required / natural;
        if needed <= config.speed_max {
            divisor = needed.max(f64::MIN_POSITIVE);
        } else {
            // compression is capped; make packets bigger instead
            divisor = config.speed_max;
            let pps = volume.pps() * divisor;
            let mean = required * 1e6 / (8.0 * pps);
            buckets = project_buckets(&buckets, mean)?;
            let achieved_mean: f64 = buckets
                .iter()
                .map(|b| b.probability * b.midpoint() as f64)
                .sum();
            let achieved = pps * achieved_mean * 8.0 / 1e6;
            if (achieved - required).abs() / required > config.mbps_accuracy {
                return Err(Error::ScalingInfeasible(format!(
                    "best achievable rate {achieved:.1} mbps misses the required \
                     {required:.1} mbps beyond the {:.0}% tolerance",
                    config.mbps_accuracy * 100.0
                )));
            }
        }
    }

    if !divisor.is_finite() || divisor <= 0.0 {
        return Err(Error::ScalingInfeasible(format!(
            "computed time divisor {divisor} is not usable"
        )));
    }
    Ok(ScalingSolution {
        time_divisor: divisor,
        buckets,
    })
}

/// Least-squares projection of the bucket probabilities onto the plane
/// where the mean packet size equals `target_mean`, staying on the
/// probability simplex. Negative components are clipped iteratively and
/// the remaining ones re-solved.
pub fn project_buckets(buckets: &[SizeBucket], target_mean: f64) -> Result<Vec<SizeBucket>, Error> {
    let mids: Vec<f64> = buckets.iter().map(|b| b.midpoint() as f64).collect();
    let smallest = mids.iter().cloned().fold(f64::INFINITY, f64::min);
    let largest = mids.iter().cloned().fold(0.0f64, f64::max);
    if target_mean < smallest || target_mean > largest {
        return Err(Error::ScalingInfeasible(format!(
            "required mean packet size {target_mean:.0} is outside the \
             achievable range [{smallest:.0}, {largest:.0}]"
        )));
    }

    let mut probs: Vec<f64> = buckets.iter().map(|b| b.probability).collect();
    let mut active: Vec<bool> = vec![true; buckets.len()];

    loop {
        if active.iter().filter(|a| **a).count() < 2 {
            return Err(Error::ScalingInfeasible(
                "bucket projection degenerated to a single bucket".to_string(),
            ));
        }

        // solve for the two Lagrange multipliers over the active set
        let (mut s0, mut s1, mut s2, mut sp, mut spm) = (0.0, 0.0, 0.0, 0.0, 0.0);
        for i in 0..probs.len() {
            if active[i] {
                s0 += 1.0;
                s1 += mids[i];
                s2 += mids[i] * mids[i];
                sp += probs[i];
                spm += probs[i] * mids[i];
            }
        }
        let rhs1 = 1.0 - sp;
        let rhs2 = target_mean - spm;
        let det = s0 * s2 - s1 * s1;
        if det.abs() < 1e-9 {
            return Err(Error::ScalingInfeasible(
                "bucket midpoints are degenerate, projection has no solution".to_string(),
            ));
        }
        let a = (rhs1 * s2 - s1 * rhs2) / det;
        let b = (s0 * rhs2 - s1 * rhs1) / det;

        let mut worst: Option<(usize, f64)> = None;
        for i in 0..probs.len() {
            if active[i] {
                let adjusted = probs[i] + a + b * mids[i];
                if adjusted < -1e-9 && worst.map(|(_, w)| adjusted < w).unwrap_or(true) {
                    worst = Some((i, adjusted));
                }
            }
        }

        match worst {
            Some((i, _)) => {
                active[i] = false;
                probs[i] = 0.0;
            }
            None => {
                for i in 0..probs.len() {
                    if active[i] {
                        probs[i] = (probs[i] + a + b * mids[i]).max(0.0);
                    }
                }
                break;
            }
        }
    }

    Ok(buckets
        .iter()
        .zip(probs)
        .map(|(bucket, probability)| SizeBucket {
            lo: bucket.lo,
            hi: bucket.hi,
            probability,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::import_config;

    fn volume() -> ProfileVolume {
        // 1 MB over 8 seconds: 1 mbps, 125 pps
        ProfileVolume {
            packets: 1000,
            bytes: 1_000_000,
            span: 8.0,
        }
    }

    #[test]
    fn speed_multiplier_passes_through() {
        let mut config = import_config("").unwrap();
        config.speed_multiplier = 4.0;
        let solution = solve(&volume(), &config).unwrap();
        assert_eq!(solution.time_divisor, 4.0);
        assert_eq!(solution.buckets.len(), config.size_buckets.len());
    }

    #[test]
    fn mbps_target_sets_the_divisor() {
        let mut config = import_config("").unwrap();
        config.mbps = Some(10.0);
        let solution = solve(&volume(), &config).unwrap();
        assert!((solution.time_divisor - 10.0).abs() < 1e-9);
    }

    #[test]
    fn threshold_mode_prefers_time_compression() {
        let mut config = import_config("").unwrap();
        config.mbps_required = Some(50.0);
        config.speed_max = 100.0;
        let solution = solve(&volume(), &config).unwrap();
        assert!((solution.time_divisor - 50.0).abs() < 1e-9);
        // buckets untouched when compression suffices
        for (a, b) in solution.buckets.iter().zip(&config.size_buckets) {
            assert_eq!(a.probability, b.probability);
        }
    }

    #[test]
    fn threshold_mode_adjusts_buckets_when_capped() {
        let mut config = import_config("").unwrap();
        config.mbps_required = Some(30.0);
        config.speed_max = 25.0;
        let solution = solve(&volume(), &config).unwrap();
        assert_eq!(solution.time_divisor, 25.0);
        let sum: f64 = solution.buckets.iter().map(|b| b.probability).sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert!(solution.buckets.iter().all(|b| b.probability >= 0.0));
        // the mean moved to cover the rate the cap left on the table
        let mean: f64 = solution
            .buckets
            .iter()
            .map(|b| b.probability * b.midpoint() as f64)
            .sum();
        let pps = 125.0 * 25.0;
        let achieved = pps * mean * 8.0 / 1e6;
        assert!((achieved - 30.0).abs() / 30.0 < config.mbps_accuracy);
    }

    #[test]
    fn infeasible_required_rate_is_reported() {
        let mut config = import_config("").unwrap();
        // even at max compression and maximum-size packets this is too much
        config.mbps_required = Some(1_000_000.0);
        config.speed_max = 2.0;
        assert!(matches!(
            solve(&volume(), &config),
            Err(Error::ScalingInfeasible(_))
        ));
    }

    #[test]
    fn projection_hits_the_target_mean() {
        let config = import_config("").unwrap();
        let projected = project_buckets(&config.size_buckets, 900.0).unwrap();
        let mean: f64 = projected
            .iter()
            .map(|b| b.probability * b.midpoint() as f64)
            .sum();
        assert!((mean - 900.0).abs() < 1.0);
        let sum: f64 = projected.iter().map(|b| b.probability).sum();
        assert!((sum - 1.0).abs() < 1e-6);
    }

    #[test]
    fn projection_rejects_unreachable_means() {
        let config = import_config("").unwrap();
        assert!(project_buckets(&config.size_buckets, 20_000.0).is_err());
        assert!(project_buckets(&config.size_buckets, 10.0).is_err());
    }
}
