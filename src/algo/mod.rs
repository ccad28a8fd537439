//! Statistical primitives used by the detectors.

pub mod chisq;
pub mod matrix;

/// Shannon entropy in nats over a set of counts.
pub fn shannon_entropy(counts: &[u64]) -> f64 {
    let total: u64 = counts.iter().sum();
    if total == 0 {
        return 0.0;
    }
    let total = total as f64;
    counts
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / total;
            -p * p.ln()
        })
        .sum()
}

/// Clip to a closed interval.
pub fn clip(x: f64, lo: f64, hi: f64) -> f64 {
    x.max(lo).min(hi)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entropy_uniform() {
        // Four equally likely outcomes: ln(4) nats.
        let h = shannon_entropy(&[5, 5, 5, 5]);
        assert!((h - 4.0f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn test_entropy_degenerate() {
        assert_eq!(shannon_entropy(&[10]), 0.0);
        assert_eq!(shannon_entropy(&[]), 0.0);
        assert_eq!(shannon_entropy(&[0, 0]), 0.0);
    }

    #[test]
    fn test_clip() {
        assert_eq!(clip(1.5, 0.0, 1.0), 1.0);
        assert_eq!(clip(-0.5, 0.0, 1.0), 0.0);
        assert_eq!(clip(0.25, 0.0, 1.0), 0.25);
    }
}
