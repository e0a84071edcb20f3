//! Small sampling helpers shared by the engines.
//!
//! Parameter errors from `rand_distr` collapse to the distribution's centre so
//! callers never have to thread a `Result` through hot paths.

use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use rand_distr::{LogNormal, Normal, Triangular};

/// Gaussian sample; a non-positive `std_dev` returns `mean`.
pub fn gauss<R: Rng + ?Sized>(rng: &mut R, mean: f64, std_dev: f64) -> f64 {
    if !(std_dev > 0.0) {
        return mean;
    }
    Normal::new(mean, std_dev)
        .map(|d| d.sample(rng))
        .unwrap_or(mean)
}

/// Log-normal sample parameterised by the underlying normal.
pub fn lognormal<R: Rng + ?Sized>(rng: &mut R, mu: f64, sigma: f64) -> f64 {
    if !(sigma > 0.0) {
        return mu.exp();
    }
    LogNormal::new(mu, sigma)
        .map(|d| d.sample(rng))
        .unwrap_or_else(|_| mu.exp())
}

/// Triangular sample on `[min, max]` peaking at `mode`.
pub fn triangular<R: Rng + ?Sized>(rng: &mut R, min: f64, max: f64, mode: f64) -> f64 {
    if max <= min {
        return min;
    }
    let mode = mode.clamp(min, max);
    Triangular::new(min, max, mode)
        .map(|d| d.sample(rng))
        .unwrap_or(mode)
}

/// Pick an index according to `weights`; falls back to a uniform pick.
pub fn weighted_index<R: Rng + ?Sized>(rng: &mut R, weights: &[f64]) -> usize {
    if weights.is_empty() {
        return 0;
    }
    match WeightedIndex::new(weights) {
        Ok(dist) => dist.sample(rng),
        Err(_) => rng.gen_range(0..weights.len()),
    }
}

/// Weighted choice over `(item, weight)` pairs.
pub fn weighted_choice<'a, T, R: Rng + ?Sized>(rng: &mut R, items: &'a [(T, f64)]) -> Option<&'a T> {
    if items.is_empty() {
        return None;
    }
    let weights: Vec<f64> = items.iter().map(|(_, w)| *w).collect();
    items.get(weighted_index(rng, &weights)).map(|(item, _)| item)
}

/// Uniform sample on `[low, high]` that tolerates `low == high`.
pub fn uniform<R: Rng + ?Sized>(rng: &mut R, low: f64, high: f64) -> f64 {
    if high <= low {
        return low;
    }
    rng.gen_range(low..=high)
}

/// Integer sample on `[low, high]` that tolerates `low >= high`.
pub fn uniform_usize<R: Rng + ?Sized>(rng: &mut R, low: usize, high: usize) -> usize {
    if high <= low {
        return low;
    }
    rng.gen_range(low..=high)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_degenerate_parameters() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(gauss(&mut rng, 3.0, 0.0), 3.0);
        assert_eq!(uniform(&mut rng, 5.0, 5.0), 5.0);
        assert_eq!(uniform_usize(&mut rng, 9, 2), 9);
        assert_eq!(triangular(&mut rng, 4.0, 4.0, 4.0), 4.0);
        assert_eq!(weighted_index(&mut rng, &[]), 0);
    }

    #[test]
    fn test_weighted_choice_respects_zero_weight() {
        let mut rng = StdRng::seed_from_u64(2);
        let items = [("never", 0.0), ("always", 1.0)];
        for _ in 0..200 {
            assert_eq!(weighted_choice(&mut rng, &items), Some(&"always"));
        }
    }

    #[test]
    fn test_triangular_bounds() {
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..500 {
            let v = triangular(&mut rng, 100.0, 2000.0, 2000.0);
            assert!((100.0..=2000.0).contains(&v));
        }
    }
}
