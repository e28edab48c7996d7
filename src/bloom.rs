//! Bloom-filter parameter math, shared with the frequency filter's sizing.
//!
//! Notation follows the usual derivation: `N` expected distinct items, `M`
//! counter (or bit) positions, `P` false-positive probability, `K` hash
//! positions per key.

/// ln² 2
const LN2_SQUARED: f64 = 0.480_453_013_918_201_4;

/// Hash positions needed to reach false-positive probability `p`.
pub fn keys_for_probability(p: f64) -> f64 {
    -p.log2()
}

/// Positions needed for `n` items at false-positive probability `p`.
pub fn params_m(n: f64, p: f64) -> f64 {
    -(n * p.ln()) / LN2_SQUARED
}

/// False-positive probability of `m` positions holding `n` items.
pub fn params_p(n: f64, m: f64) -> f64 {
    std::f64::consts::E.powf(-LN2_SQUARED * m / n)
}

#[cfg(test)]
mod tests {
    use super::{keys_for_probability, params_m, params_p};

    fn assert_within_1pct(expected: f64, actual: f64) {
        let err = ((actual - expected) / expected).abs();
        assert!(
            err < 0.01,
            "expected {expected}, got {actual} (relative error {err})"
        );
    }

    #[test]
    fn parameter_table() {
        // (N, P, M, K)
        let params = [
            (100.0, 0.01, 958.0, 6.643_856_189_77),
            (1000.0, 0.001, 14377.0, 9.965_784_284_66),
            (2_718_281.0, 0.031_415_9, 19_578_296.0, 4.992_361_278_9),
        ];
        for (n, p, m, k) in params {
            assert_within_1pct(k, keys_for_probability(p));
            assert_within_1pct(m, params_m(n, p));
            assert_within_1pct(p, params_p(n, m));
        }
    }
}
