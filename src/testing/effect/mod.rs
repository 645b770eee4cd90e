//! Effect-size bounds oriented by the direction of the effect.

/// Confidence bounds relabelled relative to the sign of the fold change.
///
/// `inner` is the bound closer to zero in the direction of the effect, i.e. the
/// conservative estimate of how large the effect is; `outer` is the other one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrientedInterval {
    pub inner: f64,
    pub outer: f64,
}

/// Pick the inner and outer bound for a fold change and its interval.
///
/// An undefined fold change gives `0` for both. A positive fold change takes
/// `ci_lo` as inner; zero or negative takes `ci_hi`.
pub fn orient_interval(fold_change: Option<f64>, ci_hi: f64, ci_lo: f64) -> OrientedInterval {
    match fold_change {
        Some(fc) if !fc.is_nan() => {
            if fc > 0.0 {
                OrientedInterval {
                    inner: ci_lo,
                    outer: ci_hi,
                }
            } else {
                OrientedInterval {
                    inner: ci_hi,
                    outer: ci_lo,
                }
            }
        }
        _ => OrientedInterval {
            inner: 0.0,
            outer: 0.0,
        },
    }
}
