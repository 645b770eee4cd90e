use statrs::distribution::{ChiSquared, ContinuousCDF, Normal, StudentsT};

// Past this many degrees of freedom the t distribution is treated as normal.
const NORMAL_DF: f64 = 1e6;

/// Two-sided p-value of a t statistic.
pub fn t_test_p_value(t_stat: f64, df: f64) -> f64 {
    if t_stat.is_nan() || df.is_nan() || df <= 0.0 {
        return 1.0;
    }
    if t_stat.is_infinite() {
        return 0.0;
    }
    let abs_t = t_stat.abs();
    let upper = if !df.is_finite() || df > NORMAL_DF {
        match Normal::new(0.0, 1.0) {
            Ok(normal) => 1.0 - normal.cdf(abs_t),
            Err(_) => return 1.0,
        }
    } else {
        match StudentsT::new(0.0, 1.0, df) {
            Ok(t_dist) => 1.0 - t_dist.cdf(abs_t),
            Err(_) => return 1.0,
        }
    };
    (2.0 * upper).clamp(0.0, 1.0)
}

/// Quantile of the standard t distribution, falling back to the normal for huge `df`.
pub fn t_quantile(p: f64, df: f64) -> Option<f64> {
    if p <= 0.0 || p >= 1.0 || p.is_nan() || df.is_nan() || df <= 0.0 {
        return None;
    }
    if !df.is_finite() || df > NORMAL_DF {
        Normal::new(0.0, 1.0).ok().map(|n| n.inverse_cdf(p))
    } else {
        StudentsT::new(0.0, 1.0, df).ok().map(|t| t.inverse_cdf(p))
    }
}

/// Upper tail probability of a chi-squared statistic.
pub fn chi_squared_p_value(statistic: f64, df: f64) -> f64 {
    if statistic.is_nan() || statistic <= 0.0 {
        return 1.0;
    }
    match ChiSquared::new(df) {
        Ok(chi) => (1.0 - chi.cdf(statistic)).clamp(0.0, 1.0),
        Err(_) => 1.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn t_p_values() {
        assert_relative_eq!(t_test_p_value(0.0, 10.0), 1.0, epsilon = 1e-12);
        // qt(0.975, 10) = 2.228139
        assert_relative_eq!(t_test_p_value(2.228139, 10.0), 0.05, epsilon = 1e-5);
        assert_relative_eq!(t_test_p_value(-2.228139, 10.0), 0.05, epsilon = 1e-5);
        assert_relative_eq!(t_test_p_value(1.959964, f64::INFINITY), 0.05, epsilon = 1e-5);
        assert_eq!(t_test_p_value(f64::INFINITY, 3.0), 0.0);
        assert_eq!(t_test_p_value(f64::NAN, 3.0), 1.0);
    }

    #[test]
    fn t_quantiles() {
        assert_relative_eq!(t_quantile(0.975, 10.0).unwrap(), 2.228139, epsilon = 1e-4);
        assert_relative_eq!(t_quantile(0.975, f64::INFINITY).unwrap(), 1.959964, epsilon = 1e-5);
        assert!(t_quantile(1.0, 5.0).is_none());
        assert!(t_quantile(0.5, 0.0).is_none());
    }

    #[test]
    fn chi_squared_tail() {
        // qchisq(0.95, 1) = 3.841459
        assert_relative_eq!(chi_squared_p_value(3.841459, 1.0), 0.05, epsilon = 1e-5);
        assert_eq!(chi_squared_p_value(0.0, 1.0), 1.0);
        assert_eq!(chi_squared_p_value(-2.0, 1.0), 1.0);
    }
}
