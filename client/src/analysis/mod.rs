//! Sample statistics used by probes and result rendering

/// Summary of a set of RTT-like samples
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Statistics {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
}

/// `None` for an empty sample set
pub fn calculate_statistics(values: &[f64]) -> Option<Statistics> {
    if values.is_empty() {
        return None;
    }
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mean = mean(values)?;
    Some(Statistics {
        min,
        max,
        mean,
        stddev: stddev(values).unwrap_or(0.0),
    })
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Population standard deviation
pub fn stddev(values: &[f64]) -> Option<f64> {
    let mean = mean(values)?;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    Some(variance.sqrt())
}

/// Mean of the samples no larger than `factor` times the minimum.
/// Drops outliers caused by scheduling hiccups on the host.
pub fn filtered_mean(values: &[f64], factor: f64) -> Option<f64> {
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let kept: Vec<f64> = values.iter().copied().filter(|v| *v <= min * factor).collect();
    mean(&kept)
}

/// Middle value; mean of the two middle values for even-sized sets
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    
    #[test]
    fn test_statistics() {
        let stats = calculate_statistics(&[10.0, 12.0, 14.0]).unwrap();
        assert_eq!(stats.min, 10.0);
        assert_eq!(stats.max, 14.0);
        assert_eq!(stats.mean, 12.0);
        assert!((stats.stddev - 1.632993).abs() < 1e-5);
        assert!(calculate_statistics(&[]).is_none());
    }
    
    #[test]
    fn test_filtered_mean_drops_outliers() {
        // 100 > 1.4 * 10
        let mean = filtered_mean(&[10.0, 11.0, 13.0, 100.0], 1.4).unwrap();
        assert!((mean - 34.0 / 3.0).abs() < 1e-9);
    }
    
    #[test]
    fn test_median() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), Some(2.5));
        assert_eq!(median(&[]), None);
    }
}
