//! Burst loss/order/jitter metrics
//!
//! Computed by the agent for downlink bursts and by the server for uplink
//! bursts, so both ends report identical numbers for the same arrivals.

/// Arrival log of one burst
#[derive(Debug, Clone, Default)]
pub struct BurstMetrics {
    packet_nums: Vec<i32>,
    offset_delays_ms: Vec<i64>,
}

impl BurstMetrics {
    pub fn new() -> Self {
        Self::default()
    }
    
    /// Record one arrival. `offset_delay_ms` is receive time minus the
    /// sender's timestamp; the unknown clock offset cancels out in the jitter.
    pub fn add_packet(&mut self, packet_num: i32, offset_delay_ms: i64) {
        self.packet_nums.push(packet_num);
        self.offset_delays_ms.push(offset_delay_ms);
    }
    
    pub fn received(&self) -> usize {
        self.packet_nums.len()
    }
    
    pub fn inversion_number(&self) -> usize {
        inversion_count(&self.packet_nums)
    }
    
    pub fn jitter_ms(&self) -> f64 {
        jitter(&self.offset_delays_ms)
    }
    
    /// Fraction of `expected` packets that never arrived
    pub fn loss_rate(&self, expected: usize) -> f64 {
        if expected == 0 {
            return 0.0;
        }
        let received = self.received().min(expected);
        (expected - received) as f64 / expected as f64
    }
}

/// Number of out-of-order pairs (i < j with a[i] > a[j])
pub fn inversion_count(values: &[i32]) -> usize {
    let mut buf = values.to_vec();
    let mut scratch = vec![0; buf.len()];
    merge_count(&mut buf, &mut scratch)
}

fn merge_count(values: &mut [i32], scratch: &mut [i32]) -> usize {
    let len = values.len();
    if len < 2 {
        return 0;
    }
    let mid = len / 2;
    let mut count = {
        let (left, right) = values.split_at_mut(mid);
        let (scratch_left, scratch_right) = scratch.split_at_mut(mid);
        merge_count(left, scratch_left) + merge_count(right, scratch_right)
    };
    
    let (mut i, mut j, mut k) = (0, mid, 0);
    while i < mid && j < len {
        if values[i] <= values[j] {
            scratch[k] = values[i];
            i += 1;
        } else {
            // Everything left of mid from i onwards is greater
            scratch[k] = values[j];
            count += mid - i;
            j += 1;
        }
        k += 1;
    }
    while i < mid {
        scratch[k] = values[i];
        i += 1;
        k += 1;
    }
    while j < len {
        scratch[k] = values[j];
        j += 1;
        k += 1;
    }
    values.copy_from_slice(&scratch[..len]);
    count
}

/// Sample standard deviation of one-way delays
pub fn jitter(offset_delays_ms: &[i64]) -> f64 {
    let n = offset_delays_ms.len();
    if n < 2 {
        return 0.0;
    }
    let mean = offset_delays_ms.iter().map(|d| *d as f64).sum::<f64>() / n as f64;
    let variance = offset_delays_ms
        .iter()
        .map(|d| (*d as f64 - mean).powi(2))
        .sum::<f64>()
        / (n - 1) as f64;
    variance.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    
    #[test]
    fn test_inversion_count() {
        assert_eq!(inversion_count(&[]), 0);
        assert_eq!(inversion_count(&[0, 1, 2, 3]), 0);
        assert_eq!(inversion_count(&[1, 0, 2, 3]), 1);
        assert_eq!(inversion_count(&[3, 2, 1, 0]), 6);
        assert_eq!(inversion_count(&[0, 2, 1, 4, 3]), 2);
    }
    
    #[test]
    fn test_jitter_ignores_constant_offset() {
        // Same spread, different clock offsets
        let a = jitter(&[10, 12, 14]);
        let b = jitter(&[1010, 1012, 1014]);
        assert!((a - 2.0).abs() < 1e-9);
        assert!((a - b).abs() < 1e-9);
        assert_eq!(jitter(&[5]), 0.0);
    }
    
    #[test]
    fn test_loss_rate() {
        let mut metrics = BurstMetrics::new();
        for i in 0..12 {
            metrics.add_packet(i, 20);
        }
        assert!((metrics.loss_rate(16) - 0.25).abs() < 1e-9);
        assert_eq!(metrics.loss_rate(0), 0.0);
    }
}
