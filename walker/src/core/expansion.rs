//! Expansion-ratio arithmetic for context-pressure reporting.
//!
//! The ratio of a closed issue is `(result_bytes + comments_bytes) /
//! body_bytes`; aggregations report count, median and P75 per issue type.
//! Issues with empty bodies are excluded upstream (a zero denominator is not
//! a ratio).

/// One sample: a closed issue's byte counts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExpansionSample {
    pub body_bytes: u64,
    pub closed_bytes: u64,
}

impl ExpansionSample {
    pub fn ratio(&self) -> f64 {
        self.closed_bytes as f64 / self.body_bytes as f64
    }
}

/// Aggregated statistics over a set of samples.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpansionAggregate {
    pub count: usize,
    pub median: f64,
    pub p75: f64,
    pub body_bytes: u64,
    pub closed_bytes: u64,
}

/// Aggregate samples; `None` when the set is empty.
pub fn aggregate(samples: &[ExpansionSample]) -> Option<ExpansionAggregate> {
    if samples.is_empty() {
        return None;
    }
    let mut ratios: Vec<f64> = samples.iter().map(ExpansionSample::ratio).collect();
    ratios.sort_by(|a, b| a.partial_cmp(b).expect("ratios are finite"));

    Some(ExpansionAggregate {
        count: samples.len(),
        median: percentile(&ratios, 0.5),
        p75: percentile(&ratios, 0.75),
        body_bytes: samples.iter().map(|s| s.body_bytes).sum(),
        closed_bytes: samples.iter().map(|s| s.closed_bytes).sum(),
    })
}

/// Nearest-rank percentile over a sorted slice.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    debug_assert!(!sorted.is_empty());
    let rank = (q * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}
