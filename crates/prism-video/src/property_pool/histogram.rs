//! Staging-budget lookup for one upstream attempt
//!
//! Advancing every participating property by `k` dwords costs
//! `fixed + Σ bytes_per_dword_i * min(k, remaining_i)` staging bytes. That is
//! piecewise linear in `k` with a breakpoint at each `remaining_i`, so the
//! breakpoints are tabulated once and a budget is mapped back to `k` with a
//! binary search plus interpolation inside the bucket.

use smallvec::SmallVec;

#[derive(Debug, Clone)]
pub(crate) struct CumulativeHistogram {
    dwords: SmallVec<[u32; 16]>,
    bytes: SmallVec<[u64; 16]>,
}

impl CumulativeHistogram {
    /// `entries` yields `(remaining_dwords, bytes_per_dword)` sorted by remaining dwords
    pub fn build(fixed_bytes: u64, entries: impl IntoIterator<Item = (u32, u64)> + Clone) -> Self {
        let mut slope: u64 = entries.clone().into_iter().map(|(_, per_dword)| per_dword).sum();

        let mut dwords = SmallVec::new();
        let mut bytes = SmallVec::new();
        dwords.push(0);
        bytes.push(fixed_bytes);

        let mut prev_dwords = 0u32;
        let mut prev_bytes = fixed_bytes;
        for (remaining, per_dword) in entries {
            debug_assert!(remaining >= prev_dwords, "entries must be sorted");
            let step = u64::from(remaining.saturating_sub(prev_dwords));
            prev_bytes = prev_bytes.saturating_add(slope.saturating_mul(step));
            prev_dwords = remaining.max(prev_dwords);
            slope -= per_dword;
            dwords.push(prev_dwords);
            bytes.push(prev_bytes);
        }

        Self { dwords, bytes }
    }

    /// Dwords moved by the last watermark, i.e. the whole attempt
    #[cfg(test)]
    pub fn max_dwords(&self) -> u32 {
        self.dwords.last().copied().unwrap_or(0)
    }

    /// Largest `k` whose staging cost fits `budget`, with that cost
    pub fn dwords_for_budget(&self, budget: u64) -> (u32, u64) {
        let upper = self.bytes.partition_point(|&b| b <= budget);
        if upper == 0 {
            return (0, 0);
        }
        let lower = upper - 1;
        let mut dwords = self.dwords[lower];
        let mut used = self.bytes[lower];

        if let (Some(&next_dwords), Some(&next_bytes)) =
            (self.dwords.get(upper), self.bytes.get(upper))
        {
            let span = u64::from(next_dwords - dwords);
            if span > 0 {
                let per_dword = (next_bytes - used) / span;
                if per_dword > 0 {
                    let extra = (budget - used) / per_dword;
                    dwords += extra as u32;
                    used += extra * per_dword;
                }
            }
        }

        (dwords, used)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_everything_fits() {
        let hist = CumulativeHistogram::build(0, [(4, 4), (8, 4)]);
        // 4 dwords of both cost 32 bytes, the last 4 of the second cost 16 more
        assert_eq!(hist.max_dwords(), 8);
        assert_eq!(hist.dwords_for_budget(1024), (8, 48));
    }

    #[test]
    fn test_interpolates_inside_bucket() {
        let hist = CumulativeHistogram::build(0, [(4, 4), (8, 4)]);

        assert_eq!(hist.dwords_for_budget(20), (2, 16));
        assert_eq!(hist.dwords_for_budget(32), (4, 32));
        assert_eq!(hist.dwords_for_budget(43), (6, 40));
    }

    #[test]
    fn test_fixed_cost_must_fit() {
        let hist = CumulativeHistogram::build(64, [(10, 4)]);

        assert_eq!(hist.dwords_for_budget(63), (0, 0));
        assert_eq!(hist.dwords_for_budget(64), (0, 64));
        assert_eq!(hist.dwords_for_budget(72), (2, 72));
    }

    #[test]
    fn test_free_requests_advance_without_budget() {
        // device-resident sources cost nothing to stage
        let hist = CumulativeHistogram::build(0, [(100, 0), (300, 0)]);
        assert_eq!(hist.dwords_for_budget(0), (300, 0));
    }

    #[test]
    fn test_mixed_free_and_staged() {
        let hist = CumulativeHistogram::build(0, [(100, 0), (300, 4)]);

        assert_eq!(hist.dwords_for_budget(400), (100, 400));
        assert_eq!(hist.dwords_for_budget(1200), (300, 1200));
    }
}
