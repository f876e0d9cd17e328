//! Run-length statistics over an hourly column: how long the holes are and
//! how long the stretches of usable data are.

/// Individually counted gap lengths are 1h..=11h; the last bucket holds every gap of 12h or more.
pub const GAP_BUCKETS: usize = 12;

pub const GAP_BUCKET_LABELS: [&str; GAP_BUCKETS] = [
    "1h_gap",
    "2h_gap",
    "3h_gap",
    "4h_gap",
    "5h_gap",
    "6h_gap",
    "7h_gap",
    "8h_gap",
    "9h_gap",
    "10h_gap",
    "11h_gap",
    "12h_or_more_gap",
];

/// Minimum lengths (hours) of the valid-run classes, ascending.
pub const VALID_RUN_THRESHOLDS: [(&str, usize); 5] = [("1d", 24), ("2d", 48), ("4d", 96), ("7d", 168), ("14d", 336)];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GapHistogram {
    counts: [u32; GAP_BUCKETS],
}

impl GapHistogram {
    pub fn counts(&self) -> &[u32; GAP_BUCKETS] {
        &self.counts
    }

    /// Count of gaps whose length is exactly `hours` (or, for `hours >= 12`, at least 12).
    pub fn count_for(&self, hours: usize) -> u32 {
        match hours {
            0 => 0,
            h => self.counts[h.min(GAP_BUCKETS) - 1],
        }
    }

    pub fn total_runs(&self) -> u32 {
        self.counts.iter().sum()
    }
}

/// Valid runs classified by the largest threshold they reach. Runs shorter
/// than the smallest threshold are not recorded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidRunHistogram {
    counts: [u32; VALID_RUN_THRESHOLDS.len()],
    hours: [u64; VALID_RUN_THRESHOLDS.len()],
}

impl ValidRunHistogram {
    pub fn counts(&self) -> &[u32; VALID_RUN_THRESHOLDS.len()] {
        &self.counts
    }

    /// Summed run length per class, in hours.
    pub fn hours(&self) -> &[u64; VALID_RUN_THRESHOLDS.len()] {
        &self.hours
    }
}

/// Lengths of the maximal runs where `is_missing` equals `missing`.
fn run_lengths(values: &[Option<f64>], missing: bool) -> Vec<usize> {
    let mut runs = Vec::new();
    let mut current = 0usize;
    for value in values {
        if value.is_none() == missing {
            current += 1;
        } else if current > 0 {
            runs.push(current);
            current = 0;
        }
    }
    if current > 0 {
        runs.push(current);
    }
    runs
}

pub fn gap_histogram(values: &[Option<f64>]) -> GapHistogram {
    let mut histogram = GapHistogram::default();
    for run in run_lengths(values, true) {
        histogram.counts[run.min(GAP_BUCKETS) - 1] += 1;
    }
    histogram
}

pub fn valid_run_histogram(values: &[Option<f64>]) -> ValidRunHistogram {
    let mut histogram = ValidRunHistogram::default();
    for run in run_lengths(values, false) {
        let class = VALID_RUN_THRESHOLDS
            .iter()
            .rposition(|(_, threshold)| run >= *threshold);
        if let Some(idx) = class {
            histogram.counts[idx] += 1;
            histogram.hours[idx] += run as u64;
        }
    }
    histogram
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(pattern: &[(bool, usize)]) -> Vec<Option<f64>> {
        pattern
            .iter()
            .flat_map(|(present, len)| std::iter::repeat_n(if *present { Some(1.0) } else { None }, *len))
            .collect()
    }

    #[test]
    fn two_hour_hole_lands_in_its_bucket() {
        let values = vec![Some(10.0), None, None, Some(12.0)];
        let histogram = gap_histogram(&values);
        assert_eq!(histogram.count_for(2), 1);
        assert_eq!(histogram.total_runs(), 1);
        for hours in [1, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12] {
            assert_eq!(histogram.count_for(hours), 0, "bucket {hours}h");
        }
    }

    #[test]
    fn long_gaps_share_the_last_bucket() {
        let values = series(&[(false, 12), (true, 3), (false, 40), (true, 1), (false, 11)]);
        let histogram = gap_histogram(&values);
        assert_eq!(histogram.count_for(12), 2);
        assert_eq!(histogram.count_for(11), 1);
        assert_eq!(histogram.counts()[GAP_BUCKETS - 1], 2);
    }

    #[test]
    fn gap_buckets_sum_to_number_of_runs() {
        let values = series(&[
            (false, 1),
            (true, 2),
            (false, 5),
            (true, 1),
            (false, 30),
            (true, 4),
            (false, 1),
        ]);
        let expected_runs = run_lengths(&values, true).len() as u32;
        assert_eq!(expected_runs, 4);
        assert_eq!(gap_histogram(&values).total_runs(), expected_runs);
    }

    #[test]
    fn valid_runs_counted_once_in_largest_class() {
        // 30h -> 1d, 50h -> 2d, 400h -> 14d, 10h -> nothing
        let values = series(&[(true, 30), (false, 1), (true, 50), (false, 2), (true, 400), (false, 1), (true, 10)]);
        let histogram = valid_run_histogram(&values);
        assert_eq!(histogram.counts(), &[1, 1, 0, 0, 1]);
        assert_eq!(histogram.hours(), &[30, 50, 0, 0, 400]);
        assert_eq!(histogram.counts().iter().sum::<u32>(), 3);
    }

    #[test]
    fn threshold_boundaries_are_inclusive() {
        let values = series(&[(true, 96), (false, 1), (true, 95)]);
        let histogram = valid_run_histogram(&values);
        assert_eq!(histogram.counts(), &[0, 1, 1, 0, 0]);
    }

    #[test]
    fn empty_column_has_no_runs() {
        assert_eq!(gap_histogram(&[]).total_runs(), 0);
        assert_eq!(valid_run_histogram(&[]).counts(), &[0; 5]);
    }
}
