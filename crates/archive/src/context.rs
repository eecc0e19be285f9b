//! Block context derived from the header chain.

use bn_consensus::deployments::Forks;

/// Everything contextual validation needs to know about a block's position,
/// computed deterministically from its header ancestry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockContext {
    pub height: u32,
    pub timestamp: u32,
    pub median_time_past: u32,
    pub work_required: u32,
    pub forks: Forks,
    pub minimum_version: i32,
}

/// Median of up to eleven ancestor timestamps, parent first.
pub fn median_time_past(window: &[u32]) -> u32 {
    if window.is_empty() {
        return 0;
    }
    let mut sorted = window.to_vec();
    sorted.sort_unstable();
    sorted[sorted.len() / 2]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn median_of_odd_window() {
        assert_eq!(median_time_past(&[5, 1, 3]), 3);
    }

    #[test]
    fn median_of_even_window_takes_upper() {
        assert_eq!(median_time_past(&[1, 2, 3, 4]), 3);
    }

    #[test]
    fn median_of_single() {
        assert_eq!(median_time_past(&[42]), 42);
    }
}
