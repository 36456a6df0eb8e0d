//! Planned object sizes.

use crate::config::ConfigError;

/// The geometric sequence of object sizes.
///
/// Object `i` has a size of `initial * ratio^i` bytes. Sizes are computed independently per index,
/// so the sequence can be evaluated in any order. Sizes that exceed `u64::MAX` saturate.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SizeSequence {
    count: usize,
    initial: u64,
    ratio: f64,
}

impl SizeSequence {
    /// Creates the sequence of `count` sizes starting at `initial` bytes.
    ///
    /// A negative ratio, or one that is not a finite number, is rejected. A ratio of zero yields
    /// empty objects after the first one.
    pub fn new(count: usize, initial: u64, ratio: f64) -> Result<Self, ConfigError> {
        if !ratio.is_finite() || ratio < 0.0 {
            return Err(ConfigError::InvalidRatio(ratio));
        }

        Ok(Self {
            count,
            initial,
            ratio,
        })
    }

    /// The number of sizes in the sequence.
    pub fn len(&self) -> usize {
        self.count
    }

    /// Returns `true` if the sequence has no sizes.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Returns the size of object `index`, regardless of the sequence length.
    pub fn size_at(&self, index: usize) -> u64 {
        if index == 0 {
            return self.initial;
        }

        let exponent = i32::try_from(index).unwrap_or(i32::MAX);
        // `as` saturates at the bounds of u64
        (self.initial as f64 * self.ratio.powi(exponent)) as u64
    }

    /// Iterates the sizes in index order.
    pub fn iter(&self) -> impl ExactSizeIterator<Item = u64> + '_ {
        (0..self.count).map(|index| self.size_at(index))
    }
}

#[cfg(test)]
mod tests {
    use uploadbench_service::MIB;

    use super::*;

    fn sizes(count: usize, initial: u64, ratio: f64) -> Vec<u64> {
        SizeSequence::new(count, initial, ratio)
            .unwrap()
            .iter()
            .collect()
    }

    #[test]
    fn doubling() {
        assert_eq!(
            sizes(5, MIB, 2.0),
            vec![MIB, 2 * MIB, 4 * MIB, 8 * MIB, 16 * MIB]
        );
        assert_eq!(sizes(5, MIB, 2.0).iter().sum::<u64>(), 31 * MIB);
    }

    #[test]
    fn constant() {
        assert_eq!(sizes(3, 2 * MIB, 1.0), vec![2 * MIB; 3]);
    }

    #[test]
    fn zero_ratio() {
        assert_eq!(sizes(3, 4 * MIB, 0.0), vec![4 * MIB, 0, 0]);
    }

    #[test]
    fn zero_initial_size() {
        assert_eq!(sizes(3, 0, 3.0), vec![0, 0, 0]);
    }

    #[test]
    fn fractional_ratio() {
        assert_eq!(sizes(3, 1000, 0.5), vec![1000, 500, 250]);
    }

    #[test]
    fn empty() {
        let sequence = SizeSequence::new(0, MIB, 2.0).unwrap();
        assert!(sequence.is_empty());
        assert_eq!(sequence.iter().count(), 0);
    }

    #[test]
    fn saturates() {
        let sequence = SizeSequence::new(100, MIB, 10.0).unwrap();
        assert_eq!(sequence.size_at(99), u64::MAX);
    }

    #[test]
    fn independent_of_order() {
        let sequence = SizeSequence::new(10, 3, 3.0).unwrap();
        let forward: Vec<_> = sequence.iter().collect();
        for index in (0..10).rev() {
            assert_eq!(sequence.size_at(index), forward[index]);
        }
    }

    #[test]
    fn rejects_invalid_ratio() {
        assert_eq!(
            SizeSequence::new(3, MIB, -1.0),
            Err(ConfigError::InvalidRatio(-1.0))
        );
        assert!(SizeSequence::new(3, MIB, f64::NAN).is_err());
        assert!(SizeSequence::new(3, MIB, f64::INFINITY).is_err());
    }
}
