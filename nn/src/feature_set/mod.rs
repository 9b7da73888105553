pub mod basic;
pub mod build;
#[cfg(test)]
mod checks;

use shakmaty::{Color, Setup};
use thiserror::Error;

/// A set of features for a neural network
pub trait FeatureSet: Send + Sync {
    /// Name stored in model checkpoints
    fn name(&self) -> &'static str;

    /// Number of features in the set
    fn num_features(&self) -> usize;

    /// Pushes the index of every active feature of the position.
    /// Move counters and clocks must not influence the result.
    fn active_features(&self, setup: &Setup, features: &mut Vec<u16>);
}

/// Returned when a position cannot be encoded
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodingError {
    #[error("{color:?} has {count} kings")]
    KingCount { color: Color, count: usize },
}

/// Fixed-length binary feature vector of a position.
/// Stored sparsely as the sorted indices of the features set to 1.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EncodedFeatures {
    active: Vec<u16>,
    len: usize,
}

impl EncodedFeatures {
    /// Sorted indices of the active features
    pub fn active(&self) -> &[u16] {
        &self.active
    }

    /// Length of the full vector
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn to_dense(&self) -> Vec<f32> {
        let mut dense = vec![0.0; self.len];
        for &index in &self.active {
            dense[index as usize] = 1.0;
        }
        dense
    }
}

/// Encodes a position with the given feature set.
/// Fails if the position does not have exactly one king per side.
pub fn encode(feature_set: &dyn FeatureSet, setup: &Setup) -> Result<EncodedFeatures, EncodingError> {
    for color in [Color::White, Color::Black] {
        let count = (setup.board.by_color(color) & setup.board.kings()).count();
        if count != 1 {
            return Err(EncodingError::KingCount { color, count });
        }
    }

    let mut active = Vec::with_capacity(48);
    feature_set.active_features(setup, &mut active);
    active.sort_unstable();
    active.dedup();

    debug_assert!(active
        .iter()
        .all(|&index| (index as usize) < feature_set.num_features()));

    Ok(EncodedFeatures {
        active,
        len: feature_set.num_features(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature_set::basic::Basic;
    use shakmaty::fen::Fen;

    fn setup(fen: &str) -> Setup {
        fen.parse::<Fen>().unwrap().into_setup()
    }

    #[test]
    fn missing_king_is_an_error() {
        let res = encode(&Basic::new(), &setup("8/8/8/8/8/8/4P3/4K3 w - - 0 1"));
        assert_eq!(
            res,
            Err(EncodingError::KingCount {
                color: Color::Black,
                count: 0
            })
        );
    }

    #[test]
    fn two_kings_is_an_error() {
        let res = encode(&Basic::new(), &setup("4k3/8/8/8/8/8/8/3KK3 w - - 0 1"));
        assert!(matches!(
            res,
            Err(EncodingError::KingCount {
                color: Color::White,
                count: 2
            })
        ));
    }

    #[test]
    fn dense_matches_sparse() {
        let encoded = encode(&Basic::new(), &Setup::initial()).unwrap();
        let dense = encoded.to_dense();

        assert_eq!(dense.len(), encoded.len());
        assert_eq!(
            dense.iter().filter(|&&x| x == 1.0).count(),
            encoded.active().len()
        );
    }
}
