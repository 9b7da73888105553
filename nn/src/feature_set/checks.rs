use super::{encode, FeatureSet};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use shakmaty::{Chess, EnPassantMode, Position};

/// Runs some sanity checks on the feature set over positions of random games
pub fn sanity_checks(feature_set: &dyn FeatureSet) {
    let mut rng = StdRng::seed_from_u64(0xC0FFEE);

    for _ in 0..20 {
        let mut pos = Chess::default();

        for _ in 0..80 {
            check_position(feature_set, &pos);

            let moves = pos.legal_moves();
            let Some(m) = moves.choose(&mut rng) else {
                break;
            };
            pos.play_unchecked(m);
        }
    }
}

fn check_position(feature_set: &dyn FeatureSet, pos: &Chess) {
    let setup = pos.clone().into_setup(EnPassantMode::Legal);

    // no duplicated features
    let mut raw = vec![];
    feature_set.active_features(&setup, &mut raw);
    let mut dedup = raw.clone();
    dedup.sort();
    dedup.dedup();
    assert_eq!(raw.len(), dedup.len(), "duplicated features");

    // all features in range
    assert!(raw
        .iter()
        .all(|&index| (index as usize) < feature_set.num_features()));

    // deterministic
    let first = encode(feature_set, &setup).unwrap();
    let second = encode(feature_set, &setup.clone()).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.len(), feature_set.num_features());
}
