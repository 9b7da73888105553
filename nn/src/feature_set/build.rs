use super::basic::Basic;
use super::FeatureSet;
use std::sync::Arc;

/// Builds a feature set from the name stored in a checkpoint
pub fn build_feature_set(name: &str) -> Option<Arc<dyn FeatureSet>> {
    match name {
        "basic" => Some(Arc::new(Basic::new())),
        _ => None,
    }
}
