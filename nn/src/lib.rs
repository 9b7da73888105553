pub mod feature_set;
pub mod model;
