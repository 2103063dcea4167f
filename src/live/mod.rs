//! Real-time path: typed inputs, feature extraction, market comparison,
//! per-match session owners and snapshot fan-out.

pub mod broadcaster;
pub mod comparator;
pub mod features;
pub mod messages;
pub mod session;
pub mod types;
