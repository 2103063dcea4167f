//! Model artifacts, serving-side registry and predictor, and the offline
//! collect → retrain loop.

pub mod artifact;
pub mod calibration;
pub mod collector;
pub mod corpus;
pub mod predictor;
pub mod registry;
pub mod retrainer;
pub mod store;
pub mod training;
