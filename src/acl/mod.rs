//! Access Control List (ACL) module
//!
//! Provides identity and topic based access control for MQTT operations.

mod evaluator;
mod rules;

pub use evaluator::AclEvaluator;
pub use rules::{AclDecision, AclRequest};
