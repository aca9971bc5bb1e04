//! Rule graph automation
//!
//! Validation, compilation and lifecycle of automation rules.
//!
//! # Architecture
//!
//! ```text
//! RULE --validate--> ValidationResult
//!      --compile---> CompiledPlan (stages + branch map), cached per version
//! ```
//!
//! - [`validate`] - structural checks, all errors collected
//! - [`compile`] - Kahn's algorithm into dependency stages
//! - [`PredicateEvaluator`] - Condition, Decision and Logic predicates
//! - [`CronSchedule`] - schedule trigger timing
//! - [`RuleManager`] - rule storage, activation and the plan cache

pub mod eval;
pub mod manager;
pub mod plan;
pub mod schedule;
pub mod trigger_eval;
pub mod validate;

pub use eval::{parse_time_of_day, EvalContext, PredicateError, PredicateEvaluator, PredicateResult};
pub use manager::{GraphUpdate, RuleError, RuleManager, RuleResult};
pub use plan::{compile, BranchTargets, CompileError, CompileResult, CompiledPlan, Dependency};
pub use schedule::{parse_offset, CronSchedule, TriggerError, TriggerResult};
pub use trigger_eval::{device_payload, matches_device_event, schedule_payload};
pub use validate::{validate, validate_graph, ValidationError, ValidationResult};
