//! Placeholder interpolation
//!
//! Strings in action values, notification messages and data fields may
//! contain `{{ name.path }}` placeholders, rendered by minijinja against a
//! read-only JSON context. The environment has no functions, tests or
//! globals and a single `default` filter; undefined lookups fail.
//!
//! # Syntax
//!
//! - `{{ trigger.value }}` - object field access
//! - `{{ devices.thermo.temperature }}` - nested fields
//! - `{{ items[0] }}` - array index
//! - `{{ vars.mode | default("auto") }}` - literal fallback when missing
//!
//! # Example
//!
//! ```ignore
//! use rulegraph_template::TemplateEngine;
//! use serde_json::json;
//!
//! let engine = TemplateEngine::new();
//! let context = json!({"trigger": {"device_id": "motion_1"}});
//! let text = engine.render("Motion at {{ trigger.device_id }}", &context)?;
//! assert_eq!(text, "Motion at motion_1");
//! ```

mod engine;
mod error;

pub use engine::{is_truthy, TemplateEngine};
pub use error::{TemplateError, TemplateResult};
