//! Predicate evaluation
//!
//! Condition, Decision and Logic nodes evaluate a [`Predicate`] against a
//! read-only [`EvalContext`]: a snapshot of device states, the run's
//! variables, the trigger payload and the run's trigger time. Evaluation has
//! no side effects.

use chrono::{DateTime, Datelike, FixedOffset, NaiveTime, Utc, Weekday};
use rulegraph_core::{Predicate, ValueMatch};
use rulegraph_template::TemplateEngine;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PredicateError {
    #[error("no state for {device_id}.{parameter}")]
    UnknownDeviceState { device_id: String, parameter: String },

    #[error("undefined variable: {0}")]
    UndefinedVariable(String),

    #[error("invalid time of day: {0}")]
    InvalidTime(String),

    #[error("invalid weekday: {0}")]
    InvalidWeekday(String),

    #[error("template error: {0}")]
    Template(String),
}

pub type PredicateResult<T> = Result<T, PredicateError>;

/// Everything a predicate may read
#[derive(Debug, Clone)]
pub struct EvalContext {
    /// `{device_id: {parameter: value}}`
    pub devices: Value,
    /// Variables written by Logic nodes earlier in the run
    pub variables: Map<String, Value>,
    /// Trigger payload of the run
    pub trigger: Value,
    /// Wall-clock time predicates see, in the engine's zone
    pub now: DateTime<FixedOffset>,
}

impl EvalContext {
    pub fn new(now: DateTime<FixedOffset>) -> Self {
        Self {
            devices: Value::Object(Map::new()),
            variables: Map::new(),
            trigger: Value::Null,
            now,
        }
    }

    /// Context at the current UTC time
    pub fn now_utc() -> Self {
        Self::new(Utc::now().fixed_offset())
    }

    pub fn with_devices(mut self, devices: Value) -> Self {
        self.devices = devices;
        self
    }

    pub fn with_trigger(mut self, trigger: Value) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn with_var(mut self, key: impl Into<String>, value: Value) -> Self {
        self.variables.insert(key.into(), value);
        self
    }

    /// Template and variable lookups resolve against this document
    pub fn to_template_context(&self) -> Value {
        let mut ctx = Map::new();
        ctx.insert("trigger".into(), self.trigger.clone());
        ctx.insert("devices".into(), self.devices.clone());
        ctx.insert("vars".into(), Value::Object(self.variables.clone()));
        ctx.insert("now".into(), Value::String(self.now.to_rfc3339()));
        Value::Object(ctx)
    }

    fn device_value(&self, device_id: &str, parameter: &str) -> Option<&Value> {
        self.devices.get(device_id).and_then(|d| d.get(parameter))
    }
}

/// Evaluates predicates
#[derive(Debug, Clone, Default)]
pub struct PredicateEvaluator {
    templates: TemplateEngine,
}

impl PredicateEvaluator {
    pub fn new(templates: TemplateEngine) -> Self {
        Self { templates }
    }

    pub fn evaluate(&self, predicate: &Predicate, ctx: &EvalContext) -> PredicateResult<bool> {
        match predicate {
            Predicate::TimeRange {
                after,
                before,
                weekdays,
            } => self.eval_time(after.as_deref(), before.as_deref(), weekdays, ctx),
            Predicate::DeviceState {
                device_id,
                parameter,
                matches,
            } => self.eval_device(device_id, parameter, matches, ctx),
            Predicate::Variable { name, matches } => self.eval_variable(name, matches, ctx),
            Predicate::Template { value_template } => self.eval_template(value_template, ctx),
            Predicate::And { conditions } => {
                for condition in conditions {
                    if !self.evaluate(condition, ctx)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Predicate::Or { conditions } => {
                for condition in conditions {
                    if self.evaluate(condition, ctx)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Predicate::Not { condition } => Ok(!self.evaluate(condition, ctx)?),
            Predicate::Constant { value } => Ok(*value),
        }
    }

    fn eval_time(
        &self,
        after: Option<&str>,
        before: Option<&str>,
        weekdays: &[String],
        ctx: &EvalContext,
    ) -> PredicateResult<bool> {
        let current = ctx.now.time();
        let weekday = ctx.now.weekday();
        debug!(?current, ?weekday, ?after, ?before, "Evaluating time range");

        if !weekdays.is_empty() {
            let mut allowed = false;
            for day in weekdays {
                if parse_weekday(day)? == weekday {
                    allowed = true;
                }
            }
            if !allowed {
                trace!("Weekday doesn't match");
                return Ok(false);
            }
        }

        let after = after.map(parse_time_of_day).transpose()?;
        let before = before.map(parse_time_of_day).transpose()?;

        let inside = match (after, before) {
            (Some(a), Some(b)) if a <= b => current >= a && current < b,
            // Window wraps past midnight, e.g. 18:00-06:00
            (Some(a), Some(b)) => current >= a || current < b,
            (Some(a), None) => current >= a,
            (None, Some(b)) => current < b,
            (None, None) => true,
        };
        trace!(inside, "Time range result");
        Ok(inside)
    }

    fn eval_device(
        &self,
        device_id: &str,
        parameter: &str,
        matches: &ValueMatch,
        ctx: &EvalContext,
    ) -> PredicateResult<bool> {
        let value = ctx.device_value(device_id, parameter).ok_or_else(|| {
            PredicateError::UnknownDeviceState {
                device_id: device_id.to_string(),
                parameter: parameter.to_string(),
            }
        })?;
        let result = matches.matches(value);
        trace!(device_id, parameter, %value, result, "Device state check");
        Ok(result)
    }

    fn eval_variable(
        &self,
        name: &str,
        matches: &ValueMatch,
        ctx: &EvalContext,
    ) -> PredicateResult<bool> {
        let root = ctx.to_template_context();
        let value = name
            .split('.')
            .try_fold(&root, |current, segment| match current {
                Value::Object(map) => map.get(segment),
                Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            })
            .ok_or_else(|| PredicateError::UndefinedVariable(name.to_string()))?;
        Ok(matches.matches(value))
    }

    fn eval_template(&self, template: &str, ctx: &EvalContext) -> PredicateResult<bool> {
        debug!(template, "Evaluating template predicate");
        self.templates
            .evaluate_bool(template, &ctx.to_template_context())
            .map_err(|e| PredicateError::Template(e.to_string()))
    }
}

/// `HH:MM` or `HH:MM:SS`
pub fn parse_time_of_day(s: &str) -> PredicateResult<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .map_err(|_| PredicateError::InvalidTime(s.to_string()))
}

fn parse_weekday(s: &str) -> PredicateResult<Weekday> {
    s.parse::<Weekday>()
        .map_err(|_| PredicateError::InvalidWeekday(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn at(hour: u32, minute: u32) -> EvalContext {
        // 2024-01-10 is a Wednesday
        let now = FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2024, 1, 10, hour, minute, 0)
            .unwrap();
        EvalContext::new(now)
    }

    #[test]
    fn test_time_range_wraps_midnight() {
        let evaluator = PredicateEvaluator::default();
        let evening = Predicate::time_between("18:00", "06:00");

        assert!(evaluator.evaluate(&evening, &at(2, 0)).unwrap());
        assert!(evaluator.evaluate(&evening, &at(18, 0)).unwrap());
        assert!(!evaluator.evaluate(&evening, &at(14, 0)).unwrap());
        assert!(!evaluator.evaluate(&evening, &at(6, 0)).unwrap());
    }

    #[test]
    fn test_time_range_same_day() {
        let evaluator = PredicateEvaluator::default();
        let office = Predicate::time_between("09:00", "17:30");
        assert!(evaluator.evaluate(&office, &at(9, 0)).unwrap());
        assert!(!evaluator.evaluate(&office, &at(17, 30)).unwrap());
    }

    #[test]
    fn test_weekdays() {
        let evaluator = PredicateEvaluator::default();
        let weekend = Predicate::TimeRange {
            after: None,
            before: None,
            weekdays: vec!["sat".into(), "sun".into()],
        };
        assert!(!evaluator.evaluate(&weekend, &at(12, 0)).unwrap());

        let wednesday = Predicate::TimeRange {
            after: None,
            before: None,
            weekdays: vec!["wed".into()],
        };
        assert!(evaluator.evaluate(&wednesday, &at(12, 0)).unwrap());

        let bogus = Predicate::TimeRange {
            after: None,
            before: None,
            weekdays: vec!["someday".into()],
        };
        assert!(matches!(
            evaluator.evaluate(&bogus, &at(12, 0)),
            Err(PredicateError::InvalidWeekday(_))
        ));
    }

    #[test]
    fn test_invalid_time() {
        let evaluator = PredicateEvaluator::default();
        let result = evaluator.evaluate(&Predicate::time_between("25:00", "06:00"), &at(1, 0));
        assert_eq!(result, Err(PredicateError::InvalidTime("25:00".into())));
    }

    #[test]
    fn test_device_state() {
        let evaluator = PredicateEvaluator::default();
        let ctx = at(12, 0).with_devices(json!({"thermo": {"temperature": 27.5}}));

        let hot = Predicate::DeviceState {
            device_id: "thermo".into(),
            parameter: "temperature".into(),
            matches: ValueMatch::Above { value: 25.0 },
        };
        assert!(evaluator.evaluate(&hot, &ctx).unwrap());

        let unknown = Predicate::DeviceState {
            device_id: "thermo".into(),
            parameter: "humidity".into(),
            matches: ValueMatch::Above { value: 25.0 },
        };
        assert!(matches!(
            evaluator.evaluate(&unknown, &ctx),
            Err(PredicateError::UnknownDeviceState { .. })
        ));
    }

    #[test]
    fn test_variable_paths() {
        let evaluator = PredicateEvaluator::default();
        let ctx = at(12, 0)
            .with_trigger(json!({"value": "on"}))
            .with_var("occupied", json!(true));

        let trigger_on = Predicate::Variable {
            name: "trigger.value".into(),
            matches: ValueMatch::Equals { value: json!("on") },
        };
        let occupied = Predicate::Variable {
            name: "vars.occupied".into(),
            matches: ValueMatch::Equals { value: json!(true) },
        };
        assert!(evaluator
            .evaluate(&Predicate::and(vec![trigger_on, occupied]), &ctx)
            .unwrap());

        let missing = Predicate::Variable {
            name: "vars.nobody".into(),
            matches: ValueMatch::Equals { value: json!(true) },
        };
        assert_eq!(
            evaluator.evaluate(&missing, &ctx),
            Err(PredicateError::UndefinedVariable("vars.nobody".into()))
        );
    }

    #[test]
    fn test_template_and_combinators() {
        let evaluator = PredicateEvaluator::default();
        let ctx = at(12, 0).with_devices(json!({"door": {"open": "on"}}));

        let open = Predicate::Template {
            value_template: "{{ devices.door.open }}".into(),
        };
        assert!(evaluator.evaluate(&open, &ctx).unwrap());
        assert!(!evaluator.evaluate(&Predicate::not(open.clone()), &ctx).unwrap());
        assert!(evaluator
            .evaluate(
                &Predicate::or(vec![Predicate::Constant { value: false }, open]),
                &ctx
            )
            .unwrap());
    }

    #[test]
    fn test_and_short_circuits_before_errors() {
        let evaluator = PredicateEvaluator::default();
        let predicate = Predicate::and(vec![
            Predicate::Constant { value: false },
            Predicate::time_between("nonsense", "06:00"),
        ]);
        assert_eq!(evaluator.evaluate(&predicate, &at(1, 0)), Ok(false));
    }
}
