//! Transform Engine (spec §4.4): a declarative JSON-shape mapper. Rule
//! specs are compiled once in [`TransformEngine::new`]; the engine is
//! stateless and safe to share across concurrently transforming tasks.

mod path;

use rc_common::{ChangeEvent, ReplicatorError, TransformPolicy, TransformRule};
use serde_json::Value;
use tracing::warn;

enum CompiledRule {
    Shift(Vec<(String, Vec<path::Segment>)>),
    Default(Vec<(String, Value)>),
    Concat {
        sources: Vec<String>,
        delimiter: String,
        target_path: String,
    },
    Coalesce {
        sources: Vec<String>,
        target_path: String,
    },
    Pass,
}

fn compile(rule: &TransformRule) -> CompiledRule {
    match rule {
        TransformRule::Shift { spec } => CompiledRule::Shift(
            spec.iter()
                .map(|(out, input)| (out.clone(), path::parse(input)))
                .collect(),
        ),
        TransformRule::Default { spec } => {
            CompiledRule::Default(spec.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        }
        TransformRule::Concat { sources, delimiter, target_path } => CompiledRule::Concat {
            sources: sources.clone(),
            delimiter: delimiter.clone(),
            target_path: target_path.clone(),
        },
        TransformRule::Coalesce { sources, target_path } => CompiledRule::Coalesce {
            sources: sources.clone(),
            target_path: target_path.clone(),
        },
        TransformRule::Pass => CompiledRule::Pass,
    }
}

/// Applies one compiled rule to `value`, returning the new value or a
/// description of why the rule could not be applied.
fn apply_rule(rule: &CompiledRule, value: &Value) -> Result<Value, String> {
    match rule {
        CompiledRule::Shift(mappings) => {
            let mut out = Value::Object(serde_json::Map::new());
            for (target, source_segments) in mappings {
                if let Some(found) = path::get(value, source_segments) {
                    path::set(&mut out, target, found);
                }
            }
            Ok(out)
        }
        CompiledRule::Default(defaults) => {
            let mut out = value.clone();
            for (field, default_value) in defaults {
                let is_missing = path::get(&out, &path::parse(field)).map(|v| v.is_null()).unwrap_or(true);
                if is_missing {
                    path::set(&mut out, field, default_value.clone());
                }
            }
            Ok(out)
        }
        CompiledRule::Concat { sources, delimiter, target_path } => {
            let mut parts = Vec::with_capacity(sources.len());
            for source in sources {
                let found = path::get(value, &path::parse(source))
                    .ok_or_else(|| format!("concat source path {source} not found"))?;
                parts.push(scalar_to_string(&found));
            }
            let mut out = value.clone();
            path::set(&mut out, target_path, Value::String(parts.join(delimiter)));
            Ok(out)
        }
        CompiledRule::Coalesce { sources, target_path } => {
            let chosen = sources
                .iter()
                .find_map(|source| path::get(value, &path::parse(source)).filter(|v| !v.is_null()));
            let mut out = value.clone();
            match chosen {
                Some(v) => path::set(&mut out, target_path, v),
                None => return Err(format!("no non-null value among coalesce sources {sources:?}")),
            }
            Ok(out)
        }
        CompiledRule::Pass => Ok(value.clone()),
    }
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Result of transforming one event. Under `TransformPolicy::Skip`, a rule
/// failure drops the whole event rather than forwarding a partially
/// transformed one (spec §4.4/§7: skip policy skips the *event*).
pub enum TransformOutcome {
    Applied(Vec<String>),
    Skipped(String),
}

/// Compiled, thread-safe, ordered pipeline of transform rules.
pub struct TransformEngine {
    rules: Vec<CompiledRule>,
    policy: TransformPolicy,
}

impl TransformEngine {
    pub fn new(rules: &[TransformRule], policy: TransformPolicy) -> Self {
        Self {
            rules: rules.iter().map(compile).collect(),
            policy,
        }
    }

    /// Transforms `event.after` in place. `key` and `before` are never
    /// touched by the engine, which trivially satisfies the invariant that
    /// they survive transformation (spec §4.4, §8 property 3) without
    /// needing a re-injection step.
    pub fn transform(&self, event: &mut ChangeEvent) -> rc_common::Result<TransformOutcome> {
        let Some(original) = event.after.clone() else {
            return Ok(TransformOutcome::Applied(Vec::new()));
        };

        let mut warnings = Vec::new();
        let mut current = original;

        for rule in &self.rules {
            match apply_rule(rule, &current) {
                Ok(next) => current = next,
                Err(reason) => match self.policy {
                    TransformPolicy::Fail => {
                        return Err(ReplicatorError::TransformError(reason));
                    }
                    TransformPolicy::Skip => {
                        warn!(stream = %event.stream, event = %event.id, reason, "dropping event: transform rule failed under skip policy");
                        return Ok(TransformOutcome::Skipped(reason));
                    }
                    TransformPolicy::Partial => {
                        warnings.push(reason);
                    }
                },
            }
        }

        event.after = Some(current);
        Ok(TransformOutcome::Applied(warnings))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rc_common::{Namespace, Op};
    use serde_json::json;
    use std::collections::HashMap;

    fn event(after: Value) -> ChangeEvent {
        ChangeEvent {
            id: "e1".into(),
            stream: "orders".into(),
            op: Op::Update,
            namespace: Namespace { database: "db".into(), collection: "orders".into() },
            key: HashMap::from([("id".into(), json!(1))]),
            before: Some(json!({"id": 1, "status": "old"})),
            after: Some(after),
            position: vec![1],
            source_ts: chrono::Utc::now(),
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn shift_renames_and_drops_unspecified_fields() {
        let rules = vec![TransformRule::Shift {
            spec: HashMap::from([("full_name".to_string(), "name.first".to_string())]),
        }];
        let engine = TransformEngine::new(&rules, TransformPolicy::Fail);
        let mut ev = event(json!({"name": {"first": "Ada"}, "extra": "dropped"}));
        engine.transform(&mut ev).unwrap();
        assert_eq!(ev.after, Some(json!({"full_name": "Ada"})));
    }

    #[test]
    fn default_only_fills_missing_or_null() {
        let rules = vec![TransformRule::Default {
            spec: HashMap::from([("status".to_string(), json!("active"))]),
        }];
        let engine = TransformEngine::new(&rules, TransformPolicy::Fail);
        let mut ev = event(json!({"status": null}));
        engine.transform(&mut ev).unwrap();
        assert_eq!(ev.after.unwrap()["status"], json!("active"));
    }

    #[test]
    fn key_and_before_survive_transformation() {
        let rules = vec![TransformRule::Shift { spec: HashMap::new() }];
        let engine = TransformEngine::new(&rules, TransformPolicy::Fail);
        let mut ev = event(json!({"anything": 1}));
        let key_before = ev.key.clone();
        let before_before = ev.before.clone();
        engine.transform(&mut ev).unwrap();
        assert_eq!(ev.key, key_before);
        assert_eq!(ev.before, before_before);
    }

    #[test]
    fn fail_policy_propagates_transform_error() {
        let rules = vec![TransformRule::Coalesce {
            sources: vec!["missing".into()],
            target_path: "out".into(),
        }];
        let engine = TransformEngine::new(&rules, TransformPolicy::Fail);
        let mut ev = event(json!({}));
        let err = engine.transform(&mut ev).unwrap_err();
        assert!(matches!(err, ReplicatorError::TransformError(_)));
    }

    #[test]
    fn partial_policy_collects_warnings_and_continues() {
        let rules = vec![
            TransformRule::Coalesce { sources: vec!["missing".into()], target_path: "out".into() },
            TransformRule::Default { spec: HashMap::from([("status".to_string(), json!("ok"))]) },
        ];
        let engine = TransformEngine::new(&rules, TransformPolicy::Partial);
        let mut ev = event(json!({}));
        let outcome = engine.transform(&mut ev).unwrap();
        let TransformOutcome::Applied(warnings) = outcome else { panic!("expected Applied") };
        assert_eq!(warnings.len(), 1);
        assert_eq!(ev.after.unwrap()["status"], json!("ok"));
    }

    #[test]
    fn skip_policy_drops_the_event_instead_of_forwarding_it_partially_transformed() {
        let rules = vec![
            TransformRule::Coalesce { sources: vec!["missing".into()], target_path: "out".into() },
            TransformRule::Default { spec: HashMap::from([("status".to_string(), json!("ok"))]) },
        ];
        let engine = TransformEngine::new(&rules, TransformPolicy::Skip);
        let mut ev = event(json!({"original": true}));
        let outcome = engine.transform(&mut ev).unwrap();
        assert!(matches!(outcome, TransformOutcome::Skipped(_)));
        // transform() only mutates event.after on a fully Applied outcome.
        assert_eq!(ev.after, Some(json!({"original": true})));
    }
}
