//! Schema repair engine for model-produced status deltas.
//!
//! Untrusted model output never reaches persistent state directly: it passes
//! through [`repair`], which clamps out-of-range numbers, coerces mistyped
//! scalars and checks enum membership against the configured rules. Repair is
//! pure — it returns a new snapshot and leaves its inputs untouched.
//!
//! Recoverable violations (out of range, wrong scalar type) self-heal and
//! never error. Unrecoverable ones (enum value outside the allowed set,
//! non-numeric string for a number field) are collected and surfaced as one
//! combined [`ChroniclerError::SchemaViolation`].

use serde::{Deserialize, Serialize};

use crate::error::ChroniclerError;
use crate::snapshot::{resolve_path, resolve_path_mut, AliasNames, StatusSnapshot, StatusValue};

/// One validation/repair rule, addressed by an alias-aware dotted path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RepairRule {
    Number {
        path: String,
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
        /// Maximum absolute change per turn relative to the previous value.
        #[serde(default)]
        delta: Option<f64>,
    },
    Text {
        path: String,
        /// Allowed values, comma separated. The full-width comma `，` is
        /// accepted as a separator too, since rule text is often authored in
        /// CJK input modes.
        #[serde(default)]
        one_of: Option<String>,
    },
    Bool {
        path: String,
    },
}

impl RepairRule {
    pub fn path(&self) -> &str {
        match self {
            RepairRule::Number { path, .. }
            | RepairRule::Text { path, .. }
            | RepairRule::Bool { path } => path,
        }
    }
}

/// Validate and self-heal `candidate` against `previous` under the given
/// rules. Paths with no current value are skipped silently.
pub fn repair(
    candidate: &StatusSnapshot,
    previous: &StatusSnapshot,
    rules: &[RepairRule],
    names: &AliasNames,
) -> Result<StatusSnapshot, ChroniclerError> {
    let mut repaired = candidate.clone();
    let mut violations: Vec<String> = Vec::new();

    for rule in rules {
        let Some(current) = resolve_path_mut(&mut repaired, rule.path(), names) else {
            continue;
        };

        match rule {
            RepairRule::Number {
                path,
                min,
                max,
                delta,
            } => match coerce_number(current) {
                Ok(value) => {
                    let prev = resolve_path(previous, path, names)
                        .and_then(|v| v.as_number());
                    let healed = clamp_number(value, prev, *delta, *min, *max);
                    *current = StatusValue::Number(healed);
                }
                Err(raw) => {
                    violations.push(format!("`{path}`: value `{raw}` is not numeric"));
                }
            },
            RepairRule::Text { path, one_of } => {
                let text = coerce_text(current);
                if let Some(allowed) = one_of {
                    let members: Vec<&str> = allowed
                        .split([',', '，'])
                        .map(str::trim)
                        .filter(|m| !m.is_empty())
                        .collect();
                    if !members.iter().any(|m| *m == text) {
                        violations.push(format!(
                            "`{path}`: value `{text}` not one of [{}]",
                            members.join(", ")
                        ));
                        continue;
                    }
                }
                *current = StatusValue::Text(text);
            }
            RepairRule::Bool { .. } => {
                if let Some(flag) = coerce_bool(current) {
                    *current = StatusValue::Bool(flag);
                }
            }
        }
    }

    if violations.is_empty() {
        Ok(repaired)
    } else {
        Err(ChroniclerError::SchemaViolation {
            details: violations.join("; "),
        })
    }
}

/// Delta-clamp against the previous value first, then bounds-clamp. Bounds
/// always win when both are configured because they are applied last.
fn clamp_number(
    value: f64,
    previous: Option<f64>,
    delta: Option<f64>,
    min: Option<f64>,
    max: Option<f64>,
) -> f64 {
    let mut out = value;
    if let (Some(limit), Some(prev)) = (delta, previous) {
        let change = (out - prev).clamp(-limit.abs(), limit.abs());
        out = prev + change;
    }
    if let Some(lo) = min {
        out = out.max(lo);
    }
    if let Some(hi) = max {
        out = out.min(hi);
    }
    out
}

fn coerce_number(value: &StatusValue) -> Result<f64, String> {
    match value {
        StatusValue::Number(n) => Ok(*n),
        StatusValue::Text(s) => s.trim().parse::<f64>().map_err(|_| s.clone()),
        StatusValue::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        StatusValue::Map(_) => Err("<object>".to_string()),
    }
}

fn coerce_text(value: &StatusValue) -> String {
    match value {
        StatusValue::Text(s) => s.clone(),
        StatusValue::Number(n) => {
            if n.fract() == 0.0 && n.abs() < 1e15 {
                format!("{}", *n as i64)
            } else {
                format!("{n}")
            }
        }
        StatusValue::Bool(b) => b.to_string(),
        StatusValue::Map(_) => String::new(),
    }
}

fn coerce_bool(value: &StatusValue) -> Option<bool> {
    match value {
        StatusValue::Bool(b) => Some(*b),
        StatusValue::Text(s) => {
            let trimmed = s.trim();
            Some(!(trimmed.is_empty() || trimmed.eq_ignore_ascii_case("false")))
        }
        StatusValue::Number(n) => Some(*n != 0.0),
        StatusValue::Map(_) => None,
    }
}

/// In which order a [`FieldProgram`] applies its two clamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ClampOrder {
    #[default]
    DeltaThenBounds,
    BoundsThenDelta,
}

/// A declarative per-field program — the sandboxed replacement for the
/// source's arbitrary validator scripts. Candidate strings of the form
/// `"+10"` / `"-3"` are relative deltas applied to the previous value;
/// anything else numeric is absolute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldProgram {
    pub path: String,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub delta: Option<f64>,
    #[serde(default)]
    pub order: ClampOrder,
}

/// Apply field programs to a candidate snapshot. Read access is limited to
/// `previous` via dotted paths; programs cannot reach any other state.
pub fn apply_programs(
    candidate: &StatusSnapshot,
    previous: &StatusSnapshot,
    programs: &[FieldProgram],
    names: &AliasNames,
) -> Result<StatusSnapshot, ChroniclerError> {
    let mut repaired = candidate.clone();
    let mut violations: Vec<String> = Vec::new();

    for program in programs {
        let prev = resolve_path(previous, &program.path, names).and_then(|v| v.as_number());
        let Some(current) = resolve_path_mut(&mut repaired, &program.path, names) else {
            continue;
        };

        let resolved = match &*current {
            StatusValue::Text(raw) => parse_relative(raw, prev),
            other => coerce_number(other),
        };

        match resolved {
            Ok(value) => {
                let healed = match program.order {
                    ClampOrder::DeltaThenBounds => {
                        clamp_number(value, prev, program.delta, program.min, program.max)
                    }
                    ClampOrder::BoundsThenDelta => {
                        let bounded = clamp_number(value, None, None, program.min, program.max);
                        clamp_number(bounded, prev, program.delta, None, None)
                    }
                };
                *current = StatusValue::Number(healed);
            }
            Err(raw) => {
                violations.push(format!("`{}`: value `{raw}` is not numeric", program.path));
            }
        }
    }

    if violations.is_empty() {
        Ok(repaired)
    } else {
        Err(ChroniclerError::SchemaViolation {
            details: violations.join("; "),
        })
    }
}

/// Parse a candidate string as either a relative delta (`"+10"`, `"-3"`) on
/// the previous value or an absolute number.
fn parse_relative(raw: &str, previous: Option<f64>) -> Result<f64, String> {
    let trimmed = raw.trim();
    let relative = trimmed.starts_with('+') || trimmed.starts_with('-');
    let parsed: f64 = trimmed
        .trim_start_matches('+')
        .parse()
        .map_err(|_| raw.to_string())?;
    match (relative, previous) {
        (true, Some(prev)) => Ok(prev + parsed),
        _ => Ok(parsed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snap(value: serde_json::Value) -> StatusSnapshot {
        serde_json::from_value(value).unwrap()
    }

    fn names() -> AliasNames {
        AliasNames::new("Player", "Hero")
    }

    fn number_rule(path: &str, min: f64, max: f64, delta: f64) -> RepairRule {
        RepairRule::Number {
            path: path.to_string(),
            min: Some(min),
            max: Some(max),
            delta: Some(delta),
        }
    }

    #[test]
    fn delta_clamp_applies_before_bounds_clamp() {
        let previous = snap(json!({ "Player": { "HP": 50.0 } }));
        let candidate = snap(json!({ "Player": { "HP": 200.0 } }));
        let rules = [number_rule("Player.HP", 0.0, 100.0, 10.0)];
        let repaired = repair(&candidate, &previous, &rules, &names()).unwrap();
        // 50 + 10 = 60, within [0, 100].
        assert_eq!(
            resolve_path(&repaired, "Player.HP", &names()).unwrap().as_number(),
            Some(60.0)
        );
    }

    #[test]
    fn bounds_win_over_delta_when_both_fire() {
        let previous = snap(json!({ "Player": { "HP": 98.0 } }));
        let candidate = snap(json!({ "Player": { "HP": 150.0 } }));
        let rules = [number_rule("Player.HP", 0.0, 100.0, 50.0)];
        let repaired = repair(&candidate, &previous, &rules, &names()).unwrap();
        // Delta would allow 148; bounds pull it back to 100.
        assert_eq!(
            resolve_path(&repaired, "Player.HP", &names()).unwrap().as_number(),
            Some(100.0)
        );
    }

    #[test]
    fn numeric_strings_are_coerced() {
        let previous = snap(json!({ "Player": { "HP": 50.0 } }));
        let candidate = snap(json!({ "Player": { "HP": "55" } }));
        let rules = [number_rule("Player.HP", 0.0, 100.0, 10.0)];
        let repaired = repair(&candidate, &previous, &rules, &names()).unwrap();
        assert_eq!(
            resolve_path(&repaired, "Player.HP", &names()).unwrap().as_number(),
            Some(55.0)
        );
    }

    #[test]
    fn missing_path_is_skipped_silently() {
        let previous = snap(json!({ "Player": { "HP": 50.0 } }));
        let candidate = snap(json!({ "Player": { "MP": 3.0 } }));
        let rules = [number_rule("Player.HP", 0.0, 100.0, 10.0)];
        let repaired = repair(&candidate, &previous, &rules, &names()).unwrap();
        assert_eq!(repaired, candidate);
    }

    #[test]
    fn enum_violation_names_path_and_value() {
        let previous = snap(json!({ "world": { "time": "Day" } }));
        let candidate = snap(json!({ "world": { "time": "Dawn" } }));
        let rules = [RepairRule::Text {
            path: "world.time".to_string(),
            one_of: Some("Day,Night".to_string()),
        }];
        let err = repair(&candidate, &previous, &rules, &names()).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("world.time"));
        assert!(message.contains("Dawn"));
        // Inputs stay untouched.
        assert_eq!(
            resolve_path(&candidate, "world.time", &names()).unwrap(),
            &StatusValue::Text("Dawn".into())
        );
    }

    #[test]
    fn full_width_comma_separates_enum_members() {
        let previous = StatusSnapshot::new();
        let candidate = snap(json!({ "world": { "time": "Night" } }));
        let rules = [RepairRule::Text {
            path: "world.time".to_string(),
            one_of: Some("Day，Night".to_string()),
        }];
        assert!(repair(&candidate, &previous, &rules, &names()).is_ok());
    }

    #[test]
    fn violations_aggregate_into_one_error() {
        let previous = StatusSnapshot::new();
        let candidate = snap(json!({
            "Player": { "HP": "lots" },
            "world": { "time": "Dusk" }
        }));
        let rules = [
            number_rule("Player.HP", 0.0, 100.0, 10.0),
            RepairRule::Text {
                path: "world.time".to_string(),
                one_of: Some("Day,Night".to_string()),
            },
        ];
        let err = repair(&candidate, &previous, &rules, &names()).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("Player.HP"));
        assert!(message.contains("world.time"));
    }

    #[test]
    fn bool_coercion_follows_string_rules() {
        let previous = StatusSnapshot::new();
        let candidate = snap(json!({
            "flags": { "a": "false", "b": "", "c": "yes", "d": 0.0 }
        }));
        let rules = [
            RepairRule::Bool { path: "flags.a".into() },
            RepairRule::Bool { path: "flags.b".into() },
            RepairRule::Bool { path: "flags.c".into() },
            RepairRule::Bool { path: "flags.d".into() },
        ];
        let repaired = repair(&candidate, &previous, &rules, &names()).unwrap();
        let n = names();
        assert_eq!(resolve_path(&repaired, "flags.a", &n).unwrap(), &StatusValue::Bool(false));
        assert_eq!(resolve_path(&repaired, "flags.b", &n).unwrap(), &StatusValue::Bool(false));
        assert_eq!(resolve_path(&repaired, "flags.c", &n).unwrap(), &StatusValue::Bool(true));
        assert_eq!(resolve_path(&repaired, "flags.d", &n).unwrap(), &StatusValue::Bool(false));
    }

    #[test]
    fn programs_parse_relative_deltas() {
        let previous = snap(json!({ "Player": { "HP": 50.0 } }));
        let candidate = snap(json!({ "Player": { "HP": "+10" } }));
        let programs = [FieldProgram {
            path: "Player.HP".into(),
            min: Some(0.0),
            max: Some(100.0),
            delta: Some(30.0),
            order: ClampOrder::DeltaThenBounds,
        }];
        let repaired = apply_programs(&candidate, &previous, &programs, &names()).unwrap();
        assert_eq!(
            resolve_path(&repaired, "Player.HP", &names()).unwrap().as_number(),
            Some(60.0)
        );
    }

    #[test]
    fn programs_honor_configured_clamp_order() {
        let previous = snap(json!({ "Player": { "HP": 10.0 } }));
        let candidate = snap(json!({ "Player": { "HP": 200.0 } }));
        let base = FieldProgram {
            path: "Player.HP".into(),
            min: Some(40.0),
            max: Some(100.0),
            delta: Some(20.0),
            order: ClampOrder::DeltaThenBounds,
        };

        let delta_first = apply_programs(&candidate, &previous, &[base.clone()], &names()).unwrap();
        // Delta pulls 200 to 10 + 20 = 30, then min raises it to 40.
        assert_eq!(
            resolve_path(&delta_first, "Player.HP", &names()).unwrap().as_number(),
            Some(40.0)
        );

        let bounds_first_program = FieldProgram {
            order: ClampOrder::BoundsThenDelta,
            ..base
        };
        let bounds_first =
            apply_programs(&candidate, &previous, &[bounds_first_program], &names()).unwrap();
        // Bounds pull 200 to 100 first, then delta limits the change to 10 + 20 = 30.
        assert_eq!(
            resolve_path(&bounds_first, "Player.HP", &names()).unwrap().as_number(),
            Some(30.0)
        );
    }

    #[test]
    fn programs_repair_plain_numbers_and_relative_strings_together() {
        let previous = snap(json!({ "Player": { "HP": 50.0, "MP": 20.0 } }));
        let candidate = snap(json!({ "Player": { "HP": 120.0, "MP": "-5" } }));
        let programs = [
            FieldProgram {
                path: "Player.HP".into(),
                min: Some(0.0),
                max: Some(100.0),
                delta: None,
                order: ClampOrder::DeltaThenBounds,
            },
            FieldProgram {
                path: "Player.MP".into(),
                min: Some(0.0),
                max: None,
                delta: None,
                order: ClampOrder::DeltaThenBounds,
            },
        ];
        let repaired = apply_programs(&candidate, &previous, &programs, &names()).unwrap();
        let n = names();
        assert_eq!(
            resolve_path(&repaired, "Player.HP", &n).unwrap().as_number(),
            Some(100.0)
        );
        assert_eq!(
            resolve_path(&repaired, "Player.MP", &n).unwrap().as_number(),
            Some(15.0)
        );
    }

    #[test]
    fn negative_relative_delta_subtracts_from_previous() {
        let previous = snap(json!({ "Player": { "HP": 50.0 } }));
        let candidate = snap(json!({ "Player": { "HP": "-5" } }));
        let programs = [FieldProgram {
            path: "Player.HP".into(),
            min: None,
            max: None,
            delta: None,
            order: ClampOrder::DeltaThenBounds,
        }];
        let repaired = apply_programs(&candidate, &previous, &programs, &names()).unwrap();
        assert_eq!(
            resolve_path(&repaired, "Player.HP", &names()).unwrap().as_number(),
            Some(45.0)
        );
    }
}
