//! Named exception rules.
//!
//! A closed set of adjustments for schema entries whose declared layout does not match
//! what files actually contain. Rules come from the project manifest and run after the
//! model is built and before compaction; every applied rule is listed in the report.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::compile::{CompileError, CompileErrorKind};
use crate::expr::{is_reserved_ident, Expr};
use crate::model::{EntityId, Field, Model};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum ExceptionRule {
    /// The field is not read; its value is left at the default.
    SkipField { entity: String, field: String },
    /// Replaces the field's first array length.
    ForceArrayLength {
        entity: String,
        field: String,
        length: String,
    },
    /// Removes the object from the dispatch table.
    ForceAbstract { entity: String },
}

impl ExceptionRule {
    pub fn entity(&self) -> &str {
        match self {
            ExceptionRule::SkipField { entity, .. }
            | ExceptionRule::ForceArrayLength { entity, .. }
            | ExceptionRule::ForceAbstract { entity } => entity,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            ExceptionRule::SkipField { entity, field } => {
                format!("skip_field {entity}.{field}")
            }
            ExceptionRule::ForceArrayLength {
                entity,
                field,
                length,
            } => format!("force_array_length {entity}.{field} = {length}"),
            ExceptionRule::ForceAbstract { entity } => format!("force_abstract {entity}"),
        }
    }
}

pub fn apply_rules(model: &mut Model, rules: &[ExceptionRule]) -> Result<(), CompileError> {
    for rule in rules {
        apply_rule(model, rule)?;
        debug!(rule = %rule.describe(), "applied exception rule");
        model.rules_applied.push(rule.describe());
    }
    Ok(())
}

fn apply_rule(model: &mut Model, rule: &ExceptionRule) -> Result<(), CompileError> {
    let err = |msg: String| {
        CompileError::new(
            CompileErrorKind::ExceptionRule,
            format!("{}: {msg}", rule.describe()),
        )
    };
    let id = model
        .by_name(rule.entity())
        .filter(|e| e.record().is_some())
        .map(|e| e.id)
        .ok_or_else(|| err(format!("no compound or niobject named {:?}", rule.entity())))?;
    match rule {
        ExceptionRule::SkipField { field, .. } => {
            let index = field_index(model, id, field).ok_or_else(|| err(no_field(field)))?;
            if let Some(f) = record_fields(model, id).and_then(|fs| fs.get_mut(index)) {
                f.calculated = true;
            }
        }
        ExceptionRule::ForceArrayLength { field, length, .. } => {
            let index = field_index(model, id, field).ok_or_else(|| err(no_field(field)))?;
            let expr = Expr::parse(length).map_err(|e| err(format!("length {length:?}: {e}")))?;
            let record = model.record(id).ok_or_else(|| err(no_field(field)))?;
            for ident in expr.idents() {
                let scalar = is_reserved_ident(ident)
                    || record
                        .resolve(ident)
                        .and_then(|v| model.field(v))
                        .is_some_and(|f| !f.is_array() && f.ty.is_scalar());
                if !scalar {
                    return Err(err(format!("length reads unknown field {ident:?}")));
                }
            }
            if let Some(f) = record_fields(model, id).and_then(|fs| fs.get_mut(index)) {
                if f.arr1.is_none() {
                    return Err(err(format!("field {field:?} is not an array")));
                }
                f.arr1 = Some(expr);
            }
        }
        ExceptionRule::ForceAbstract { .. } => {
            if !model.entity(id).is_object() {
                return Err(err("only niobjects can be made abstract".to_string()));
            }
            if let Some(r) = model.entities[id.0].record_mut() {
                r.is_abstract = true;
            }
        }
    }
    Ok(())
}

fn field_index(model: &Model, id: EntityId, field: &str) -> Option<usize> {
    model
        .record(id)
        .and_then(|r| r.fields.iter().position(|f| f.name == field))
}

fn record_fields(model: &mut Model, id: EntityId) -> Option<&mut Vec<Field>> {
    model.entities[id.0].record_mut().map(|r| &mut r.fields)
}

fn no_field(field: &str) -> String {
    format!("no own field named {field:?}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::build_test_model;

    fn model() -> Model {
        build_test_model(
            r#"{"schema_version": "nifschema.schema@0.1.0", "entries": [
                {"kind": "basic", "name": "uint", "primitive": "u32"},
                {"kind": "niobject", "name": "NiObject", "abstract": true},
                {"kind": "niobject", "name": "NiExtraData", "inherit": "NiObject",
                 "fields": [{"name": "Num Bytes", "type": "uint"},
                            {"name": "Data", "type": "uint", "arr1": "Num Bytes"}]},
                {"kind": "compound", "name": "Pair", "fields": [{"name": "A", "type": "uint"}]}
            ]}"#,
        )
        .unwrap()
    }

    #[test]
    fn rules_deserialize_by_tag() {
        let rules: Vec<ExceptionRule> = serde_json::from_str(
            r#"[{"rule": "skip_field", "entity": "Pair", "field": "A"},
                {"rule": "force_abstract", "entity": "NiExtraData"}]"#,
        )
        .unwrap();
        assert_eq!(
            rules[1],
            ExceptionRule::ForceAbstract {
                entity: "NiExtraData".into()
            }
        );
    }

    #[test]
    fn applied_rules_are_recorded() {
        let mut m = model();
        apply_rules(
            &mut m,
            &[
                ExceptionRule::SkipField {
                    entity: "Pair".into(),
                    field: "A".into(),
                },
                ExceptionRule::ForceArrayLength {
                    entity: "NiExtraData".into(),
                    field: "Data".into(),
                    length: "Num Bytes / 4".into(),
                },
                ExceptionRule::ForceAbstract {
                    entity: "NiExtraData".into(),
                },
            ],
        )
        .unwrap();
        assert!(m.by_name("Pair").unwrap().record().unwrap().fields[0].calculated);
        let extra = m.by_name("NiExtraData").unwrap().record().unwrap();
        assert_eq!(
            extra.fields[1].arr1.as_ref().map(ToString::to_string).as_deref(),
            Some("Num Bytes / 4")
        );
        assert!(m.dispatch_names().is_empty());
        assert_eq!(m.rules_applied.len(), 3);
        assert_eq!(m.rules_applied[0], "skip_field Pair.A");
    }

    #[test]
    fn unknown_targets_are_errors() {
        for rule in [
            ExceptionRule::SkipField {
                entity: "Nope".into(),
                field: "A".into(),
            },
            ExceptionRule::SkipField {
                entity: "Pair".into(),
                field: "B".into(),
            },
            ExceptionRule::ForceAbstract {
                entity: "Pair".into(),
            },
            ExceptionRule::ForceArrayLength {
                entity: "Pair".into(),
                field: "A".into(),
                length: "3".into(),
            },
        ] {
            let err = apply_rules(&mut model(), &[rule]).unwrap_err();
            assert_eq!(err.kind, CompileErrorKind::ExceptionRule);
        }
    }
}
