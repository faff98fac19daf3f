//! Operation interpreter.
//!
//! Each operation is applied to a mutable JSON document. Paths are walked
//! through objects; a `[]` segment fans out over the array stored there. An
//! absent or `null` element anywhere along a path makes the operation a no-op
//! for that branch. Notes record the concrete path (`contact[1].relationship`)
//! each operation touched.

use serde_json::{Map, Value};

use super::coerce::{coerce, kind};
use super::LossyPolicy;
use crate::error::TransformationError;
use crate::rules::{FieldPath, Operation, Segment, TransformationRule};
use crate::types::{OperationKind, TransformNote};

type Result<T> = std::result::Result<T, TransformationError>;

/// Applies every operation of `rule` to `doc`, in order.
pub(crate) fn apply_rule(
    doc: &mut Value,
    rule: &TransformationRule,
    policy: LossyPolicy,
    notes: &mut Vec<TransformNote>,
) -> Result<()> {
    let mut ctx = Context {
        rule,
        policy,
        notes,
    };
    for op in &rule.operations {
        ctx.apply(doc, op)?;
    }
    Ok(())
}

struct Context<'a> {
    rule: &'a TransformationRule,
    policy: LossyPolicy,
    notes: &'a mut Vec<TransformNote>,
}

impl Context<'_> {
    fn info(&mut self, operation: OperationKind, path: String) {
        self.notes.push(TransformNote::info(
            operation,
            path,
            self.rule.from_version,
            self.rule.to_version,
        ));
    }

    fn apply(&mut self, doc: &mut Value, op: &Operation) -> Result<()> {
        match op {
            Operation::Rename { path, new_path } => self.rename(doc, path, new_path),
            Operation::Wrap { path, wrapper_key } => {
                let mut touched = Vec::new();
                for_each_leaf(doc, path, &mut |value, trail| {
                    let inner = value.take();
                    let mut wrapper = Map::new();
                    wrapper.insert(wrapper_key.clone(), inner);
                    *value = Value::Object(wrapper);
                    touched.push(trail.to_string());
                    Ok(())
                })?;
                for trail in touched {
                    self.info(OperationKind::Wrap, trail);
                }
                Ok(())
            }
            Operation::Unwrap { path, wrapper_key } => {
                let mut touched = Vec::new();
                for_each_leaf(doc, path, &mut |value, trail| {
                    let inner = match value {
                        Value::Object(map) if map.len() == 1 && map.contains_key(wrapper_key) => {
                            map.remove(wrapper_key).unwrap_or(Value::Null)
                        }
                        other => {
                            return Err(TransformationError::ShapeMismatch {
                                path: trail.to_string(),
                                expected: format!("object with the single key '{}'", wrapper_key),
                                found: describe(other),
                            });
                        }
                    };
                    *value = inner;
                    touched.push(trail.to_string());
                    Ok(())
                })?;
                for trail in touched {
                    self.info(OperationKind::Unwrap, trail);
                }
                Ok(())
            }
            Operation::Coerce { path, target } => {
                let mut touched = Vec::new();
                for_each_leaf(doc, path, &mut |value, trail| {
                    *value = coerce(value, *target, trail)?;
                    touched.push(trail.to_string());
                    Ok(())
                })?;
                for trail in touched {
                    self.info(OperationKind::Coerce, trail);
                }
                Ok(())
            }
            Operation::DefaultInject { path, value } => {
                let leaf = &path.leaf().name;
                let mut touched = Vec::new();
                for_each_parent(doc, path.parent(), String::new(), &mut |map, trail| {
                    if map.get(leaf).is_none_or(Value::is_null) {
                        map.insert(leaf.clone(), value.clone());
                        touched.push(join(trail, leaf));
                    }
                    Ok(())
                })?;
                for trail in touched {
                    self.info(OperationKind::DefaultInject, trail);
                }
                Ok(())
            }
            Operation::Drop {
                path,
                lossy,
                reason,
            } => {
                let leaf = &path.leaf().name;
                let mut dropped = Vec::new();
                for_each_parent(doc, path.parent(), String::new(), &mut |map, trail| {
                    if let Some(removed) = map.remove(leaf) {
                        if !removed.is_null() {
                            dropped.push(join(trail, leaf));
                        }
                    }
                    Ok(())
                })?;
                for trail in dropped {
                    if !*lossy {
                        self.info(OperationKind::Drop, trail);
                    } else if self.policy == LossyPolicy::Reject {
                        return Err(TransformationError::LossyRejected {
                            path: trail,
                            reason: reason.clone(),
                        });
                    } else {
                        self.notes.push(
                            TransformNote::warning(
                                OperationKind::Drop,
                                trail,
                                self.rule.from_version,
                                self.rule.to_version,
                            )
                            .with_message(reason.clone()),
                        );
                    }
                }
                Ok(())
            }
        }
    }

    /// Moves values inside every element of the iteration prefix both paths
    /// share.
    fn rename(&mut self, doc: &mut Value, path: &FieldPath, new_path: &FieldPath) -> Result<()> {
        let prefix = path.iteration_prefix_len();
        let source: Vec<&str> = path.names()[prefix..].to_vec();
        let target: Vec<&str> = new_path.names()[prefix..].to_vec();

        let mut touched = Vec::new();
        for_each_parent(
            doc,
            &path.segments()[..prefix],
            String::new(),
            &mut |element, trail| {
                let Some(value) = take_at(element, &source, trail)? else {
                    return Ok(());
                };
                put_at(element, &target, value, trail)?;
                prune_empty(element, &source[..source.len() - 1]);
                touched.push(join(trail, &source.join(".")));
                Ok(())
            },
        )?;
        for trail in touched {
            self.info(OperationKind::Rename, trail);
        }
        Ok(())
    }
}

fn join(trail: &str, name: &str) -> String {
    if trail.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", trail, name)
    }
}

fn describe(value: &Value) -> String {
    kind(value).to_string()
}

fn shape(path: String, expected: &str, found: &Value) -> TransformationError {
    TransformationError::ShapeMismatch {
        path,
        expected: expected.to_string(),
        found: describe(found),
    }
}

/// Calls `f` with every object reached by walking `segments` from `value`.
fn for_each_parent<F>(value: &mut Value, segments: &[Segment], trail: String, f: &mut F) -> Result<()>
where
    F: FnMut(&mut Map<String, Value>, &str) -> Result<()>,
{
    let map = match value {
        Value::Object(map) => map,
        other => {
            let path = if trail.is_empty() { "$".to_string() } else { trail };
            return Err(shape(path, "object", other));
        }
    };

    let Some((first, rest)) = segments.split_first() else {
        return f(map, &trail);
    };

    let child_trail = join(&trail, &first.name);
    match map.get_mut(&first.name) {
        None | Some(Value::Null) => Ok(()),
        Some(child) if first.each => match child {
            Value::Array(items) => {
                for (i, item) in items.iter_mut().enumerate() {
                    for_each_parent(item, rest, format!("{}[{}]", child_trail, i), f)?;
                }
                Ok(())
            }
            other => Err(shape(child_trail, "array", other)),
        },
        Some(child) => for_each_parent(child, rest, child_trail, f),
    }
}

/// Calls `f` with every value addressed by `path`, fanning out over a
/// trailing `[]`.
fn for_each_leaf<F>(doc: &mut Value, path: &FieldPath, f: &mut F) -> Result<()>
where
    F: FnMut(&mut Value, &str) -> Result<()>,
{
    let leaf = path.leaf();
    for_each_parent(doc, path.parent(), String::new(), &mut |map, trail| {
        let leaf_trail = join(trail, &leaf.name);
        match map.get_mut(&leaf.name) {
            None | Some(Value::Null) => Ok(()),
            Some(Value::Array(items)) if leaf.each => {
                for (i, item) in items.iter_mut().enumerate() {
                    if !item.is_null() {
                        f(item, &format!("{}[{}]", leaf_trail, i))?;
                    }
                }
                Ok(())
            }
            Some(other) if leaf.each => Err(shape(leaf_trail, "array", other)),
            Some(value) => f(value, &leaf_trail),
        }
    })
}

/// Removes and returns the value at `names` below `element`.
fn take_at(element: &mut Map<String, Value>, names: &[&str], trail: &str) -> Result<Option<Value>> {
    let Some((leaf, parents)) = names.split_last() else {
        return Ok(None);
    };
    let mut current = element;
    let mut current_trail = trail.to_string();
    for name in parents {
        current_trail = join(&current_trail, name);
        current = match current.get_mut(*name) {
            None | Some(Value::Null) => return Ok(None),
            Some(Value::Object(child)) => child,
            Some(other) => return Err(shape(current_trail, "object", other)),
        };
    }
    Ok(current.remove(*leaf).filter(|v| !v.is_null()))
}

/// Inserts `value` at `names` below `element`, creating intermediate
/// objects.
fn put_at(element: &mut Map<String, Value>, names: &[&str], value: Value, trail: &str) -> Result<()> {
    let Some((leaf, parents)) = names.split_last() else {
        return Ok(());
    };
    let mut current = element;
    let mut current_trail = trail.to_string();
    for name in parents {
        current_trail = join(&current_trail, name);
        let slot = current
            .entry(name.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if slot.is_null() {
            *slot = Value::Object(Map::new());
        }
        current = match slot {
            Value::Object(child) => child,
            other => return Err(shape(current_trail, "object", other)),
        };
    }

    if current.get(*leaf).is_some_and(|v| !v.is_null()) {
        return Err(TransformationError::PathConflict {
            path: join(&current_trail, leaf),
            message: "destination already holds a value".to_string(),
        });
    }
    current.insert(leaf.to_string(), value);
    Ok(())
}

/// Removes objects along `names` that were left empty.
fn prune_empty(element: &mut Map<String, Value>, names: &[&str]) {
    let Some((first, rest)) = names.split_first() else {
        return;
    };
    if let Some(Value::Object(child)) = element.get_mut(*first) {
        prune_empty(child, rest);
        if child.is_empty() {
            element.remove(*first);
        }
    }
}
