//! Structured-output merging
//!
//! Task inputs and run outputs are both top-level key-wise unions:
//! `run.input ∪ parent outputs` for tasks, `run.input ∪ leaf outputs` for the
//! run. Later contributors win on key conflict, in declaration order. A
//! contributor that is not a JSON object is injected under its step slug so
//! list-valued map-step outputs survive the union.

use serde_json::{Map, Value};

/// Fold one step output into the accumulating object. Object outputs merge
/// key-wise (right wins); anything else lands under the step's slug.
pub fn fold_output(acc: &mut Map<String, Value>, slug: &str, output: &Value) {
    match output {
        Value::Object(fields) => {
            for (key, value) in fields {
                acc.insert(key.clone(), value.clone());
            }
        }
        other => {
            acc.insert(slug.to_string(), other.clone());
        }
    }
}

/// Seed the accumulator from the run input. A non-object run input is kept
/// under the reserved `run` key, which no step slug can shadow.
pub fn seed_from_input(input: &Value) -> Map<String, Value> {
    let mut acc = Map::new();
    match input {
        Value::Object(fields) => acc.extend(fields.clone()),
        Value::Null => {}
        other => {
            acc.insert("run".to_string(), other.clone());
        }
    }
    acc
}

/// Merge the run input with a sequence of `(slug, output)` contributors, in
/// order. Used for both task-input materialization and the run output.
pub fn merge_outputs<'a, I>(input: &Value, contributors: I) -> Value
where
    I: IntoIterator<Item = (&'a str, &'a Value)>,
{
    let mut acc = seed_from_input(input);
    for (slug, output) in contributors {
        fold_output(&mut acc, slug, output);
    }
    Value::Object(acc)
}

/// The list a map step fans out over, extracted from its parent's output.
/// An array is taken as-is. An object with exactly one array-valued entry
/// yields that entry, so steps that return `{"items": [...]}` alongside
/// pass-through keys still fan out element-wise. Anything else is treated as
/// a single item.
pub fn fan_out_source(output: &Value) -> Value {
    match output {
        Value::Array(_) => output.clone(),
        Value::Object(fields) => {
            let mut arrays = fields.values().filter(|v| v.is_array());
            match (arrays.next(), arrays.next()) {
                (Some(only_array), None) => only_array.clone(),
                _ => output.clone(),
            }
        }
        other => other.clone(),
    }
}

/// Input for map-step task `index`: the merged base plus the `item` drawn from
/// the parent's list output. A missing element yields `null`, matching a
/// declared `initial_tasks` larger than the parent list.
pub fn map_task_input(base: &Value, parent_output: &Value, index: usize) -> Value {
    let mut acc = match base {
        Value::Object(fields) => fields.clone(),
        other => seed_from_input(other),
    };
    let item = match parent_output {
        Value::Array(items) => items.get(index).cloned().unwrap_or(Value::Null),
        other => other.clone(),
    };
    acc.insert("item".to_string(), item);
    Value::Object(acc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn object_outputs_union_key_wise() {
        let merged = merge_outputs(
            &json!({"test": "data"}),
            vec![("s", &json!({"r": "done"}))],
        );
        assert_eq!(merged, json!({"test": "data", "r": "done"}));
    }

    #[test]
    fn later_contributor_wins_on_conflict() {
        let l = json!({"k": "left", "l": 1});
        let r = json!({"k": "right", "r": 2});
        let merged = merge_outputs(&json!({}), vec![("l", &l), ("r", &r)]);
        assert_eq!(merged, json!({"k": "right", "l": 1, "r": 2}));
    }

    #[test]
    fn step_output_shadows_run_input() {
        let out = json!({"test": "overridden"});
        let merged = merge_outputs(&json!({"test": "data"}), vec![("s", &out)]);
        assert_eq!(merged, json!({"test": "overridden"}));
    }

    #[test]
    fn non_object_output_lands_under_slug() {
        let list = json!([1, 2, 3]);
        let merged = merge_outputs(&json!({}), vec![("process", &list)]);
        assert_eq!(merged, json!({"process": [1, 2, 3]}));
    }

    #[test]
    fn non_object_run_input_kept_under_run_key() {
        let merged = merge_outputs(&json!("raw"), vec![]);
        assert_eq!(merged, json!({"run": "raw"}));
    }

    #[test]
    fn empty_input_reflects_outputs_only() {
        let out = json!({"a": 1});
        let merged = merge_outputs(&json!({}), vec![("s", &out)]);
        assert_eq!(merged, json!({"a": 1}));
    }

    #[test]
    fn fan_out_source_takes_arrays_verbatim() {
        assert_eq!(fan_out_source(&json!([1, 2])), json!([1, 2]));
    }

    #[test]
    fn fan_out_source_unwraps_sole_array_entry() {
        let out = json!({"test": "data", "items": [10, 20, 30]});
        assert_eq!(fan_out_source(&out), json!([10, 20, 30]));
    }

    #[test]
    fn fan_out_source_keeps_ambiguous_objects_whole() {
        let two_arrays = json!({"a": [1], "b": [2]});
        assert_eq!(fan_out_source(&two_arrays), two_arrays);

        let no_arrays = json!({"a": 1});
        assert_eq!(fan_out_source(&no_arrays), no_arrays);
    }

    #[test]
    fn map_task_input_picks_indexed_item() {
        let base = merge_outputs(&json!({}), vec![]);
        let parent = json!([10, 20, 30]);
        assert_eq!(map_task_input(&base, &parent, 0), json!({"item": 10}));
        assert_eq!(map_task_input(&base, &parent, 2), json!({"item": 30}));
        assert_eq!(map_task_input(&base, &parent, 5), json!({"item": null}));
    }

    #[test]
    fn map_task_input_with_scalar_parent_repeats_it() {
        let base = json!({"cfg": true});
        assert_eq!(
            map_task_input(&base, &json!(42), 1),
            json!({"cfg": true, "item": 42})
        );
    }
}
