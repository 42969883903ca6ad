use serde_json::{Map, Value};

/// Powers of two starting at 1, capped by `max`. The result always
/// contains 1, even when `max` is 0.
pub fn power_of_two_ladder(max: u64) -> Vec<u64> {
    let mut out = Vec::new();
    let mut value: u64 = 1;
    loop {
        out.push(value);
        if value.saturating_mul(2) > max {
            break;
        }
        value *= 2;
    }
    out
}

/// Cartesian product over a flat parameter map.
///
/// Array values are choice points; scalar values are held constant. Keys
/// keep their insertion order and the rightmost key iterates fastest. An
/// empty choice list anywhere collapses the product to nothing.
pub fn parameter_combinations(params: &Map<String, Value>) -> Vec<Map<String, Value>> {
    let keys: Vec<&String> = params.keys().collect();
    let choices: Vec<Vec<Value>> = params
        .values()
        .map(|v| match v {
            Value::Array(items) => items.clone(),
            other => vec![other.clone()],
        })
        .collect();

    cartesian_rows(&choices)
        .into_iter()
        .map(|row| {
            let mut combo = Map::new();
            for (key, value) in keys.iter().zip(row) {
                combo.insert((*key).clone(), value);
            }
            combo
        })
        .collect()
}

/// Cartesian expansion of a nested serving-parameter map.
///
/// An object expands to the product of its members' expansions. A list
/// whose elements are all objects expands element-wise and keeps its list
/// shape (so `instance_group: [{count: [1, 2], ...}]` yields one
/// single-element list per count). Any other list is a choice point.
pub fn config_combinations(params: &Map<String, Value>) -> Vec<Map<String, Value>> {
    let keys: Vec<&String> = params.keys().collect();
    let choices: Vec<Vec<Value>> = params.values().map(expand).collect();

    cartesian_rows(&choices)
        .into_iter()
        .map(|row| {
            let mut combo = Map::new();
            for (key, value) in keys.iter().zip(row) {
                combo.insert((*key).clone(), value);
            }
            combo
        })
        .collect()
}

fn expand(value: &Value) -> Vec<Value> {
    match value {
        Value::Object(map) => config_combinations(map)
            .into_iter()
            .map(Value::Object)
            .collect(),
        Value::Array(items) if !items.is_empty() && items.iter().all(Value::is_object) => {
            let element_choices: Vec<Vec<Value>> = items.iter().map(expand).collect();
            cartesian_rows(&element_choices)
                .into_iter()
                .map(Value::Array)
                .collect()
        }
        Value::Array(items) => items.iter().flat_map(expand).collect(),
        other => vec![other.clone()],
    }
}

fn cartesian_rows(choices: &[Vec<Value>]) -> Vec<Vec<Value>> {
    if choices.iter().any(Vec::is_empty) {
        return Vec::new();
    }
    let total: usize = choices.iter().map(Vec::len).product();
    let mut rows = Vec::with_capacity(total);
    let mut cursor = vec![0usize; choices.len()];
    for _ in 0..total {
        rows.push(
            cursor
                .iter()
                .enumerate()
                .map(|(i, &c)| choices[i][c].clone())
                .collect(),
        );
        for i in (0..cursor.len()).rev() {
            cursor[i] += 1;
            if cursor[i] < choices[i].len() {
                break;
            }
            cursor[i] = 0;
        }
    }
    rows
}

/// Recursive overwrite of `base` by `overlay`. When both sides at a key
/// are objects the merge recurses; otherwise the overlay side replaces the
/// base side wholesale, including scalar/object type changes. Inputs are
/// left untouched.
pub fn deep_merge(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(b), Value::Object(o)) => Value::Object(deep_merge_maps(b, o)),
        (_, other) => other.clone(),
    }
}

/// Object-level entry point of [`deep_merge`].
pub fn deep_merge_maps(
    base: &Map<String, Value>,
    overlay: &Map<String, Value>,
) -> Map<String, Value> {
    let mut merged = base.clone();
    for (key, value) in overlay {
        let entry = match merged.get(key) {
            Some(existing) => deep_merge(existing, value),
            None => value.clone(),
        };
        merged.insert(key.clone(), entry);
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn as_map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn ladder_covers_powers_up_to_max() {
        assert_eq!(power_of_two_ladder(1), vec![1]);
        assert_eq!(power_of_two_ladder(8), vec![1, 2, 4, 8]);
        assert_eq!(power_of_two_ladder(1024).len(), 11);
    }

    #[test]
    fn ladder_caps_at_non_power_of_two() {
        assert_eq!(power_of_two_ladder(100), vec![1, 2, 4, 8, 16, 32, 64]);
        assert_eq!(power_of_two_ladder(0), vec![1]);
    }

    #[test]
    fn parameter_combinations_rightmost_fastest() {
        let params = as_map(json!({"a": [1, 2], "b": ["x", "y"]}));
        let combos = parameter_combinations(&params);
        let flat: Vec<(i64, &str)> = combos
            .iter()
            .map(|c| {
                (
                    c["a"].as_i64().expect("int"),
                    c["b"].as_str().expect("str"),
                )
            })
            .collect();
        assert_eq!(flat, vec![(1, "x"), (1, "y"), (2, "x"), (2, "y")]);
    }

    #[test]
    fn parameter_combinations_holds_scalars_constant() {
        let params = as_map(json!({"fixed": "v", "swept": [1, 2, 3]}));
        let combos = parameter_combinations(&params);
        assert_eq!(combos.len(), 3);
        assert!(combos.iter().all(|c| c["fixed"] == json!("v")));
    }

    #[test]
    fn parameter_combinations_empty_list_collapses() {
        let params = as_map(json!({"a": [1, 2], "b": []}));
        assert!(parameter_combinations(&params).is_empty());
    }

    #[test]
    fn parameter_combinations_of_empty_map_is_single_empty_combo() {
        let combos = parameter_combinations(&Map::new());
        assert_eq!(combos, vec![Map::new()]);
    }

    #[test]
    fn config_combinations_lifts_list_of_structures() {
        let params = as_map(json!({
            "max_batch_size": [1, 4, 16],
            "instance_group": [{"kind": "KIND_GPU", "count": [1, 2]}],
        }));
        let combos = config_combinations(&params);
        assert_eq!(combos.len(), 6);
        assert_eq!(
            combos[0]["instance_group"],
            json!([{"kind": "KIND_GPU", "count": 1}])
        );
        assert_eq!(combos[1]["instance_group"],
            json!([{"kind": "KIND_GPU", "count": 2}])
        );
        assert_eq!(combos[0]["max_batch_size"], json!(1));
        assert_eq!(combos[5]["max_batch_size"], json!(16));
        assert_eq!(combos[5]["instance_group"][0]["count"], json!(2));
    }

    #[test]
    fn config_combinations_expands_nested_objects() {
        let params = as_map(json!({
            "parameters": {"param1": {"string_value": ["foo", "bar"]}},
        }));
        let combos = config_combinations(&params);
        assert_eq!(combos.len(), 2);
        assert_eq!(combos[0]["parameters"]["param1"]["string_value"], json!("foo"));
        assert_eq!(combos[1]["parameters"]["param1"]["string_value"], json!("bar"));
    }

    #[test]
    fn config_combinations_multi_element_group() {
        let params = as_map(json!({
            "instance_group": [
                {"kind": "KIND_GPU", "count": [1, 2]},
                {"kind": "KIND_CPU", "count": 1},
            ],
        }));
        let combos = config_combinations(&params);
        assert_eq!(combos.len(), 2);
        assert_eq!(
            combos[0]["instance_group"],
            json!([
                {"kind": "KIND_GPU", "count": 1},
                {"kind": "KIND_CPU", "count": 1},
            ])
        );
    }

    #[test]
    fn deep_merge_identity_on_empty_overlay() {
        let base = json!({"a": 1, "b": {"c": 2}});
        assert_eq!(deep_merge(&base, &json!({})), base);
    }

    #[test]
    fn deep_merge_is_idempotent() {
        let base = json!({"a": 1, "b": {"c": 5, "d": 6}});
        let overlay = json!({"b": {"c": 7}, "e": 8});
        let once = deep_merge(&base, &overlay);
        let twice = deep_merge(&once, &overlay);
        assert_eq!(once, twice);
        assert_eq!(once, json!({"a": 1, "b": {"c": 7, "d": 6}, "e": 8}));
    }

    #[test]
    fn deep_merge_replaces_on_type_change() {
        let base = json!({"a": 1, "b": {"c": 5, "d": 6}});
        assert_eq!(deep_merge(&base, &json!({"b": 2})), json!({"a": 1, "b": 2}));

        let base = json!({"a": 1, "b": 3});
        assert_eq!(
            deep_merge(&base, &json!({"b": {"c": 7, "d": 8}})),
            json!({"a": 1, "b": {"c": 7, "d": 8}})
        );
    }

    #[test]
    fn deep_merge_recurses_into_shared_objects() {
        let base = json!({"a": 1, "b": {"c": {"e": 9, "f": 10}, "d": 6}});
        let overlay = json!({"b": {"c": {"e": 11}}});
        assert_eq!(
            deep_merge(&base, &overlay),
            json!({"a": 1, "b": {"c": {"e": 11, "f": 10}, "d": 6}})
        );
    }

    #[test]
    fn deep_merge_replaces_arrays_wholesale() {
        let base = json!({"groups": [{"count": 1}, {"count": 2}]});
        let overlay = json!({"groups": [{"count": 3}]});
        assert_eq!(deep_merge(&base, &overlay), overlay);
    }
}
