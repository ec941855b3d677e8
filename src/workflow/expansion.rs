use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::OnceLock;

fn reference_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{([A-Za-z0-9_.-]+?)(\.output)?\}").unwrap())
}

/// Substitute `${var}` and `${taskId.output}` references in a task input.
///
/// A string that is exactly one reference is replaced by the referenced
/// value with its structure intact; embedded references interpolate the
/// value's string form. Unknown variables are left verbatim; unknown or
/// absent task outputs resolve to null, which is what the `ignore`
/// failure policy relies on.
pub fn expand_input(
    input: &Value,
    variables: &HashMap<String, Value>,
    outputs: &HashMap<String, Value>,
) -> Value {
    match input {
        Value::String(text) => expand_string(text, variables, outputs),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| expand_input(item, variables, outputs))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, value)| (key.clone(), expand_input(value, variables, outputs)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn expand_string(
    text: &str,
    variables: &HashMap<String, Value>,
    outputs: &HashMap<String, Value>,
) -> Value {
    let pattern = reference_pattern();

    // Whole-string reference keeps the value's type.
    if let Some(captures) = pattern.captures(text) {
        if captures.get(0).map(|m| m.as_str()) == Some(text) {
            return resolve(&captures, variables, outputs)
                .unwrap_or_else(|| Value::String(text.to_string()));
        }
    }

    let replaced = pattern.replace_all(text, |captures: &regex::Captures<'_>| {
        match resolve(captures, variables, outputs) {
            Some(Value::String(s)) => s,
            Some(Value::Null) => "null".to_string(),
            Some(value) => value.to_string(),
            None => captures[0].to_string(),
        }
    });
    Value::String(replaced.into_owned())
}

fn resolve(
    captures: &regex::Captures<'_>,
    variables: &HashMap<String, Value>,
    outputs: &HashMap<String, Value>,
) -> Option<Value> {
    let name = &captures[1];
    if captures.get(2).is_some() {
        // Task output binding; absent outputs are null by contract.
        Some(outputs.get(name).cloned().unwrap_or(Value::Null))
    } else {
        variables.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars() -> HashMap<String, Value> {
        HashMap::from([
            ("target".to_string(), json!("release")),
            ("jobs".to_string(), json!(8)),
        ])
    }

    fn outputs() -> HashMap<String, Value> {
        HashMap::from([("build".to_string(), json!({"artifact": "app.tar.gz"}))])
    }

    #[test]
    fn whole_string_variable_keeps_type() {
        let input = json!({"parallelism": "${jobs}"});
        let expanded = expand_input(&input, &vars(), &outputs());
        assert_eq!(expanded, json!({"parallelism": 8}));
    }

    #[test]
    fn embedded_variable_interpolates() {
        let input = json!({"cmd": "cargo build --profile ${target}"});
        let expanded = expand_input(&input, &vars(), &outputs());
        assert_eq!(expanded, json!({"cmd": "cargo build --profile release"}));
    }

    #[test]
    fn task_output_binding_resolves_structure() {
        let input = json!({"from": "${build.output}"});
        let expanded = expand_input(&input, &vars(), &outputs());
        assert_eq!(expanded, json!({"from": {"artifact": "app.tar.gz"}}));
    }

    #[test]
    fn missing_output_resolves_to_null() {
        let input = json!({"from": "${missing.output}"});
        let expanded = expand_input(&input, &vars(), &outputs());
        assert_eq!(expanded, json!({"from": null}));
    }

    #[test]
    fn unknown_variable_is_left_verbatim() {
        let input = json!("echo ${unset}");
        let expanded = expand_input(&input, &vars(), &outputs());
        assert_eq!(expanded, json!("echo ${unset}"));
    }

    #[test]
    fn nested_arrays_and_objects_are_walked() {
        let input = json!({"steps": [{"run": "${target}"}, "plain"]});
        let expanded = expand_input(&input, &vars(), &outputs());
        assert_eq!(expanded, json!({"steps": [{"run": "release"}, "plain"]}));
    }
}
