use serde_json::Value;

/// Visit every string leaf in the tree, nested structures included.
pub fn for_each_string_leaf<'a>(value: &'a Value, visit: &mut dyn FnMut(&'a str)) {
    match value {
        Value::String(text) => visit(text),
        Value::Array(items) => {
            for item in items {
                for_each_string_leaf(item, visit);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                for_each_string_leaf(item, visit);
            }
        }
        _ => {}
    }
}

pub fn collect_string_leaves(value: &Value) -> Vec<&str> {
    let mut leaves = Vec::new();
    for_each_string_leaf(value, &mut |text| leaves.push(text));
    leaves
}

/// Rewrite string leaves in place, replacing every occurrence of each
/// needle. Used by redaction; needles are exact matched substrings, so
/// replacement order does not change the final body.
pub fn replace_in_string_leaves(value: &mut Value, replacements: &[(String, String)]) {
    match value {
        Value::String(text) => {
            for (needle, replacement) in replacements {
                if text.contains(needle.as_str()) {
                    *text = text.replace(needle.as_str(), replacement.as_str());
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                replace_in_string_leaves(item, replacements);
            }
        }
        Value::Object(map) => {
            for item in map.values_mut() {
                replace_in_string_leaves(item, replacements);
            }
        }
        _ => {}
    }
}
