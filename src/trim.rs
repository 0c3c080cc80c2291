use serde_json::{Map, Value};

/// Keys that never help the model judge relevance and bloat prompts.
const DROP_KEYS: &[&str] = &[
    "image",
    "images",
    "thumbnail",
    "thumbnailUrl",
    "logo",
    "video",
    "hasPart",
    "mainEntityOfPage",
    "potentialAction",
    "sameAs",
    "publisher",
];

/// Shrink a serialised schema object for prompt interpolation.
///
/// Accepts both a single object and an array of objects (the retriever
/// merges duplicate URLs from multiple backends into an array); an array
/// is flattened by merging keys, first writer wins.
pub fn trim_json(schema_json: &str) -> String {
    trim_with_limits(schema_json, 500, 10)
}

/// Harder variant for synthesis prompts over many items.
pub fn trim_json_hard(schema_json: &str) -> String {
    trim_with_limits(schema_json, 200, 5)
}

fn trim_with_limits(schema_json: &str, max_str: usize, max_arr: usize) -> String {
    let Ok(value) = serde_json::from_str::<Value>(schema_json) else {
        // Not JSON: hand back a capped slice of the raw text.
        return truncate_str(schema_json, max_str * 4);
    };
    let flattened = flatten_payload(value);
    let trimmed = trim_value(flattened, max_str, max_arr);
    serde_json::to_string(&trimmed).unwrap_or_default()
}

/// Merge an array-of-objects payload into one object; leave anything else
/// untouched.
pub fn flatten_payload(value: Value) -> Value {
    match value {
        Value::Array(items) if items.iter().all(|i| i.is_object()) && !items.is_empty() => {
            let mut merged = Map::new();
            for item in items {
                if let Value::Object(map) = item {
                    for (k, v) in map {
                        merged.entry(k).or_insert(v);
                    }
                }
            }
            Value::Object(merged)
        }
        other => other,
    }
}

fn trim_value(value: Value, max_str: usize, max_arr: usize) -> Value {
    match value {
        Value::Object(map) => {
            let trimmed: Map<String, Value> = map
                .into_iter()
                .filter(|(k, _)| !DROP_KEYS.contains(&k.as_str()))
                .map(|(k, v)| (k, trim_value(v, max_str, max_arr)))
                .collect();
            Value::Object(trimmed)
        }
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .take(max_arr)
                .map(|v| trim_value(v, max_str, max_arr))
                .collect(),
        ),
        Value::String(s) => Value::String(truncate_str(&s, max_str)),
        other => other,
    }
}

fn truncate_str(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max).collect();
        out.push('…');
        out
    }
}
