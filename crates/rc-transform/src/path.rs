//! Dot-delimited path parsing, with `[*]` selecting all elements of an
//! array along the way (spec §4.4 `shift`).

use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Wildcard,
}

pub fn parse(path: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    for part in path.split('.') {
        if let Some(key) = part.strip_suffix("[*]") {
            segments.push(Segment::Key(key.to_string()));
            segments.push(Segment::Wildcard);
        } else {
            segments.push(Segment::Key(part.to_string()));
        }
    }
    segments
}

/// Reads the value at `segments`. A `Wildcard` maps the remaining path over
/// every array element and collects the results; a missing key anywhere in
/// the chain yields `None` rather than an error (spec treats a missing
/// source path as "field missing", not a rule failure).
pub fn get(value: &Value, segments: &[Segment]) -> Option<Value> {
    match segments.split_first() {
        None => Some(value.clone()),
        Some((Segment::Key(key), rest)) => get(value.get(key)?, rest),
        Some((Segment::Wildcard, rest)) => {
            let items = value.as_array()?;
            let mapped: Vec<Value> = items.iter().filter_map(|item| get(item, rest)).collect();
            Some(Value::Array(mapped))
        }
    }
}

/// Writes `new_value` at the plain dot-delimited path `path`, creating
/// intermediate objects as needed. Output paths do not support `[*]` —
/// `shift`'s wildcard is a read-side fan-out over the source only.
pub fn set(root: &mut Value, path: &str, new_value: Value) {
    if !root.is_object() {
        *root = Value::Object(serde_json::Map::new());
    }
    let mut keys = path.split('.').peekable();
    let mut current = root;
    while let Some(key) = keys.next() {
        let is_last = keys.peek().is_none();
        let map = current.as_object_mut().expect("current is always an object");
        if is_last {
            map.insert(key.to_string(), new_value);
            return;
        }
        let entry = map
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(serde_json::Map::new());
        }
        current = entry;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_wildcard_segment() {
        let segments = parse("items[*].price");
        assert_eq!(
            segments,
            vec![
                Segment::Key("items".into()),
                Segment::Wildcard,
                Segment::Key("price".into()),
            ]
        );
    }

    #[test]
    fn get_follows_nested_keys() {
        let value = json!({"a": {"b": 1}});
        assert_eq!(get(&value, &parse("a.b")), Some(json!(1)));
        assert_eq!(get(&value, &parse("a.c")), None);
    }

    #[test]
    fn get_maps_wildcard_over_array() {
        let value = json!({"items": [{"price": 1}, {"price": 2}]});
        assert_eq!(get(&value, &parse("items[*].price")), Some(json!([1, 2])));
    }

    #[test]
    fn set_creates_nested_objects() {
        let mut root = json!({});
        set(&mut root, "a.b.c", json!(5));
        assert_eq!(root, json!({"a": {"b": {"c": 5}}}));
    }
}
