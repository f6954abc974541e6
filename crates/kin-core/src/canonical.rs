//! Canonical JSON: object keys sorted bytewise at every depth, no insignificant
//! whitespace. Two values with the same content always serialise to the same
//! bytes regardless of the order their keys were inserted in.

use serde_json::Value;

pub fn to_canonical_string(value: &Value) -> String {
    let mut out = String::new();
    write_value(value, &mut out);
    out
}

pub fn to_canonical_bytes(value: &Value) -> Vec<u8> {
    to_canonical_string(value).into_bytes()
}

fn write_value(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_value(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out);
            }
            out.push(']');
        }
        Value::String(s) => write_string(s, out),
        // null, bool and numbers have a single serde_json rendering
        other => out.push_str(&other.to_string()),
    }
}

fn write_string(s: &str, out: &mut String) {
    out.push_str(&Value::String(s.to_owned()).to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    #[test]
    fn key_order_does_not_matter() {
        let mut a = Map::new();
        a.insert("zeta".into(), json!(1));
        a.insert("alpha".into(), json!({"b": 2, "a": [3, {"y": null, "x": "s"}]}));
        let mut b = Map::new();
        b.insert("alpha".into(), json!({"a": [3, {"x": "s", "y": null}], "b": 2}));
        b.insert("zeta".into(), json!(1));

        let a = to_canonical_string(&Value::Object(a));
        let b = to_canonical_string(&Value::Object(b));
        assert_eq!(a, b);
        assert_eq!(a, r#"{"alpha":{"a":[3,{"x":"s","y":null}],"b":2},"zeta":1}"#);
    }

    #[test]
    fn strings_are_escaped() {
        let v = json!({"q": "say \"hi\"\n"});
        assert_eq!(to_canonical_string(&v), r#"{"q":"say \"hi\"\n"}"#);
    }
}
