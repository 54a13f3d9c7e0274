use serde_json::Value;

/// Nodes visited before the estimate falls back to a flat per-node guess.
const MAX_NODES: usize = 50_000;
/// Containers deeper than this are counted, not walked.
const MAX_DEPTH: usize = 64;
/// Flat guess for a node that is not walked.
const UNWALKED_NODE_BYTES: usize = 16;

/// Approximate serialized size of `value` in bytes.
///
/// Walks the value iteratively with a node budget and a depth cap, so it is
/// cheap on huge inputs and never recurses. The result is close to the
/// length of the compact JSON encoding, not an exact count.
pub fn estimate_size(value: &Value) -> usize {
    let mut total = 0usize;
    let mut visited = 0usize;
    let mut stack: Vec<(&Value, usize)> = vec![(value, 0)];

    while let Some((node, depth)) = stack.pop() {
        visited += 1;
        if visited > MAX_NODES {
            total = total.saturating_add((stack.len() + 1) * UNWALKED_NODE_BYTES);
            break;
        }

        let own = match node {
            Value::Null => 4,
            Value::Bool(b) => {
                if *b {
                    4
                } else {
                    5
                }
            }
            Value::Number(n) => number_len(n),
            Value::String(s) => s.len() + 2,
            Value::Array(items) => {
                if depth >= MAX_DEPTH {
                    2 + items.len() * UNWALKED_NODE_BYTES
                } else {
                    stack.extend(items.iter().map(|child| (child, depth + 1)));
                    2 + items.len().saturating_sub(1)
                }
            }
            Value::Object(map) => {
                if depth >= MAX_DEPTH {
                    2 + map.len() * UNWALKED_NODE_BYTES
                } else {
                    let keys: usize = map.keys().map(|k| k.len() + 3).sum();
                    stack.extend(map.values().map(|child| (child, depth + 1)));
                    2 + keys + map.len().saturating_sub(1)
                }
            }
        };
        total = total.saturating_add(own);
    }

    total
}

fn number_len(n: &serde_json::Number) -> usize {
    if let Some(i) = n.as_i64() {
        decimal_digits(i.unsigned_abs()) + usize::from(i < 0)
    } else if let Some(u) = n.as_u64() {
        decimal_digits(u)
    } else {
        // Floats: shortest round-trip form is at most 24 chars
        12
    }
}

fn decimal_digits(mut n: u64) -> usize {
    let mut digits = 1;
    while n >= 10 {
        n /= 10;
        digits += 1;
    }
    digits
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_matches_compact_json_for_simple_values() {
        for value in [
            json!(null),
            json!(true),
            json!(false),
            json!(12345),
            json!(-7),
            json!("hello"),
            json!([1, 2, 3]),
            json!({"valid": true, "title": "Example"}),
            json!({"a": {"b": [1, "x", null]}}),
        ] {
            let exact = serde_json::to_string(&value).unwrap().len();
            assert_eq!(estimate_size(&value), exact, "value: {value}");
        }
    }

    #[test]
    fn test_deep_nesting_does_not_recurse() {
        let mut value = json!("leaf");
        for _ in 0..1_000 {
            value = json!([value]);
        }
        let size = estimate_size(&value);
        assert!(size > 0);
        assert!(size < 1_000 * UNWALKED_NODE_BYTES);
    }

    #[test]
    fn test_node_budget_bounds_work() {
        let wide = Value::Array(vec![json!(1); MAX_NODES * 2]);
        let size = estimate_size(&wide);
        assert!(size >= MAX_NODES);
    }
}
