//! Patch engine: folds partial-update operations into a JSON document.
//!
//! Operations follow the JSON Patch shape (`{"op": "add", "path": "/a/b", "value": ..}`)
//! with one relaxation: `add` and `replace` create any missing intermediate
//! containers instead of failing. A path segment followed by a numeric index or
//! `-` materializes as an array, anything else as an object.
//!
//! `apply` never touches its input. A batch is applied to a private copy and the
//! copy is only returned when every operation succeeded.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ChatError;

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Operation {
    Add { path: String, value: Value },
    Replace { path: String, value: Value },
    Remove { path: String },
    Move { from: String, path: String },
    Copy { from: String, path: String },
    Test { path: String, value: Value },
}

impl Operation {
    pub fn path(&self) -> &str {
        match self {
            Operation::Add { path, .. }
            | Operation::Replace { path, .. }
            | Operation::Remove { path }
            | Operation::Move { path, .. }
            | Operation::Copy { path, .. }
            | Operation::Test { path, .. } => path,
        }
    }
}

/// Body of one stream `message` event: a single operation or an ordered batch.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PatchPayload {
    Batch(Vec<Operation>),
    Single(Operation),
}

impl PatchPayload {
    pub fn operations(&self) -> &[Operation] {
        match self {
            PatchPayload::Batch(ops) => ops,
            PatchPayload::Single(op) => std::slice::from_ref(op),
        }
    }

    pub fn len(&self) -> usize {
        self.operations().len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations().is_empty()
    }
}

impl From<Operation> for PatchPayload {
    fn from(op: Operation) -> Self {
        PatchPayload::Single(op)
    }
}

impl From<Vec<Operation>> for PatchPayload {
    fn from(ops: Vec<Operation>) -> Self {
        PatchPayload::Batch(ops)
    }
}

/// Apply a payload to `document`, returning the patched copy.
pub fn apply(document: &Value, payload: &PatchPayload) -> Result<Value, ChatError> {
    let mut next = document.clone();
    for op in payload.operations() {
        apply_operation(&mut next, op)?;
    }
    Ok(next)
}

/// Apply one operation in place. On error `document` may be partially modified;
/// callers wanting atomicity go through [`apply`].
pub fn apply_operation(document: &mut Value, op: &Operation) -> Result<(), ChatError> {
    match op {
        Operation::Add { path, value } => write(document, path, value.clone(), Write::Insert),
        Operation::Replace { path, value } => write(document, path, value.clone(), Write::Set),
        Operation::Remove { path } => remove(document, path).map(|_| ()),
        Operation::Move { from, path } => {
            if path.starts_with(&format!("{}/", from)) {
                return Err(invalid(format!("cannot move {} into its own child {}", from, path)));
            }
            let value = remove(document, from)?;
            write(document, path, value, Write::Insert)
        }
        Operation::Copy { from, path } => {
            let value = lookup(document, from)?.clone();
            write(document, path, value, Write::Insert)
        }
        Operation::Test { path, value } => {
            let actual = lookup(document, path)?;
            if actual == value {
                Ok(())
            } else {
                Err(invalid(format!("test failed at {}", path)))
            }
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Write {
    /// Arrays shift elements right
    Insert,
    /// Arrays overwrite in place
    Set,
}

fn invalid(message: String) -> ChatError {
    ChatError::InvalidPatch { message }
}

fn missing(path: &str) -> ChatError {
    ChatError::PatchTargetMissing {
        path: path.to_string(),
    }
}

/// Split a JSON pointer into unescaped reference tokens.
fn tokens(path: &str) -> Result<Vec<String>, ChatError> {
    if path.is_empty() {
        return Ok(Vec::new());
    }
    let Some(rest) = path.strip_prefix('/') else {
        return Err(invalid(format!("path must start with '/': {}", path)));
    };
    Ok(rest
        .split('/')
        .map(|t| t.replace("~1", "/").replace("~0", "~"))
        .collect())
}

fn is_index_token(token: &str) -> bool {
    token == "-" || (!token.is_empty() && token.bytes().all(|b| b.is_ascii_digit()))
}

fn container_for(token: &str) -> Value {
    if is_index_token(token) {
        Value::Array(Vec::new())
    } else {
        Value::Object(Map::new())
    }
}

fn parse_index(token: &str, len: usize, path: &str) -> Result<usize, ChatError> {
    if token == "-" {
        return Ok(len);
    }
    if token.len() > 1 && token.starts_with('0') {
        return Err(invalid(format!("leading zero in array index at {}", path)));
    }
    token
        .parse::<usize>()
        .map_err(|_| invalid(format!("expected array index at {}", path)))
}

fn lookup<'a>(document: &'a Value, path: &str) -> Result<&'a Value, ChatError> {
    let mut current = document;
    for token in tokens(path)? {
        current = match current {
            Value::Object(map) => map.get(&token),
            Value::Array(items) => token.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        }
        .ok_or_else(|| missing(path))?;
    }
    Ok(current)
}

fn write(document: &mut Value, path: &str, value: Value, mode: Write) -> Result<(), ChatError> {
    let tokens = tokens(path)?;
    let Some((last, parents)) = tokens.split_last() else {
        *document = value;
        return Ok(());
    };

    let mut current = document;
    for (i, token) in parents.iter().enumerate() {
        if current.is_null() {
            *current = container_for(token);
        }
        let next_token = tokens[i + 1].as_str();
        current = match current {
            Value::Object(map) => map
                .entry(token.clone())
                .or_insert_with(|| container_for(next_token)),
            Value::Array(items) => {
                let index = parse_index(token, items.len(), path)?;
                if index == items.len() {
                    items.push(container_for(next_token));
                } else if index > items.len() {
                    return Err(invalid(format!("array index out of bounds at {}", path)));
                }
                &mut items[index]
            }
            _ => return Err(invalid(format!("cannot traverse scalar at {}", path))),
        };
    }

    if current.is_null() {
        *current = container_for(last);
    }
    match current {
        Value::Object(map) => {
            map.insert(last.clone(), value);
            Ok(())
        }
        Value::Array(items) => {
            let index = parse_index(last, items.len(), path)?;
            match (mode, index.cmp(&items.len())) {
                (_, std::cmp::Ordering::Greater) => {
                    Err(invalid(format!("array index out of bounds at {}", path)))
                }
                (_, std::cmp::Ordering::Equal) => {
                    items.push(value);
                    Ok(())
                }
                (Write::Insert, std::cmp::Ordering::Less) => {
                    items.insert(index, value);
                    Ok(())
                }
                (Write::Set, std::cmp::Ordering::Less) => {
                    items[index] = value;
                    Ok(())
                }
            }
        }
        _ => Err(invalid(format!("cannot write into scalar at {}", path))),
    }
}

fn remove(document: &mut Value, path: &str) -> Result<Value, ChatError> {
    let tokens = tokens(path)?;
    let Some((last, parents)) = tokens.split_last() else {
        return Err(invalid("cannot remove the document root".to_string()));
    };

    let mut current = document;
    for token in parents {
        current = match current {
            Value::Object(map) => map.get_mut(token),
            Value::Array(items) => match token.parse::<usize>() {
                Ok(i) => items.get_mut(i),
                Err(_) => None,
            },
            _ => None,
        }
        .ok_or_else(|| missing(path))?;
    }

    match current {
        Value::Object(map) => map.remove(last).ok_or_else(|| missing(path)),
        Value::Array(items) => match last.parse::<usize>() {
            Ok(i) if i < items.len() => Ok(items.remove(i)),
            _ => Err(missing(path)),
        },
        _ => Err(missing(path)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ops(value: Value) -> PatchPayload {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_decode_single_and_batch() {
        let single = ops(json!({"op": "add", "path": "/a", "value": 1}));
        assert!(matches!(single, PatchPayload::Single(_)));

        let batch = ops(json!([
            {"op": "add", "path": "/a", "value": 1},
            {"op": "remove", "path": "/a"}
        ]));
        assert!(matches!(batch, PatchPayload::Batch(ref v) if v.len() == 2));
    }

    #[test]
    fn test_batch_equals_sequential_application() {
        let doc = json!({"completion_chunks": [], "status": "PENDING"});
        let batch = ops(json!([
            {"op": "add", "path": "/completion_chunks/-", "value": "The"},
            {"op": "add", "path": "/completion_chunks/-", "value": " answer"},
            {"op": "replace", "path": "/status", "value": "COMPLETED"}
        ]));

        let batched = apply(&doc, &batch).unwrap();

        let mut sequential = doc.clone();
        for op in batch.operations() {
            sequential = apply(&sequential, &PatchPayload::Single(op.clone())).unwrap();
        }

        assert_eq!(batched, sequential);
        assert_eq!(batched["completion_chunks"], json!(["The", " answer"]));
        // Input untouched
        assert_eq!(doc, json!({"completion_chunks": [], "status": "PENDING"}));
    }

    #[test]
    fn test_failed_batch_leaves_document_unchanged() {
        let doc = json!({"completion_chunks": ["a"]});
        let batch = ops(json!([
            {"op": "add", "path": "/completion_chunks/-", "value": "b"},
            {"op": "remove", "path": "/does/not/exist"},
            {"op": "add", "path": "/completion_chunks/-", "value": "c"}
        ]));

        let err = apply(&doc, &batch).unwrap_err();
        assert_eq!(
            err,
            ChatError::PatchTargetMissing {
                path: "/does/not/exist".to_string()
            }
        );
        assert_eq!(doc, json!({"completion_chunks": ["a"]}));
    }

    #[test]
    fn test_add_creates_intermediate_structure() {
        let doc = json!({});
        let patched = apply(
            &doc,
            &ops(json!({"op": "add", "path": "/metadata/knowledge_retrieved/0", "value": {"score": 1}})),
        )
        .unwrap();
        assert_eq!(patched, json!({"metadata": {"knowledge_retrieved": [{"score": 1}]}}));

        let patched = apply(
            &json!({"reasoning_chunks": null}),
            &ops(json!({"op": "replace", "path": "/reasoning_chunks/-", "value": "x"})),
        )
        .unwrap();
        assert_eq!(patched, json!({"reasoning_chunks": ["x"]}));
    }

    #[test]
    fn test_add_into_array_inserts_and_replace_overwrites() {
        let doc = json!({"a": [1, 3]});
        let inserted = apply(&doc, &ops(json!({"op": "add", "path": "/a/1", "value": 2}))).unwrap();
        assert_eq!(inserted, json!({"a": [1, 2, 3]}));

        let replaced =
            apply(&doc, &ops(json!({"op": "replace", "path": "/a/1", "value": 2}))).unwrap();
        assert_eq!(replaced, json!({"a": [1, 2]}));

        let err = apply(&doc, &ops(json!({"op": "add", "path": "/a/5", "value": 2}))).unwrap_err();
        assert!(matches!(err, ChatError::InvalidPatch { .. }));
    }

    #[test]
    fn test_remove_missing_target_is_reported() {
        let doc = json!({"a": [1]});
        for path in ["/b", "/a/3", "/a/0/x"] {
            let err = apply(&doc, &ops(json!({"op": "remove", "path": path}))).unwrap_err();
            assert_eq!(err, ChatError::PatchTargetMissing { path: path.to_string() });
        }
    }

    #[test]
    fn test_move_copy_and_test() {
        let doc = json!({"a": {"b": 1}, "list": ["x"]});
        let patched = apply(
            &doc,
            &ops(json!([
                {"op": "copy", "from": "/a/b", "path": "/c"},
                {"op": "move", "from": "/list/0", "path": "/d"},
                {"op": "test", "path": "/c", "value": 1}
            ])),
        )
        .unwrap();
        assert_eq!(patched, json!({"a": {"b": 1}, "c": 1, "d": "x", "list": []}));

        let err = apply(&doc, &ops(json!({"op": "test", "path": "/a/b", "value": 2}))).unwrap_err();
        assert!(matches!(err, ChatError::InvalidPatch { .. }));
    }

    #[test]
    fn test_escaped_tokens() {
        let doc = json!({});
        let patched =
            apply(&doc, &ops(json!({"op": "add", "path": "/a~1b/c~0d", "value": true}))).unwrap();
        assert_eq!(patched, json!({"a/b": {"c~d": true}}));
    }

    #[test]
    fn test_root_replace() {
        let patched = apply(&json!({"a": 1}), &ops(json!({"op": "replace", "path": "", "value": [1]})))
            .unwrap();
        assert_eq!(patched, json!([1]));
    }
}
