//! Task signatures: the serializable description of work submitted to the
//! broker.
//!
//! A [`Signature`] is either a single task call, a chain whose steps each
//! receive the previous step's result as input, or a chord whose header runs
//! in parallel and whose body receives the header results in header order.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A named task with its explicit arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCall {
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

impl TaskCall {
    pub fn new(name: impl Into<String>, args: Value) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "spec", rename_all = "snake_case")]
pub enum Signature {
    Task(TaskCall),
    Chain(Vec<Signature>),
    Chord {
        header: Vec<Signature>,
        body: Box<Signature>,
    },
}

impl Signature {
    pub fn task(name: impl Into<String>, args: Value) -> Self {
        Self::Task(TaskCall::new(name, args))
    }

    pub fn chain(steps: Vec<Signature>) -> Self {
        Self::Chain(steps)
    }

    pub fn chord(header: Vec<Signature>, body: Signature) -> Self {
        Self::Chord {
            header,
            body: Box::new(body),
        }
    }

    /// Append `next` so it runs after `self`, flattening nested chains.
    pub fn then(self, next: Signature) -> Self {
        match self {
            Self::Chain(mut steps) => {
                steps.push(next);
                Self::Chain(steps)
            }
            other => Self::Chain(vec![other, next]),
        }
    }
}

/// Chord slot a result is delivered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinSlot {
    pub chord_id: uuid::Uuid,
    pub index: usize,
}

/// What happens after a message finishes.
///
/// On success the result goes to the first of `next`, or into the chord slot
/// `join` when nothing is left to run. On permanent failure `errback` is
/// enqueued with the error message as its input.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Link {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub next: Vec<Signature>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join: Option<JoinSlot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errback: Option<TaskCall>,
}

/// Persisted message payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Envelope {
    pub call: TaskCall,
    #[serde(default)]
    pub input: Option<Value>,
    #[serde(default)]
    pub link: Link,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_then_flattens() {
        let sig = Signature::task("a", json!({}))
            .then(Signature::task("b", json!({})))
            .then(Signature::task("c", json!({})));
        match sig {
            Signature::Chain(steps) => assert_eq!(steps.len(), 3),
            other => panic!("expected chain, got {:?}", other),
        }
    }

    #[test]
    fn test_signature_wire_shape() {
        let sig = Signature::chord(
            vec![Signature::task("label_item", json!({"index": 0}))],
            Signature::task("select_and_store", json!({})),
        );
        let raw = serde_json::to_value(&sig).unwrap();
        assert_eq!(raw["kind"], "chord");
        assert_eq!(raw["spec"]["header"][0]["spec"]["name"], "label_item");
        let back: Signature = serde_json::from_value(raw).unwrap();
        assert_eq!(back, sig);
    }
}
