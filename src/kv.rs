use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Commands the replicated key-value store understands.
///
/// Every operation, reads included, is ordered through the replicated log
/// before it reaches the store. A `Get` therefore observes exactly the
/// mutations committed before its own log position, and a `SetIf`
/// expectation is checked against the state as of that position, not
/// against whatever the submitting node happened to hold at submission
/// time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvCommand {
    Get { key: String },
    Set { key: String, value: String },
    /// Write `value` only if the key currently holds `expect`
    /// (`None` means the key must be absent).
    SetIf {
        key: String,
        expect: Option<String>,
        value: String,
    },
    Delete { key: String },
}

/// Outcome of applying one command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KvResult {
    /// The mutation landed; `revision` is its position among all mutations.
    Written { revision: u64 },
    /// A value, tagged with the revision it was read at.
    Value {
        revision: u64,
        value: Option<String>,
    },
    /// A `SetIf` whose expectation did not hold. Nothing changed.
    Conflict { actual: Option<String> },
}

/// The state machine: a map plus a revision counter that advances once per
/// applied mutation. Commands arrive in log order, so the revision a
/// result carries identifies exactly which writes it observed.
#[derive(Default)]
pub struct KvStore {
    data: HashMap<String, String>,
    revision: u64,
}

impl KvStore {
    pub fn new() -> KvStore {
        KvStore::default()
    }

    pub fn apply(&mut self, command: &KvCommand) -> KvResult {
        match command {
            KvCommand::Get { key } => KvResult::Value {
                revision: self.revision,
                value: self.data.get(key).cloned(),
            },
            KvCommand::Set { key, value } => {
                self.data.insert(key.clone(), value.clone());
                self.written()
            }
            KvCommand::SetIf { key, expect, value } => {
                let actual = self.data.get(key).cloned();
                if actual.as_deref() != expect.as_deref() {
                    return KvResult::Conflict { actual };
                }
                self.data.insert(key.clone(), value.clone());
                self.written()
            }
            KvCommand::Delete { key } => {
                self.data.remove(key);
                self.written()
            }
        }
    }

    fn written(&mut self) -> KvResult {
        self.revision += 1;
        KvResult::Written {
            revision: self.revision,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(key: &str, value: &str) -> KvCommand {
        KvCommand::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    fn set_if(key: &str, expect: Option<&str>, value: &str) -> KvCommand {
        KvCommand::SetIf {
            key: key.into(),
            expect: expect.map(Into::into),
            value: value.into(),
        }
    }

    fn get(key: &str) -> KvCommand {
        KvCommand::Get { key: key.into() }
    }

    #[test]
    fn mutations_advance_the_revision_in_apply_order() {
        let mut store = KvStore::new();
        assert_eq!(store.apply(&set("a", "1")), KvResult::Written { revision: 1 });
        assert_eq!(
            store.apply(&KvCommand::Delete { key: "b".into() }),
            KvResult::Written { revision: 2 }
        );
        assert_eq!(store.apply(&set("a", "2")), KvResult::Written { revision: 3 });
    }

    #[test]
    fn a_read_reports_the_revision_it_observed() {
        let mut store = KvStore::new();
        store.apply(&set("k", "old"));
        assert_eq!(
            store.apply(&get("k")),
            KvResult::Value {
                revision: 1,
                value: Some("old".into())
            }
        );

        store.apply(&set("k", "new"));
        assert_eq!(
            store.apply(&get("k")),
            KvResult::Value {
                revision: 2,
                value: Some("new".into())
            }
        );
    }

    #[test]
    fn set_if_succeeds_against_the_matching_value() {
        let mut store = KvStore::new();
        store.apply(&set("k", "a"));

        assert_eq!(
            store.apply(&set_if("k", Some("a"), "b")),
            KvResult::Written { revision: 2 }
        );
        assert_eq!(
            store.apply(&get("k")),
            KvResult::Value {
                revision: 2,
                value: Some("b".into())
            }
        );
    }

    #[test]
    fn set_if_conflict_reports_the_actual_value_and_changes_nothing() {
        let mut store = KvStore::new();
        store.apply(&set("k", "a"));

        assert_eq!(
            store.apply(&set_if("k", Some("z"), "b")),
            KvResult::Conflict {
                actual: Some("a".into())
            }
        );
        // The failed write consumed no revision.
        assert_eq!(store.apply(&set("other", "x")), KvResult::Written { revision: 2 });
    }

    #[test]
    fn set_if_none_expects_an_absent_key() {
        let mut store = KvStore::new();

        assert_eq!(
            store.apply(&set_if("k", None, "first")),
            KvResult::Written { revision: 1 }
        );
        // Losing the same race a second time reports who won.
        assert_eq!(
            store.apply(&set_if("k", None, "second")),
            KvResult::Conflict {
                actual: Some("first".into())
            }
        );
    }

    #[test]
    fn delete_is_a_mutation_like_any_other() {
        let mut store = KvStore::new();
        store.apply(&set("k", "v"));
        store.apply(&KvCommand::Delete { key: "k".into() });
        assert_eq!(
            store.apply(&get("k")),
            KvResult::Value {
                revision: 2,
                value: None
            }
        );
    }
}
