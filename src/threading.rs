//! Conversation grouping for providers without native threads (IMAP).
//!
//! Messages are connected through Message-ID, In-Reply-To and References with
//! a union-find; each component is keyed by its conversation root id so the
//! key survives later replies joining the thread.

use std::collections::HashMap;

/// Threading headers of one message
pub trait Threadable {
    fn message_id(&self) -> Option<&str>;
    fn in_reply_to(&self) -> Option<&str>;
    fn references(&self) -> &[String];
    /// Key used when the message carries no usable header at all
    fn fallback_key(&self) -> String;
}

/// Normalizes a Message-ID into a thread key (angle brackets stripped)
pub fn normalize_id(id: &str) -> String {
    id.trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .to_string()
}

/// Returns the thread key of every item, index-aligned with `items`
pub fn assign_thread_keys<T: Threadable>(items: &[T]) -> Vec<String> {
    if items.is_empty() {
        return Vec::new();
    }

    let mut msg_id_to_idx: HashMap<String, usize> = HashMap::new();
    for (i, item) in items.iter().enumerate() {
        if let Some(msg_id) = item.message_id() {
            msg_id_to_idx.insert(normalize_id(msg_id), i);
        }
    }

    // Which items mention each id, including ids of messages we don't hold
    let mut reference_to_items: HashMap<String, Vec<usize>> = HashMap::new();
    for (i, item) in items.iter().enumerate() {
        let mentioned = item
            .in_reply_to()
            .into_iter()
            .chain(item.references().iter().map(String::as_str));
        for reference in mentioned {
            reference_to_items
                .entry(normalize_id(reference))
                .or_default()
                .push(i);
        }
    }

    let mut parent: Vec<usize> = (0..items.len()).collect();

    for (reference, referencing) in &reference_to_items {
        if let Some(&j) = msg_id_to_idx.get(reference) {
            for &i in referencing {
                union(&mut parent, i, j);
            }
        }
        if let Some((&first, rest)) = referencing.split_first() {
            for &other in rest {
                union(&mut parent, first, other);
            }
        }
    }

    // Each component's key is the smallest root candidate among its members
    let mut component_key: HashMap<usize, String> = HashMap::new();
    for (i, item) in items.iter().enumerate() {
        let candidate = root_candidate(item);
        let root = find(&parent, i);
        component_key
            .entry(root)
            .and_modify(|key| {
                if candidate < *key {
                    *key = candidate.clone();
                }
            })
            .or_insert(candidate);
    }

    (0..items.len())
        .map(|i| component_key[&find(&parent, i)].clone())
        .collect()
}

/// The id this message believes started its conversation
fn root_candidate<T: Threadable>(item: &T) -> String {
    item.references()
        .first()
        .map(String::as_str)
        .or(item.in_reply_to())
        .or(item.message_id())
        .map(normalize_id)
        .filter(|key| !key.is_empty())
        .unwrap_or_else(|| item.fallback_key())
}

/// Find operation for union-find
fn find(parent: &[usize], mut i: usize) -> usize {
    while parent[i] != i {
        i = parent[i];
    }
    i
}

/// Union operation for union-find
fn union(parent: &mut [usize], i: usize, j: usize) {
    let root_i = find(parent, i);
    let root_j = find(parent, j);
    if root_i != root_j {
        // Smaller index as root keeps the result independent of map order
        if root_i < root_j {
            parent[root_j] = root_i;
        } else {
            parent[root_i] = root_j;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Headers {
        uid: u32,
        message_id: Option<String>,
        in_reply_to: Option<String>,
        references: Vec<String>,
    }

    impl Threadable for Headers {
        fn message_id(&self) -> Option<&str> {
            self.message_id.as_deref()
        }
        fn in_reply_to(&self) -> Option<&str> {
            self.in_reply_to.as_deref()
        }
        fn references(&self) -> &[String] {
            &self.references
        }
        fn fallback_key(&self) -> String {
            format!("uid-{}", self.uid)
        }
    }

    fn msg(uid: u32, id: &str, reply_to: Option<&str>, refs: &[&str]) -> Headers {
        Headers {
            uid,
            message_id: Some(id.to_string()),
            in_reply_to: reply_to.map(str::to_string),
            references: refs.iter().map(|r| r.to_string()).collect(),
        }
    }

    #[test]
    fn test_reply_chain_shares_root_key() {
        let items = vec![
            msg(1, "<root@x>", None, &[]),
            msg(2, "<r1@x>", Some("<root@x>"), &["<root@x>"]),
            msg(3, "<r2@x>", Some("<r1@x>"), &["<root@x>", "<r1@x>"]),
        ];
        let keys = assign_thread_keys(&items);
        assert_eq!(keys, vec!["root@x", "root@x", "root@x"]);
    }

    #[test]
    fn test_unrelated_messages_get_distinct_keys() {
        let items = vec![msg(1, "<a@x>", None, &[]), msg(2, "<b@x>", None, &[])];
        let keys = assign_thread_keys(&items);
        assert_eq!(keys, vec!["a@x", "b@x"]);
    }

    #[test]
    fn test_siblings_of_missing_parent_are_grouped() {
        // Both reply to a message we don't hold
        let items = vec![
            msg(1, "<r1@x>", Some("<gone@x>"), &["<gone@x>"]),
            msg(2, "<r2@x>", Some("<gone@x>"), &["<gone@x>"]),
        ];
        let keys = assign_thread_keys(&items);
        assert_eq!(keys[0], keys[1]);
        assert_eq!(keys[0], "gone@x");
    }

    #[test]
    fn test_key_is_stable_when_reply_arrives() {
        let before = assign_thread_keys(&[msg(1, "<root@x>", None, &[])]);
        let after = assign_thread_keys(&[
            msg(1, "<root@x>", None, &[]),
            msg(2, "<r1@x>", Some("<root@x>"), &["<root@x>"]),
        ]);
        assert_eq!(before[0], after[0]);
    }

    #[test]
    fn test_fallback_key_without_headers() {
        let items = vec![Headers {
            uid: 7,
            message_id: None,
            in_reply_to: None,
            references: Vec::new(),
        }];
        assert_eq!(assign_thread_keys(&items), vec!["uid-7"]);
    }
}
