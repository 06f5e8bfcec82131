use std::fmt;
use std::sync::Arc;

use crate::key::Key;
use crate::node::{NodeRef, NodeState};

/// Durable reference to a node.
///
/// A handle to a node that has never been persisted holds the node itself.
/// Once the node has been assigned a key the handle answers with that key,
/// and resolution goes through the transaction and the shared cache, so a
/// handle never pins a stale instance.
#[derive(Clone)]
pub struct NodeHandle {
    repr: Repr,
}

#[derive(Clone)]
enum Repr {
    Transient(NodeRef),
    Key(Key),
}

impl NodeHandle {
    /// Handle for `node`, holding its key when it has one.
    pub fn for_node(node: &NodeRef) -> Self {
        let guard = node.read();
        match (guard.state(), guard.key()) {
            (NodeState::Transient, _) | (_, None) => Self {
                repr: Repr::Transient(Arc::clone(node)),
            },
            (_, Some(key)) => Self::from_key(key.clone()),
        }
    }

    /// Handle addressing `key`.
    pub fn from_key(key: Key) -> Self {
        Self {
            repr: Repr::Key(key),
        }
    }

    /// Key of the referenced node, if it has been assigned one.
    pub fn key(&self) -> Option<Key> {
        match &self.repr {
            Repr::Key(key) => Some(key.clone()),
            Repr::Transient(node) => node.read().key().cloned(),
        }
    }

    /// The referenced node while it is still transient.
    pub fn transient_node(&self) -> Option<NodeRef> {
        match &self.repr {
            Repr::Transient(node) if node.read().state() == NodeState::Transient => {
                Some(Arc::clone(node))
            }
            _ => None,
        }
    }

    /// Direct reference held by this handle regardless of the node's state.
    pub(crate) fn direct(&self) -> Option<&NodeRef> {
        match &self.repr {
            Repr::Transient(node) => Some(node),
            Repr::Key(_) => None,
        }
    }

    /// Replaces a direct reference by the node's key once it has one.
    pub fn normalize(&mut self) {
        if let Repr::Transient(node) = &self.repr {
            let key = {
                let guard = node.read();
                if guard.state() == NodeState::Transient {
                    None
                } else {
                    guard.key().cloned()
                }
            };
            if let Some(key) = key {
                self.repr = Repr::Key(key);
            }
        }
    }

    /// Whether this handle refers to `node`.
    pub fn points_to(&self, node: &NodeRef) -> bool {
        match &self.repr {
            Repr::Transient(own) if Arc::ptr_eq(own, node) => true,
            _ => match (self.key(), node.read().key()) {
                (Some(a), Some(b)) => &a == b,
                _ => false,
            },
        }
    }
}

impl PartialEq for NodeHandle {
    fn eq(&self, other: &Self) -> bool {
        if let (Repr::Transient(a), Repr::Transient(b)) = (&self.repr, &other.repr) {
            if Arc::ptr_eq(a, b) {
                return true;
            }
        }
        match (self.key(), other.key()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            Repr::Key(key) => write!(f, "NodeHandle({key})"),
            Repr::Transient(node) => match node.try_read() {
                Some(guard) => write!(f, "NodeHandle(transient {})", guard.id()),
                None => f.write_str("NodeHandle(transient <locked>)"),
            },
        }
    }
}

impl From<Key> for NodeHandle {
    fn from(key: Key) -> Self {
        NodeHandle::from_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;

    #[test]
    fn transient_handle_switches_to_key_after_persisting() {
        let node = Node::transient("t1", Some("page".into()), None).into_ref();
        let mut handle = NodeHandle::for_node(&node);
        assert!(handle.key().is_none());
        assert!(handle.transient_node().is_some());

        node.write().assign_identity("42", Key::embedded("42"), NodeState::New);
        assert_eq!(handle.key(), Some(Key::embedded("42")));
        assert!(handle.transient_node().is_none());
        handle.normalize();
        assert!(handle.direct().is_none());
        assert_eq!(handle, NodeHandle::from_key(Key::embedded("42")));
    }

    #[test]
    fn distinct_transient_nodes_are_not_equal() {
        let a = Node::transient("t1", None, None).into_ref();
        let b = Node::transient("t2", None, None).into_ref();
        assert_ne!(NodeHandle::for_node(&a), NodeHandle::for_node(&b));
        assert_eq!(NodeHandle::for_node(&a), NodeHandle::for_node(&a));
    }
}
