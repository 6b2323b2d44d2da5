use serde::{Deserialize, Serialize};

const SEPARATOR: char = '/';

/// A node of the sync tree returned by `SyncBackend::fetch`.
///
/// A node either carries a stored value together with its revision, or it is a
/// bridge: an empty node synthesised to connect the fetched root with deeper writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Node>,
}

impl Node {
    /// A node holding a stored value.
    pub fn leaf(key: impl Into<String>, value: impl Into<String>, revision: i64) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            revision: Some(revision),
            children: Vec::new(),
        }
    }

    /// A node with no stored value.
    pub fn bridge(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: String::new(),
            revision: None,
            children: Vec::new(),
        }
    }

    pub fn is_bridge(&self) -> bool {
        self.revision.is_none()
    }

    /// Find a direct child by its full key.
    pub fn child(&self, key: &str) -> Option<&Node> {
        self.children.iter().find(|c| c.key == key)
    }

    /// Keys of every node that holds a value, in depth-first order.
    pub fn written_keys(&self) -> Vec<&str> {
        let mut keys = Vec::new();
        self.collect_written(&mut keys);
        keys
    }

    fn collect_written<'a>(&'a self, out: &mut Vec<&'a str>) {
        if !self.is_bridge() {
            out.push(&self.key);
        }
        for child in &self.children {
            child.collect_written(out);
        }
    }

    /// Assemble the tree rooted at `root_key` from flat range reads.
    ///
    /// `exact` is the value stored at `root_key` itself, `descendants` the `(key, value,
    /// revision)` triples found under `root_key/`. Returns `None` when both are empty.
    /// Intermediate path components that were never written become bridge nodes, and
    /// children are ordered lexicographically by key at every level.
    pub fn from_range<I>(root_key: &str, exact: Option<(String, i64)>, descendants: I) -> Option<Node>
    where
        I: IntoIterator<Item = (String, String, i64)>,
    {
        let mut descendants = descendants.into_iter().peekable();
        if exact.is_none() && descendants.peek().is_none() {
            return None;
        }

        let mut root = match exact {
            Some((value, revision)) => Node::leaf(root_key, value, revision),
            None => Node::bridge(root_key),
        };

        let prefix = child_prefix(root_key);
        for (key, value, revision) in descendants {
            let Some(suffix) = key.strip_prefix(prefix.as_str()) else {
                continue;
            };
            let components: Vec<&str> = suffix.split(SEPARATOR).filter(|c| !c.is_empty()).collect();
            if components.is_empty() {
                continue;
            }
            root.attach(&components, value, revision);
        }

        root.sort_children();
        Some(root)
    }

    fn attach(&mut self, components: &[&str], value: String, revision: i64) {
        let child_key = join(&self.key, components[0]);
        let position = match self.children.iter().position(|c| c.key == child_key) {
            Some(position) => position,
            None => {
                self.children.push(Node::bridge(child_key));
                self.children.len() - 1
            }
        };

        let child = &mut self.children[position];
        if components.len() == 1 {
            child.value = value;
            child.revision = Some(revision);
        } else {
            child.attach(&components[1..], value, revision);
        }
    }

    fn sort_children(&mut self) {
        self.children.sort_by(|a, b| a.key.cmp(&b.key));
        for child in &mut self.children {
            child.sort_children();
        }
    }
}

/// Prefix shared by every descendant of `key`.
pub(crate) fn child_prefix(key: &str) -> String {
    if key.ends_with(SEPARATOR) {
        key.to_string()
    } else {
        format!("{}{}", key, SEPARATOR)
    }
}

fn join(parent: &str, component: &str) -> String {
    format!("{}{}", child_prefix(parent), component)
}
