/// Nested, key-chain-addressed containers of named values.
///
/// A `Container<T>` maps names to either a leaf `T` or another container.
/// Leaves are addressed by key chains joined with `/` ("encoder/weight").
/// Iteration is in sorted key order, so every traversal is deterministic.
///
/// The same shape is used on both sides of the tape boundary:
/// `Container<Tensor>` for host values, `Container<BufId>` for the buffers a
/// cost function reads.

use std::collections::BTreeMap;
use std::convert::Infallible;

use serde::{Deserialize, Serialize};

use crate::error::{MetaError, Result};

pub const KEY_SEP: char = '/';

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Node<T> {
    Leaf(T),
    Nested(Container<T>),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Container<T> {
    children: BTreeMap<String, Node<T>>,
}

impl<T> Default for Container<T> {
    fn default() -> Self {
        Container { children: BTreeMap::new() }
    }
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}{KEY_SEP}{key}")
    }
}

impl<T> Container<T> {
    pub fn new() -> Self {
        Container::default()
    }

    /// Build from `(key_chain, leaf)` pairs.
    pub fn from_leaves<I, S>(leaves: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, T)>,
        S: AsRef<str>,
    {
        let mut c = Container::new();
        for (k, v) in leaves {
            c.insert(k.as_ref(), v)?;
        }
        Ok(c)
    }

    /// Insert a leaf, creating intermediate containers as needed.
    /// Replaces an existing leaf at the same chain.
    pub fn insert(&mut self, key_chain: &str, value: T) -> Result<()> {
        self.insert_node(key_chain, Node::Leaf(value))
    }

    fn insert_node(&mut self, key_chain: &str, node: Node<T>) -> Result<()> {
        let (head, rest) = match key_chain.split_once(KEY_SEP) {
            Some((h, r)) => (h, Some(r)),
            None => (key_chain, None),
        };
        if head.is_empty() {
            return Err(MetaError::MissingKey(key_chain.to_string()));
        }
        match rest {
            None => {
                self.children.insert(head.to_string(), node);
                Ok(())
            }
            Some(rest) => {
                let child = self.children
                    .entry(head.to_string())
                    .or_insert_with(|| Node::Nested(Container::new()));
                match child {
                    Node::Nested(sub) => sub.insert_node(rest, node),
                    Node::Leaf(_) => Err(MetaError::KeyConflict(key_chain.to_string())),
                }
            }
        }
    }

    fn get_node(&self, key_chain: &str) -> Option<&Node<T>> {
        let mut parts = key_chain.split(KEY_SEP);
        let mut node = self.children.get(parts.next()?)?;
        for part in parts {
            node = match node {
                Node::Nested(sub) => sub.children.get(part)?,
                Node::Leaf(_) => return None,
            };
        }
        Some(node)
    }

    fn remove(&mut self, key_chain: &str) -> Option<Node<T>> {
        match key_chain.split_once(KEY_SEP) {
            None => self.children.remove(key_chain),
            Some((head, rest)) => match self.children.get_mut(head)? {
                Node::Nested(sub) => sub.remove(rest),
                Node::Leaf(_) => None,
            },
        }
    }

    /// Leaf at `key_chain`, if any.
    pub fn get(&self, key_chain: &str) -> Option<&T> {
        match self.get_node(key_chain)? {
            Node::Leaf(v) => Some(v),
            Node::Nested(_) => None,
        }
    }

    /// Like `get`, but a missing leaf is an error.
    pub fn leaf(&self, key_chain: &str) -> Result<&T> {
        self.get(key_chain).ok_or_else(|| MetaError::MissingKey(key_chain.to_string()))
    }

    /// All leaves with their full key chains, depth-first in key order.
    pub fn leaves(&self) -> Vec<(String, &T)> {
        let mut out = Vec::new();
        self.collect_leaves("", &mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a T)>) {
        for (k, node) in &self.children {
            let chain = join(prefix, k);
            match node {
                Node::Leaf(v) => out.push((chain, v)),
                Node::Nested(sub) => sub.collect_leaves(&chain, out),
            }
        }
    }

    pub fn key_chains(&self) -> Vec<String> {
        self.leaves().into_iter().map(|(k, _)| k).collect()
    }

    /// Number of leaves.
    pub fn len(&self) -> usize {
        self.children.values().map(|n| match n {
            Node::Leaf(_) => 1,
            Node::Nested(sub) => sub.len(),
        }).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Structure-preserving map over leaves; `f` receives each key chain.
    pub fn map<U>(&self, mut f: impl FnMut(&str, &T) -> U) -> Container<U> {
        match self.try_map(|k, v| Ok::<U, Infallible>(f(k, v))) {
            Ok(c) => c,
            Err(never) => match never {},
        }
    }

    /// Fallible structure-preserving map over leaves.
    pub fn try_map<U, E>(&self, mut f: impl FnMut(&str, &T) -> std::result::Result<U, E>)
        -> std::result::Result<Container<U>, E>
    {
        self.try_map_prefixed("", &mut f)
    }

    fn try_map_prefixed<U, E, F>(&self, prefix: &str, f: &mut F) -> std::result::Result<Container<U>, E>
    where
        F: FnMut(&str, &T) -> std::result::Result<U, E>,
    {
        let mut children = BTreeMap::new();
        for (k, node) in &self.children {
            let chain = join(prefix, k);
            let mapped = match node {
                Node::Leaf(v) => Node::Leaf(f(&chain, v)?),
                Node::Nested(sub) => Node::Nested(sub.try_map_prefixed(&chain, f)?),
            };
            children.insert(k.clone(), mapped);
        }
        Ok(Container { children })
    }

    /// Map over the leaves of `self`, pairing each with the leaf at the same
    /// key chain in `other`. Every leaf of `self` must exist in `other`.
    pub fn zip_with<U, V>(
        &self,
        other: &Container<U>,
        mut f: impl FnMut(&str, &T, &U) -> Result<V>,
    ) -> Result<Container<V>> {
        self.try_map(|k, a| {
            let b = other.leaf(k)?;
            f(k, a, b)
        })
    }
}

impl<T: Clone> Container<T> {
    /// Sub-container chosen by `sel`. Naming a key chain that is absent is
    /// an error, so typos in selectors do not silently select nothing.
    pub fn select(&self, sel: &VarSelector) -> Result<Container<T>> {
        match sel {
            VarSelector::All => Ok(self.clone()),
            VarSelector::Keys(chains) => {
                let mut out = Container::new();
                for chain in chains {
                    let node = self.get_node(chain)
                        .ok_or_else(|| MetaError::MissingKey(chain.clone()))?;
                    out.insert_node(chain, node.clone())?;
                }
                Ok(out)
            }
            VarSelector::Except(chains) => {
                let mut out = self.clone();
                for chain in chains {
                    out.remove(chain).ok_or_else(|| MetaError::MissingKey(chain.clone()))?;
                }
                Ok(out)
            }
        }
    }

    /// Leaves of `self` overridden by the leaves of `other`.
    pub fn merge(&self, other: &Container<T>) -> Result<Container<T>> {
        let mut out = self.clone();
        for (k, v) in other.leaves() {
            out.insert(&k, v.clone())?;
        }
        Ok(out)
    }
}

// ── Variable selection ───────────────────────────────────────────────

/// Which variables play a role (inner or outer) in a meta step.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarSelector {
    /// Every variable.
    #[default]
    All,
    /// Only these key chains (leaves or whole sub-containers).
    Keys(Vec<String>),
    /// Everything except these key chains.
    Except(Vec<String>),
}

impl VarSelector {
    pub fn keys<I, S>(chains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        VarSelector::Keys(chains.into_iter().map(Into::into).collect())
    }

    pub fn except<I, S>(chains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        VarSelector::Except(chains.into_iter().map(Into::into).collect())
    }

}

impl From<&str> for VarSelector {
    fn from(chain: &str) -> Self {
        VarSelector::Keys(vec![chain.to_string()])
    }
}
