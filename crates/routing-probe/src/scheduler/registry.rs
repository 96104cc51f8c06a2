//! Node arena indexed by fleet position.
//!
//! Slot `i` belongs to the `i`-th configured agent for the whole run. A slot is
//! filled once after the agent became ready; afterwards only its heartbeat and
//! offline timestamps move.

use crate::persistence::Node;
use chrono::{DateTime, Utc};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("agent index {index} out of bounds for a fleet of {len}")]
    OutOfBounds { index: usize, len: usize },
    #[error("agent index {0} already registered")]
    AlreadyRegistered(usize),
}

#[derive(Debug, Clone, Default)]
pub struct NodeRegistry {
    slots: Vec<Option<Node>>,
}

impl NodeRegistry {
    pub fn new(fleet_size: usize) -> Self {
        Self {
            slots: vec![None; fleet_size],
        }
    }

    /// Fleet size, registered or not.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn registered(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn register(&mut self, index: usize, node: Node) -> Result<&Node, RegistryError> {
        let len = self.slots.len();
        let slot = self
            .slots
            .get_mut(index)
            .ok_or(RegistryError::OutOfBounds { index, len })?;
        if slot.is_some() {
            return Err(RegistryError::AlreadyRegistered(index));
        }
        Ok(slot.insert(node))
    }

    pub fn get(&self, index: usize) -> Option<&Node> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    /// Set the heartbeat of the node at `index`.
    pub fn touch(&mut self, index: usize, at: DateTime<Utc>) -> Option<&Node> {
        let node = self.slots.get_mut(index)?.as_mut()?;
        node.last_heartbeat = Some(at);
        Some(node)
    }

    /// Mark every registered node offline and return them.
    pub fn mark_offline(&mut self, at: DateTime<Utc>) -> Vec<Node> {
        self.slots
            .iter_mut()
            .flatten()
            .map(|node| {
                node.offline_since = Some(at);
                node.clone()
            })
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Node)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|node| (i, node)))
    }
}
