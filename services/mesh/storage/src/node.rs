//! Provisioned node records kept in an index-addressed arena.

use mesh_crypto::Key128;
use mesh_wire::address::MAX_UNICAST;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// A provisioned node as seen by this node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Device UUID
    pub uuid: Uuid,
    /// Address of the primary element
    pub unicast_address: u16,
    /// Number of elements (consecutive addresses)
    pub element_count: u8,
    /// Device key shared with this node
    pub device_key: Key128,
    /// Network key indexes known to the node
    pub net_keys: Vec<u16>,
    /// Application key indexes known to the node
    pub app_keys: Vec<u16>,
    /// Highest sequence number seen from the node
    pub last_seq: Option<u32>,
    /// Friend acknowledging on behalf of this node, if it is a Low Power Node
    pub friend: Option<u16>,
}

impl Node {
    /// Whether `addr` is one of the node's element addresses
    pub fn owns(&self, addr: u16) -> bool {
        addr >= self.unicast_address
            && (addr as u32) < self.unicast_address as u32 + self.element_count.max(1) as u32
    }
}

/// Stable handle into a [`NodeArena`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub usize);

/// Node storage; cross references are addresses or [`NodeId`]s
#[derive(Debug, Default)]
pub struct NodeArena {
    nodes: Vec<Node>,
    by_uuid: HashMap<Uuid, NodeId>,
}

impl NodeArena {
    /// Empty arena
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace (by UUID) a node
    pub fn insert(&mut self, node: Node) -> NodeId {
        if let Some(id) = self.by_uuid.get(&node.uuid).copied() {
            self.nodes[id.0] = node;
            return id;
        }
        let id = NodeId(self.nodes.len());
        self.by_uuid.insert(node.uuid, id);
        self.nodes.push(node);
        id
    }

    /// Node by handle
    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0)
    }

    /// Mutable node by handle
    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id.0)
    }

    /// Node owning an element address
    pub fn find_by_address(&self, addr: u16) -> Option<NodeId> {
        self.nodes.iter().position(|n| n.owns(addr)).map(NodeId)
    }

    /// Node with a device UUID
    pub fn find_by_uuid(&self, uuid: &Uuid) -> Option<NodeId> {
        self.by_uuid.get(uuid).copied()
    }

    /// Number of nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the arena is empty
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All nodes
    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    /// Lowest address ≥ `low` with `count` free consecutive addresses,
    /// skipping the `reserved` ranges as well as every stored node
    pub fn lowest_free_range(&self, low: u16, count: u8, reserved: &[(u16, u8)]) -> Option<u16> {
        let count = count.max(1) as u32;
        let mut taken: Vec<(u32, u32)> = self
            .nodes
            .iter()
            .map(|n| (n.unicast_address as u32, n.element_count.max(1) as u32))
            .chain(reserved.iter().map(|(a, c)| (*a as u32, (*c).max(1) as u32)))
            .collect();
        taken.sort_unstable();

        let mut candidate = low.max(1) as u32;
        for (start, len) in taken {
            if candidate + count <= start {
                break;
            }
            candidate = candidate.max(start + len);
        }
        if candidate + count - 1 > MAX_UNICAST as u32 {
            return None;
        }
        Some(candidate as u16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(byte: u8, addr: u16, elements: u8) -> Node {
        Node {
            uuid: Uuid::from_bytes([byte; 16]),
            unicast_address: addr,
            element_count: elements,
            device_key: [byte; 16],
            net_keys: vec![0],
            app_keys: vec![],
            last_seq: None,
            friend: None,
        }
    }

    #[test]
    fn test_find_by_element_address() {
        let mut arena = NodeArena::new();
        let id = arena.insert(node(1, 0x0010, 3));
        assert_eq!(arena.find_by_address(0x0012), Some(id));
        assert_eq!(arena.find_by_address(0x0013), None);
        assert_eq!(arena.find_by_uuid(&Uuid::from_bytes([1; 16])), Some(id));
    }

    #[test]
    fn test_insert_replaces_same_uuid() {
        let mut arena = NodeArena::new();
        let first = arena.insert(node(1, 0x0010, 1));
        let second = arena.insert(node(1, 0x0020, 1));
        assert_eq!(first, second);
        assert_eq!(arena.len(), 1);
        assert_eq!(arena.get(first).unwrap().unicast_address, 0x0020);
    }

    #[test]
    fn test_lowest_free_range_skips_taken_addresses() {
        let mut arena = NodeArena::new();
        arena.insert(node(1, 0x0002, 2));
        arena.insert(node(2, 0x0005, 1));

        // own node at 0x0001
        let reserved = [(0x0001, 1)];
        assert_eq!(arena.lowest_free_range(0x0001, 1, &reserved), Some(0x0004));
        assert_eq!(arena.lowest_free_range(0x0001, 2, &reserved), Some(0x0006));
        assert_eq!(arena.lowest_free_range(0x0100, 1, &reserved), Some(0x0100));
        assert_eq!(arena.lowest_free_range(0x7fff, 2, &reserved), None);
    }
}
