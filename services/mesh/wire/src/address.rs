//! Mesh address classes.
//!
//! ```text
//! 0x0000           unassigned
//! 0x0001..=0x7FFF  unicast
//! 0x8000..=0xBFFF  virtual
//! 0xC000..=0xFFFF  group (0xFFFC..=0xFFFF fixed groups)
//! ```

/// Unassigned address
pub const UNASSIGNED: u16 = 0x0000;

/// All proxies fixed group
pub const ALL_PROXIES: u16 = 0xfffc;

/// All friends fixed group
pub const ALL_FRIENDS: u16 = 0xfffd;

/// All relays fixed group
pub const ALL_RELAYS: u16 = 0xfffe;

/// All nodes fixed group
pub const ALL_NODES: u16 = 0xffff;

/// Highest unicast address
pub const MAX_UNICAST: u16 = 0x7fff;

/// Address identifies a single element
pub fn is_unicast(addr: u16) -> bool {
    addr != UNASSIGNED && addr & 0x8000 == 0
}

/// Address is a virtual label hash
pub fn is_virtual(addr: u16) -> bool {
    addr & 0xc000 == 0x8000
}

/// Address is a group, including the fixed groups
pub fn is_group(addr: u16) -> bool {
    addr & 0xc000 == 0xc000
}
