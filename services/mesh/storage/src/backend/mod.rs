//! Key store backend implementations

pub mod mem;
