//! Node addresses
//!
//! An address is a quadruple `(cluster, space, field, node)` of signed
//! 32-bit components, compared component-wise and hashed with a
//! seed-then-mix combine so nearby addresses spread across hash buckets.

use core::fmt;
use core::hash::{Hash, Hasher};
use serde::{Deserialize, Serialize};

/// Location of a node in the fabric
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    cluster: i32,
    space: i32,
    field: i32,
    node: i32,
}

impl Address {
    pub const fn new(cluster: i32, space: i32, field: i32, node: i32) -> Self {
        Address {
            cluster,
            space,
            field,
            node,
        }
    }

    #[inline]
    pub fn cluster(&self) -> i32 {
        self.cluster
    }

    #[inline]
    pub fn space(&self) -> i32 {
        self.space
    }

    #[inline]
    pub fn field(&self) -> i32 {
        self.field
    }

    #[inline]
    pub fn node(&self) -> i32 {
        self.node
    }

    pub fn set_cluster(&mut self, cluster: i32) {
        self.cluster = cluster;
    }

    pub fn set_space(&mut self, space: i32) {
        self.space = space;
    }

    pub fn set_field(&mut self, field: i32) {
        self.field = field;
    }

    pub fn set_node(&mut self, node: i32) {
        self.node = node;
    }
}

#[inline]
fn combine(seed: &mut u64, component: i32) {
    // Golden-ratio mix, seeded with the running hash
    *seed ^= (component as u32 as u64)
        .wrapping_add(0x9e37_79b9_7f4a_7c15)
        .wrapping_add(*seed << 6)
        .wrapping_add(*seed >> 2);
}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let mut seed = 0u64;
        combine(&mut seed, self.cluster);
        combine(&mut seed, self.space);
        combine(&mut seed, self.field);
        combine(&mut seed, self.node);
        state.write_u64(seed);
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}, {}, {})",
            self.cluster, self.space, self.field, self.node
        )
    }
}
