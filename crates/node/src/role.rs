use serde::{Deserialize, Serialize};
use std::fmt;

/// What a cell does with incoming writes. Every cell starts as `Stem` and
/// differentiates exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Stem,
    Guard,
    Storage,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Stem => write!(f, "STEM"),
            Role::Guard => write!(f, "GUARD"),
            Role::Storage => write!(f, "STORAGE"),
        }
    }
}

/// Deterministic assignment: the highest port in `{own} ∪ neighbors` guards,
/// everyone else stores. Needs no message exchange, and is not an election.
pub fn assign_role(own_port: u16, neighbors: &[u16]) -> Role {
    let highest = neighbors.iter().copied().fold(own_port, u16::max);
    if own_port == highest {
        Role::Guard
    } else {
        Role::Storage
    }
}

/// One-shot transition out of `Stem`. Returns the new role, or `None` when
/// the cell has already differentiated.
pub fn differentiate(current: &mut Role, own_port: u16, neighbors: &[u16]) -> Option<Role> {
    if *current != Role::Stem {
        return None;
    }
    let next = assign_role(own_port, neighbors);
    *current = next;
    Some(next)
}
