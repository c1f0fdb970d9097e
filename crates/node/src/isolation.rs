use std::collections::BTreeSet;

/// Ports whose traffic a cell drops. Entries are never removed.
#[derive(Debug, Default, Clone)]
pub struct Blacklist {
    ports: BTreeSet<u16>,
}

impl Blacklist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when `port` was not quarantined before.
    pub fn quarantine(&mut self, port: u16) -> bool {
        self.ports.insert(port)
    }

    pub fn contains(&self, port: u16) -> bool {
        self.ports.contains(&port)
    }

    pub fn ports(&self) -> Vec<u16> {
        self.ports.iter().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quarantine_is_idempotent_and_monotonic() {
        let mut blacklist = Blacklist::new();
        assert!(blacklist.quarantine(5002));
        assert!(!blacklist.quarantine(5002));
        assert!(blacklist.quarantine(4999));

        assert!(blacklist.contains(5002));
        assert!(!blacklist.contains(5000));
        assert_eq!(blacklist.ports(), vec![4999, 5002]);
    }
}
