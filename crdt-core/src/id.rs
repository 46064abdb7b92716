use std::fmt;

/// A Lamport-style identifier: `client` names the process that produced the
/// unit, `clock` is that client's count of prior units. `(client, clock)`
/// uniquely names a single unit of content for all time.
///
/// IDs are only totally ordered for tie-breaking (`client`, then `clock`);
/// causally they form a partial order expressed through `origin`/`right_origin`
/// references on [`crate::block::Item`], never through numeric comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ID {
    pub client: u64,
    pub clock: u32,
}

impl ID {
    pub fn new(client: u64, clock: u32) -> Self {
        ID { client, clock }
    }

    /// True if this ID, used as the start of a run of `length` units, covers
    /// clock `k`.
    pub fn contains(&self, k: u32, length: u32) -> bool {
        self.clock <= k && k < self.clock + length
    }
}

impl fmt::Display for ID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.client, self.clock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contains_is_half_open() {
        let id = ID::new(1, 10);
        assert!(!id.contains(9, 5));
        assert!(id.contains(10, 5));
        assert!(id.contains(14, 5));
        assert!(!id.contains(15, 5));
    }
}
