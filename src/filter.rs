//! Packet filters
//!
//! Filters run in the decoder before any decoding work, on the raw frame.
//! A packet survives only if every configured filter matches.

use crate::core::Timestamp;
use crate::decode::LinkType;

/// A predicate over raw captured frames
pub trait PacketFilter: Send {
    /// Return true if this packet should be processed
    fn matches(&self, link: LinkType, data: &[u8], timestamp: Timestamp, packet_num: u64)
        -> bool;
}

/// An ordered set of filters tried one after another
#[derive(Default)]
pub struct Filters {
    filters: Vec<Box<dyn PacketFilter>>,
}

impl Filters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, filter: Box<dyn PacketFilter>) {
        self.filters.push(filter);
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// True if the packet matches all filters
    pub fn matches(
        &self,
        link: LinkType,
        data: &[u8],
        timestamp: Timestamp,
        packet_num: u64,
    ) -> bool {
        self.filters
            .iter()
            .all(|filter| filter.matches(link, data, timestamp, packet_num))
    }
}

impl std::fmt::Debug for Filters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filters")
            .field("count", &self.filters.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MinLen(usize);

    impl PacketFilter for MinLen {
        fn matches(&self, _link: LinkType, data: &[u8], _ts: Timestamp, _num: u64) -> bool {
            data.len() >= self.0
        }
    }

    struct EvenPackets;

    impl PacketFilter for EvenPackets {
        fn matches(&self, _link: LinkType, _data: &[u8], _ts: Timestamp, num: u64) -> bool {
            num % 2 == 0
        }
    }

    #[test]
    fn test_empty_filters_match_everything() {
        let filters = Filters::new();
        assert!(filters.matches(LinkType::Ethernet, &[], 0, 1));
    }

    #[test]
    fn test_all_filters_must_match() {
        let mut filters = Filters::new();
        filters.push(Box::new(MinLen(4)));
        filters.push(Box::new(EvenPackets));
        assert!(filters.matches(LinkType::Ethernet, &[0; 8], 0, 2));
        assert!(!filters.matches(LinkType::Ethernet, &[0; 8], 0, 3));
        assert!(!filters.matches(LinkType::Ethernet, &[0; 2], 0, 2));
    }
}
