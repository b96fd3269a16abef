//! exFAT file allocation table entry

/// A 32-bit FAT entry pointing to the next cluster in a chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FatEntry {
    /// Cluster number or special value (0=free, >=0xFFFFFFF8=end)
    pub cluster: u32,
}

impl FatEntry {
    pub const FREE: FatEntry = FatEntry { cluster: 0 };
    pub const END_OF_CHAIN: FatEntry = FatEntry {
        cluster: 0xFFFF_FFFF,
    };

    /// Returns true if this entry marks the end of a cluster chain
    pub fn is_end_of_chain(&self) -> bool {
        self.cluster >= 0xFFFF_FFF8
    }

    /// Returns true if this cluster is unused/free
    pub fn is_free(&self) -> bool {
        self.cluster == 0
    }

    /// Next cluster in the chain, if there is one
    pub fn next(&self) -> Option<u32> {
        if self.is_free() || self.is_end_of_chain() {
            None
        } else {
            Some(self.cluster)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(FatEntry::FREE.is_free());
        assert_eq!(FatEntry::FREE.next(), None);
        assert!(FatEntry { cluster: 0xFFFF_FFF8 }.is_end_of_chain());
        assert!(FatEntry::END_OF_CHAIN.is_end_of_chain());
        assert_eq!(FatEntry { cluster: 7 }.next(), Some(7));
    }
}
