// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Distribution capability flags exchanged during the handshake

/// A set of distribution capability flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DistributionFlags(pub u64);

impl DistributionFlags {
    /// `DFLAG_PUBLISHED`
    pub const PUBLISHED: Self = Self(1 << 0);
    /// `DFLAG_ATOM_CACHE`
    pub const ATOM_CACHE: Self = Self(1 << 1);
    /// `DFLAG_EXTENDED_REFERENCES`
    pub const EXTENDED_REFERENCES: Self = Self(1 << 2);
    /// `DFLAG_DIST_MONITOR`
    pub const DIST_MONITOR: Self = Self(1 << 3);
    /// `DFLAG_FUN_TAGS`
    pub const FUN_TAGS: Self = Self(1 << 4);
    /// `DFLAG_DIST_MONITOR_NAME`
    pub const DIST_MONITOR_NAME: Self = Self(1 << 5);
    /// `DFLAG_HIDDEN_ATOM_CACHE`
    pub const HIDDEN_ATOM_CACHE: Self = Self(1 << 6);
    /// `DFLAG_NEW_FUN_TAGS`
    pub const NEW_FUN_TAGS: Self = Self(1 << 7);
    /// `DFLAG_EXTENDED_PIDS_PORTS`
    pub const EXTENDED_PIDS_PORTS: Self = Self(1 << 8);
    /// `DFLAG_EXPORT_PTR_TAG`
    pub const EXPORT_PTR_TAG: Self = Self(1 << 9);
    /// `DFLAG_BIT_BINARIES`
    pub const BIT_BINARIES: Self = Self(1 << 10);
    /// `DFLAG_NEW_FLOATS`
    pub const NEW_FLOATS: Self = Self(1 << 11);
    /// `DFLAG_UNICODE_IO`
    pub const UNICODE_IO: Self = Self(1 << 12);
    /// `DFLAG_DIST_HDR_ATOM_CACHE`
    pub const DIST_HDR_ATOM_CACHE: Self = Self(1 << 13);
    /// `DFLAG_SMALL_ATOM_TAGS`
    pub const SMALL_ATOM_TAGS: Self = Self(1 << 14);
    /// `DFLAG_INTERNAL_TAGS`
    pub const INTERNAL_TAGS: Self = Self(1 << 15);
    /// `DFLAG_UTF8_ATOMS`
    pub const UTF8_ATOMS: Self = Self(1 << 16);
    /// `DFLAG_MAP_TAG`
    pub const MAP_TAG: Self = Self(1 << 17);
    /// `DFLAG_BIG_CREATION`
    pub const BIG_CREATION: Self = Self(1 << 18);
    /// `DFLAG_SEND_SENDER`
    pub const SEND_SENDER: Self = Self(1 << 19);
    /// `DFLAG_BIG_SEQTRACE_LABELS`
    pub const BIG_SEQTRACE_LABELS: Self = Self(1 << 20);
    /// `DFLAG_NO_MAGIC`
    pub const NO_MAGIC: Self = Self(1 << 21);
    /// `DFLAG_EXIT_PAYLOAD`
    pub const EXIT_PAYLOAD: Self = Self(1 << 22);
    /// `DFLAG_FRAGMENTS`
    pub const FRAGMENTS: Self = Self(1 << 23);
    /// `DFLAG_HANDSHAKE_23`
    pub const HANDSHAKE_23: Self = Self(1 << 24);
    /// `DFLAG_V4_NC`
    pub const V4_NC: Self = Self(1 << 34);
    /// `DFLAG_ALIAS`
    pub const ALIAS: Self = Self(1 << 35);

    /// The flags this node advertises
    pub const DEFAULT: Self = Self(
        Self::EXTENDED_REFERENCES.0
            | Self::DIST_MONITOR.0
            | Self::FUN_TAGS.0
            | Self::DIST_MONITOR_NAME.0
            | Self::NEW_FUN_TAGS.0
            | Self::EXTENDED_PIDS_PORTS.0
            | Self::EXPORT_PTR_TAG.0
            | Self::BIT_BINARIES.0
            | Self::NEW_FLOATS.0
            | Self::SMALL_ATOM_TAGS.0
            | Self::UTF8_ATOMS.0
            | Self::MAP_TAG.0
            | Self::BIG_CREATION.0
            | Self::SEND_SENDER.0
            | Self::HANDSHAKE_23.0
            | Self::V4_NC.0
            | Self::ALIAS.0,
    );

    /// Returns [true] if every flag in `other` is set
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// The low 32 bits, as carried by legacy (version 5) messages
    pub fn low(self) -> u32 {
        (self.0 & 0xffff_ffff) as u32
    }

    /// The high 32 bits, as carried by the complement message
    pub fn high(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Reassemble flags from their two halves
    pub fn from_halves(high: u32, low: u32) -> Self {
        Self(((high as u64) << 32) | low as u64)
    }
}

impl std::ops::BitOr for DistributionFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[cfg(test)]
mod tests {
    use super::DistributionFlags;

    #[test]
    fn default_flags_negotiate_the_23_handshake() {
        let flags = DistributionFlags::DEFAULT;
        assert!(flags.contains(DistributionFlags::HANDSHAKE_23));
        assert!(flags.contains(DistributionFlags::BIG_CREATION | DistributionFlags::ALIAS));
        assert!(!flags.contains(DistributionFlags::PUBLISHED));
        assert!(!flags.contains(DistributionFlags::DIST_HDR_ATOM_CACHE));
        assert_eq!(flags, DistributionFlags::from_halves(flags.high(), flags.low()));
        assert_eq!(0b1100, flags.high());
    }
}
