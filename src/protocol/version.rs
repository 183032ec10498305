//! Protocol versions, wire formats and the variant they select.

use std::fmt;

use crate::protocol::framing::{Framing, JsonFraming, PackedFraming};

/// Version marker sent as the first four bytes of a driver connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProtocolVersion {
    V0_1,
    V0_2,
    V0_3,
    V0_4,
}

impl ProtocolVersion {
    pub const ALL: [ProtocolVersion; 4] = [
        ProtocolVersion::V0_1,
        ProtocolVersion::V0_2,
        ProtocolVersion::V0_3,
        ProtocolVersion::V0_4,
    ];

    pub fn from_magic(magic: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.magic() == magic)
    }

    pub fn magic(self) -> u32 {
        match self {
            ProtocolVersion::V0_1 => 0x3f61_ba36,
            ProtocolVersion::V0_2 => 0x7230_81e1,
            ProtocolVersion::V0_3 => 0x5f75_e83e,
            ProtocolVersion::V0_4 => 0x400c_2d20,
        }
    }

    /// V0_2 and later send an auth key after the version marker.
    pub fn carries_auth_key(self) -> bool {
        self >= ProtocolVersion::V0_2
    }

    /// V0_3 and later choose their wire format explicitly.
    pub fn negotiates_wire_format(self) -> bool {
        self >= ProtocolVersion::V0_3
    }
}

/// Encoding of requests and responses after the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WireFormat {
    Packed,
    Json,
}

impl WireFormat {
    pub fn from_magic(magic: u32) -> Option<Self> {
        match magic {
            0x271f_fc41 => Some(WireFormat::Packed),
            0x7e69_70c7 => Some(WireFormat::Json),
            _ => None,
        }
    }

    pub fn magic(self) -> u32 {
        match self {
            WireFormat::Packed => 0x271f_fc41,
            WireFormat::Json => 0x7e69_70c7,
        }
    }
}

/// The protocol a connection settled on. Fixed for the connection's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtocolVariant {
    pub version: ProtocolVersion,
    pub format: WireFormat,
}

impl ProtocolVariant {
    pub fn new(version: ProtocolVersion, format: WireFormat) -> Self {
        Self { version, format }
    }

    /// Only V0_4 JSON clients correlate responses by token; everything else
    /// expects responses in request order.
    pub fn allows_reordering(&self) -> bool {
        self.version >= ProtocolVersion::V0_4 && self.format == WireFormat::Json
    }

    /// Admission bound for this variant given the configured limit.
    pub fn max_concurrent_queries(&self, configured: usize) -> usize {
        if self.allows_reordering() {
            configured.max(1)
        } else {
            1
        }
    }

    pub fn framing(&self) -> Box<dyn Framing> {
        match self.format {
            WireFormat::Json => Box::new(JsonFraming),
            WireFormat::Packed => Box::new(PackedFraming),
        }
    }
}

impl fmt::Display for ProtocolVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let format = match self.format {
            WireFormat::Json => "json",
            WireFormat::Packed => "packed",
        };
        write!(f, "{:?}/{}", self.version, format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_magic_roundtrip_and_unknown() {
        for version in ProtocolVersion::ALL {
            assert_eq!(ProtocolVersion::from_magic(version.magic()), Some(version));
        }
        assert_eq!(ProtocolVersion::from_magic(0xdead_beef), None);
        assert_eq!(WireFormat::from_magic(0), None);
    }

    #[test]
    fn test_only_v0_4_json_runs_in_parallel() {
        let parallel = ProtocolVariant::new(ProtocolVersion::V0_4, WireFormat::Json);
        assert!(parallel.allows_reordering());
        assert_eq!(parallel.max_concurrent_queries(16), 16);
        assert_eq!(parallel.max_concurrent_queries(0), 1);

        let packed = ProtocolVariant::new(ProtocolVersion::V0_4, WireFormat::Packed);
        assert_eq!(packed.max_concurrent_queries(16), 1);

        let old_json = ProtocolVariant::new(ProtocolVersion::V0_3, WireFormat::Json);
        assert_eq!(old_json.max_concurrent_queries(16), 1);
    }

    #[test]
    fn test_feature_gates() {
        assert!(!ProtocolVersion::V0_1.carries_auth_key());
        assert!(ProtocolVersion::V0_2.carries_auth_key());
        assert!(!ProtocolVersion::V0_2.negotiates_wire_format());
        assert!(ProtocolVersion::V0_3.negotiates_wire_format());
    }
}
