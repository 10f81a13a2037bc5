//! Core type definitions for ringlog.

use serde::Serialize;
use std::fmt;
use uuid::Uuid;

/// Log sequence number.
///
/// An LSN is the byte position of a record in the log's total write order.
/// Valid LSNs lie in `[0, Lsn::MAX)`; [`Lsn::NULL`] marks "no record".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Lsn(pub i64);

impl Lsn {
    /// The null LSN.
    pub const NULL: Self = Self(-1);

    /// The first LSN of every log.
    pub const ZERO: Self = Self(0);

    /// Upper bound (exclusive) of the valid LSN range.
    pub const MAX: Self = Self(i64::MAX);

    /// Creates a new LSN.
    #[must_use]
    pub const fn new(lsn: i64) -> Self {
        Self(lsn)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_i64(self) -> i64 {
        self.0
    }

    /// Returns true for [`Lsn::NULL`].
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == Self::NULL.0
    }

    /// Returns true if the LSN lies in `[0, Lsn::MAX)`.
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 >= 0 && self.0 < Self::MAX.0
    }

    /// Returns the LSN `bytes` further along.
    #[must_use]
    pub const fn advance(self, bytes: u64) -> Self {
        Self(self.0 + bytes as i64)
    }

    /// Returns the LSN immediately below this one.
    #[must_use]
    pub const fn prev(self) -> Self {
        Self(self.0 - 1)
    }

    /// Returns the number of bytes from `lower` up to this LSN.
    #[must_use]
    pub const fn distance_from(self, lower: Self) -> u64 {
        (self.0 - lower.0) as u64
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "lsn:null")
        } else {
            write!(f, "lsn:{}", self.0)
        }
    }
}

/// Application sequence number.
///
/// Chosen by the caller, independent of physical order. Asn 0 is reserved
/// as [`Asn::NULL`] and doubles as the initial truncation point, so it can
/// never be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
pub struct Asn(pub u64);

impl Asn {
    /// The null Asn.
    pub const NULL: Self = Self(0);

    /// The largest Asn.
    pub const MAX: Self = Self(u64::MAX);

    /// Creates a new Asn.
    #[must_use]
    pub const fn new(asn: u64) -> Self {
        Self(asn)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Asn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "asn:{}", self.0)
    }
}

/// Record version; a newer write of the same Asn must carry a larger one.
pub type Version = u64;

macro_rules! guid_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Creates an identifier from a UUID.
            #[must_use]
            pub const fn new(id: Uuid) -> Self {
                Self(id)
            }

            /// Creates a random identifier.
            #[must_use]
            pub fn random() -> Self {
                Self(Uuid::new_v4())
            }

            /// Creates an identifier from its 16 raw bytes.
            #[must_use]
            pub const fn from_bytes(bytes: [u8; 16]) -> Self {
                Self(Uuid::from_bytes(bytes))
            }

            /// Returns the 16 raw bytes.
            #[must_use]
            pub const fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, ":{}"), self.0)
            }
        }
    };
}

guid_id!(
    /// Identifier of one physical log.
    LogId,
    "log"
);

guid_id!(
    /// Identifier of a stream within a physical log.
    StreamId,
    "stream"
);

guid_id!(
    /// Caller-defined stream type; selects the registered record verifier.
    StreamType,
    "type"
);

impl StreamId {
    /// Reserved id of the internal physical checkpoint stream.
    pub const PHYSICAL_CHECKPOINT: Self =
        Self(Uuid::from_u128(0x7b1c_44a0_58e2_4f0c_9a3e_0d5c_61f2_a001));
}

impl StreamType {
    /// Stream type of the internal physical checkpoint stream.
    pub const PHYSICAL_CHECKPOINT: Self =
        Self(Uuid::from_u128(0x7b1c_44a0_58e2_4f0c_9a3e_0d5c_61f2_a002));
}

/// Lifecycle state of an Asn index entry.
///
/// The ordering `None < Pending < Persisted` is relied upon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[repr(u8)]
pub enum Disposition {
    /// Indexed, but no LSN has been assigned yet.
    None = 0,
    /// Write issued, not yet confirmed durable.
    Pending = 1,
    /// Confirmed durable.
    Persisted = 2,
}

impl Disposition {
    /// Converts a byte to a disposition.
    #[must_use]
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::None),
            1 => Some(Self::Pending),
            2 => Some(Self::Persisted),
            _ => None,
        }
    }

    /// Converts the disposition to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}
