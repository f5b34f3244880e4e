use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

uuid_id!(
    /// Identifier of one analysis session (modification tree plus root networks).
    StudyId
);
uuid_id!(
    /// Identifier of one modification step in a study's node tree.
    NodeId
);
uuid_id!(
    /// Identifier of an independent base-network baseline within a study.
    RootNetworkId
);
uuid_id!(
    /// Identifier of a physical network held by the variant store.
    NetworkId
);
uuid_id!(
    /// Identifier of a remote computation result.
    ResultId
);
uuid_id!(
    /// Identifier of a report held by the report store.
    ReportId
);
uuid_id!(
    /// Reference to one network modification owned by the modification service.
    ModificationRef
);

/// Name of a network snapshot inside the variant store.
///
/// Variant names are scoped to one physical network; the base snapshot every
/// network starts with is [`VariantId::INITIAL`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VariantId(String);

impl VariantId {
    pub const INITIAL: &'static str = "InitialState";

    /// The base snapshot of a network, present before any build.
    pub fn initial() -> Self {
        Self(Self::INITIAL.to_string())
    }

    /// A fresh, unique variant name for a new build.
    pub fn fresh() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for VariantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for VariantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
