use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a fresh random id
            #[inline]
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

macro_rules! named_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an externally assigned identifier
            #[inline]
            #[must_use]
            pub fn named(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow the raw identifier
            #[inline]
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::named(value)
            }
        }
    };
}

named_id!(
    /// A paying entity (a brokerage)
    AccountId
);

named_id!(
    /// The mutable image being edited
    ResourceId
);

named_id!(
    /// Opaque locator of one image version (URL or storage key)
    ResourceLocator
);

uuid_id!(
    /// One submitted edit
    OperationId
);

uuid_id!(
    /// One ledger entry
    TransactionId
);

uuid_id!(
    /// Identity of an issued capability token
    TokenId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_ids_compare_by_value() {
        assert_eq!(AccountId::named("acme"), AccountId::from("acme"));
        assert_ne!(ResourceId::named("a"), ResourceId::named("b"));
    }

    #[test]
    fn named_ids_serialize_transparently() {
        let json = serde_json::to_string(&ResourceId::named("img-1")).unwrap();
        assert_eq!(json, "\"img-1\"");
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(OperationId::new(), OperationId::new());
        assert_ne!(TokenId::new(), TokenId::new());
    }
}
