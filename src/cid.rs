//! Composite identifiers handed to the director
//!
//! VM and disk CIDs are opaque `context:id` strings. The context names the
//! kubeconfig context (cluster + credentials + namespace) the object lives
//! in; the id is the raw token used in object names and correlation labels.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

const SEPARATOR: char = ':';

/// Join a context and an id into a CID string
pub fn encode(context: &str, id: &str) -> String {
    format!("{context}{SEPARATOR}{id}")
}

/// Split a CID string on its first separator
///
/// A CID without a separator was not produced by this CPI, so it is rejected
/// rather than guessed at.
pub fn decode(cid: &str) -> Result<(&str, &str)> {
    cid.split_once(SEPARATOR).ok_or_else(|| {
        Error::validation(format!(
            "malformed CID {cid:?}: expected <context>{SEPARATOR}<id>"
        ))
    })
}

macro_rules! composite_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Build a CID from a context and an id
            pub fn new(context: &str, id: &str) -> Self {
                Self(encode(context, id))
            }

            /// Decode into `(context, id)`
            pub fn parse(&self) -> Result<(&str, &str)> {
                decode(&self.0)
            }

            /// The raw CID string
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

composite_id!(
    /// Handle for a VM (pod or deployment) created by this CPI
    VmCid
);

composite_id!(
    /// Handle for a persistent disk (claim) created by this CPI
    DiskCid
);
