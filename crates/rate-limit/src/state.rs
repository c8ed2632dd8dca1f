//! Per-request state shared between admission and settlement.

use crate::identity::Identity;

/// Buckets and identities resolved for a request, stored in its extensions.
///
/// Every bucket name is paired with the identity computed for it, so both sequences always
/// have the same length. Only the `limited` flag changes after admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitingState {
    entries: Vec<(String, Identity)>,
    limited: bool,
}

impl LimitingState {
    pub(crate) fn new(entries: Vec<(String, Identity)>) -> Self {
        Self { entries, limited: false }
    }

    /// Bucket names in priority order.
    pub fn bucket_names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    /// Identities, one per bucket name.
    pub fn identities(&self) -> impl Iterator<Item = &Identity> {
        self.entries.iter().map(|(_, identity)| identity)
    }

    /// Bucket names paired with their identities.
    pub fn entries(&self) -> &[(String, Identity)] {
        &self.entries
    }

    /// True if admission rejected the request.
    pub fn is_limited(&self) -> bool {
        self.limited
    }

    pub(crate) fn mark_limited(&mut self) {
        self.limited = true;
    }
}
