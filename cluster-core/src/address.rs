//! Service address data model.

use crate::error::{ClusterError, ClusterResult};

/// A service address is either a numeric id or a name. Exactly one of the
/// two is set; there is no "both" or "neither" state once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Id(u32),
    Name(String),
}

impl Address {
    /// Builds an address from a user-supplied string: a leading `@` is
    /// stripped for the sentinel form; otherwise the sentinel is implied and
    /// the whole string becomes the name. Either way the stored name never
    /// carries the sentinel.
    pub fn from_str_sentinel(s: &str) -> ClusterResult<Address> {
        let stripped = s.strip_prefix('@').unwrap_or(s);
        if stripped.is_empty() {
            return Err(ClusterError::validation("address name must not be empty"));
        }
        Ok(Address::Name(stripped.to_string()))
    }

    /// Builds an address from a non-negative integer, narrowed to u32.
    pub fn from_id(id: u64) -> ClusterResult<Address> {
        let narrowed = id as u32;
        if narrowed == 0 {
            return Err(ClusterError::validation("numeric address id must be non-zero"));
        }
        Ok(Address::Id(narrowed))
    }

    pub fn is_name(&self) -> bool {
        matches!(self, Address::Name(_))
    }

    /// Display form with the `@` sentinel stripped.
    pub fn display(&self) -> String {
        match self {
            Address::Id(id) => id.to_string(),
            Address::Name(name) => name.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_sentinel() {
        assert_eq!(Address::from_str_sentinel("@db").unwrap(), Address::Name("db".into()));
        assert_eq!(Address::from_str_sentinel("db").unwrap(), Address::Name("db".into()));
    }

    #[test]
    fn rejects_zero_id() {
        assert!(Address::from_id(0).is_err());
    }

    #[test]
    fn narrows_oversized_id_to_u32() {
        let id = (1u64 << 32) | 5;
        assert_eq!(Address::from_id(id).unwrap(), Address::Id(5));
    }

    #[test]
    fn rejects_an_id_that_narrows_to_zero() {
        assert!(Address::from_id(1u64 << 40).is_err());
    }
}
