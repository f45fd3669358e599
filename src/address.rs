use cid::Cid;
use std::convert::TryFrom;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Scheme marker leading every database address.
pub const SCHEME: &str = "peerbase";

/// Canonical identifier of a database: the manifest hash plus the name,
/// rendered as `/peerbase/<root>/<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    root: Cid,
    path: String,
}

impl Address {
    pub fn new(root: Cid, path: &str) -> Address {
        Address {
            root,
            path: path.to_owned(),
        }
    }

    /// The manifest hash this database is rooted at.
    pub fn root(&self) -> &Cid {
        &self.root
    }

    /// The database name.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Strict parse: exactly `/peerbase/<cid>/<name>`, all segments
    /// non-empty, the root a well-formed content address.
    pub fn parse(input: &str) -> Result<Address> {
        let invalid = || Error::InvalidAddress(input.to_owned());
        let segments: Vec<&str> = input.split('/').collect();
        if segments.len() != 4 || !segments[0].is_empty() {
            return Err(invalid());
        }
        if segments[1] != SCHEME || segments[3].is_empty() {
            return Err(invalid());
        }
        let root = Cid::try_from(segments[2]).map_err(|_| invalid())?;
        Ok(Address {
            root,
            path: segments[3].to_owned(),
        })
    }

    pub fn is_valid(input: &str) -> bool {
        Address::parse(input).is_ok()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/{}/{}", SCHEME, self.root, self.path)
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Address> {
        Address::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::cid_of;

    fn some_root() -> Cid {
        cid_of(b"manifest bytes").unwrap()
    }

    #[test]
    fn renders_and_parses_canonical_form() {
        let address = Address::new(some_root(), "db-1");
        let rendered = address.to_string();
        assert!(rendered.starts_with("/peerbase/"));
        let parsed = Address::parse(&rendered).unwrap();
        assert_eq!(parsed, address);
    }

    #[test]
    fn rejects_missing_scheme() {
        let rendered = format!("/elsewhere/{}/db-1", some_root());
        assert!(Address::parse(&rendered).is_err());
        assert!(Address::parse("db-1").is_err());
    }

    #[test]
    fn rejects_bad_root() {
        assert!(Address::parse("/peerbase/not-a-cid/db-1").is_err());
    }

    #[test]
    fn rejects_wrong_segment_count() {
        let root = some_root();
        assert!(Address::parse(&format!("/peerbase/{}", root)).is_err());
        assert!(Address::parse(&format!("/peerbase/{}/a/b", root)).is_err());
        assert!(Address::parse(&format!("/peerbase/{}/", root)).is_err());
        assert!(Address::parse(&format!("peerbase/{}/db", root)).is_err());
    }
}
