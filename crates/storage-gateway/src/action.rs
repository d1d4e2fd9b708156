//! The action lattice shared by the permission tree and by
//! [`crate::storage::FileStatusPermission`]: `deny < list < read < write <
//! manage`. A user possesses action `A` on a path iff the action at the
//! deepest matched node along that path is `>= A` under this order.

use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Action {
    Deny,
    List,
    Read,
    Write,
    Manage,
}

impl Action {
    const ORDER: [Action; 5] = [
        Action::Deny,
        Action::List,
        Action::Read,
        Action::Write,
        Action::Manage,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Action::Deny => "deny",
            Action::List => "list",
            Action::Read => "read",
            Action::Write => "write",
            Action::Manage => "manage",
        }
    }

    /// `self` dominates (is at least as permissive as) `requested`.
    pub fn satisfies(self, requested: Action) -> bool {
        requested <= self
    }

    /// The wire value to use for a `FileStatus.permission` field: `list`
    /// collapses to `read` on the wire, matching
    /// `_convert_action_to_permission`.
    pub fn as_file_permission(self) -> Action {
        if self == Action::List {
            Action::Read
        } else {
            self
        }
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Action::ORDER
            .iter()
            .copied()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| format!("unknown action {s:?}"))
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl serde::Serialize for Action {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> serde::Deserialize<'de> for Action {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn order_is_total_and_ascending() {
        assert!(Action::Deny < Action::List);
        assert!(Action::List < Action::Read);
        assert!(Action::Read < Action::Write);
        assert!(Action::Write < Action::Manage);
    }

    #[test]
    fn satisfies_is_dominance_under_the_order() {
        assert!(Action::Manage.satisfies(Action::Write));
        assert!(!Action::Read.satisfies(Action::Write));
        assert!(Action::Read.satisfies(Action::Read));
    }

    #[test]
    fn list_collapses_to_read_on_the_wire() {
        assert_eq!(Action::List.as_file_permission(), Action::Read);
        assert_eq!(Action::Manage.as_file_permission(), Action::Manage);
    }
}
