use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Identifier of a migration unit: a millisecond timestamp taken when the
/// unit was authored. Application order is ascending identifier order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MigrationId(i64);

impl MigrationId {
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for MigrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for MigrationId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl FromStr for MigrationId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::MigrationId;

    #[test]
    fn ids_order_numerically() {
        let mut ids = vec![
            MigrationId::new(1713139200000),
            MigrationId::new(1709251200000),
            MigrationId::new(1711324800000),
        ];
        ids.sort();
        assert_eq!(
            ids,
            vec![
                MigrationId::new(1709251200000),
                MigrationId::new(1711324800000),
                MigrationId::new(1713139200000),
            ]
        );
    }

    #[test]
    fn parses_from_cli_input() {
        let id: MigrationId = " 1714348800000 ".parse().unwrap();
        assert_eq!(id.get(), 1714348800000);
        assert!("next".parse::<MigrationId>().is_err());
    }

    #[test]
    fn serializes_as_bare_number() {
        let json = serde_json::to_string(&MigrationId::new(7)).unwrap();
        assert_eq!(json, "7");
    }
}
