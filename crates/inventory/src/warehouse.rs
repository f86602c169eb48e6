use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::{DomainError, DomainResult, WarehouseId};

/// Reserved warehouse codes used to pick the default warehouse. All codes rank
/// equally; see [`resolve_default`].
pub const DEFAULT_WAREHOUSE_CODES: [&str; 2] = ["YYCOM_MAIN", "MAIN"];

/// A stock location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warehouse {
    pub id: WarehouseId,
    pub code: String,
    pub name: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl Warehouse {
    pub fn new(
        code: impl Into<String>,
        name: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> DomainResult<Self> {
        let code = code.into().trim().to_string();
        let name = name.into();
        if code.is_empty() {
            return Err(DomainError::validation("warehouse code cannot be empty"));
        }
        if name.trim().is_empty() {
            return Err(DomainError::validation("warehouse name cannot be empty"));
        }
        Ok(Self {
            id: WarehouseId::new(),
            code,
            name,
            active: true,
            created_at,
        })
    }
}

/// Pick the single default warehouse.
///
/// Precedence: the earliest-created active warehouse whose code is one of
/// `reserved_codes`, else the earliest-created active warehouse. Inactive
/// warehouses are never chosen.
pub fn resolve_default<'a, S>(warehouses: &'a [Warehouse], reserved_codes: &[S]) -> Option<&'a Warehouse>
where
    S: AsRef<str>,
{
    let creation_order = |w: &&Warehouse| (w.created_at, w.id);
    let active = || warehouses.iter().filter(|w| w.active);

    active()
        .filter(|w| reserved_codes.iter().any(|c| c.as_ref() == w.code))
        .min_by_key(creation_order)
        .or_else(|| active().min_by_key(creation_order))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn warehouse(code: &str, minutes: i64) -> Warehouse {
        let base = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        Warehouse::new(code, format!("{code} warehouse"), base + Duration::minutes(minutes)).unwrap()
    }

    #[test]
    fn reserved_code_wins_over_earlier_warehouse() {
        let all = vec![warehouse("SEOUL", 0), warehouse("MAIN", 5)];
        let picked = resolve_default(&all, &DEFAULT_WAREHOUSE_CODES).unwrap();
        assert_eq!(picked.code, "MAIN");
    }

    #[test]
    fn earliest_reserved_warehouse_is_chosen_among_several() {
        let all = vec![warehouse("MAIN", 10), warehouse("YYCOM_MAIN", 20)];
        let picked = resolve_default(&all, &DEFAULT_WAREHOUSE_CODES).unwrap();
        assert_eq!(picked.code, "MAIN");
    }

    #[test]
    fn reserved_code_order_does_not_matter() {
        let all = vec![warehouse("YYCOM_MAIN", 30), warehouse("MAIN", 10)];
        let forward = resolve_default(&all, &["YYCOM_MAIN", "MAIN"]).unwrap();
        let reversed = resolve_default(&all, &["MAIN", "YYCOM_MAIN"]).unwrap();
        assert_eq!(forward.code, "MAIN");
        assert_eq!(reversed.code, "MAIN");
    }

    #[test]
    fn falls_back_to_first_created_active_warehouse() {
        let mut first = warehouse("BUSAN", 0);
        first.active = false;
        let all = vec![first, warehouse("INCHEON", 3), warehouse("DAEGU", 7)];
        let picked = resolve_default(&all, &DEFAULT_WAREHOUSE_CODES).unwrap();
        assert_eq!(picked.code, "INCHEON");
    }

    #[test]
    fn no_active_warehouse_resolves_to_none() {
        let mut only = warehouse("MAIN", 0);
        only.active = false;
        assert!(resolve_default(&[only], &DEFAULT_WAREHOUSE_CODES).is_none());
        assert!(resolve_default::<&str>(&[], &[]).is_none());
    }

    #[test]
    fn blank_code_is_rejected() {
        assert!(Warehouse::new("  ", "Nowhere", Utc::now()).is_err());
    }
}
