use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::{Entity, WarehouseId};

use crate::error::{StockError, StockResult};

pub const MAX_NAME_LEN: usize = 255;
pub const MAX_CODE_LEN: usize = 50;

/// A physical stock location.
///
/// Fields are private; construction goes through [`Warehouse::register`], which
/// enforces the length limits of the persisted schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warehouse {
    id: WarehouseId,
    name: String,
    code: String,
    address: Option<String>,
    is_active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// Mutable descriptive fields of a warehouse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarehouseDetails {
    pub name: String,
    pub code: String,
    pub address: Option<String>,
}

impl WarehouseDetails {
    fn validated(self) -> StockResult<Self> {
        let name = self.name.trim().to_string();
        let code = self.code.trim().to_string();
        if name.is_empty() || name.chars().count() > MAX_NAME_LEN {
            return Err(StockError::validation(format!(
                "warehouse name must be 1..={MAX_NAME_LEN} characters"
            )));
        }
        if code.is_empty() || code.chars().count() > MAX_CODE_LEN {
            return Err(StockError::validation(format!(
                "warehouse code must be 1..={MAX_CODE_LEN} characters"
            )));
        }
        let address = self
            .address
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty());
        Ok(Self { name, code, address })
    }
}

impl Warehouse {
    /// Register a new, active warehouse.
    pub fn register(
        id: WarehouseId,
        details: WarehouseDetails,
        now: DateTime<Utc>,
    ) -> StockResult<Self> {
        let details = details.validated()?;
        Ok(Self {
            id,
            name: details.name,
            code: details.code,
            address: details.address,
            is_active: true,
            created_at: now,
            updated_at: now,
        })
    }

    /// Rebuild a warehouse from persisted columns.
    #[allow(clippy::too_many_arguments)]
    pub fn restore(
        id: WarehouseId,
        name: String,
        code: String,
        address: Option<String>,
        is_active: bool,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            name,
            code,
            address,
            is_active,
            created_at,
            updated_at,
        }
    }

    pub fn id_typed(&self) -> WarehouseId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn set_active(&mut self, active: bool, now: DateTime<Utc>) {
        if self.is_active != active {
            self.is_active = active;
            self.updated_at = now;
        }
    }

    /// Replace name/code/address.
    ///
    /// `referenced` must be true when any stock row points at this warehouse;
    /// referenced warehouses keep their identity fields.
    pub fn update_details(
        &mut self,
        details: WarehouseDetails,
        referenced: bool,
        now: DateTime<Utc>,
    ) -> StockResult<()> {
        if referenced {
            return Err(StockError::invariant(format!(
                "warehouse {} is referenced by stock and cannot be changed",
                self.id
            )));
        }
        let details = details.validated()?;
        self.name = details.name;
        self.code = details.code;
        self.address = details.address;
        self.updated_at = now;
        Ok(())
    }
}

impl Entity for Warehouse {
    type Id = WarehouseId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn details(name: &str, code: &str) -> WarehouseDetails {
        WarehouseDetails {
            name: name.to_string(),
            code: code.to_string(),
            address: Some("  ".to_string()),
        }
    }

    #[test]
    fn register_trims_and_drops_blank_address() {
        let w = Warehouse::register(WarehouseId::new(), details("  Main  ", "MAIN"), Utc::now())
            .unwrap();
        assert_eq!(w.name(), "Main");
        assert_eq!(w.address(), None);
        assert!(w.is_active());
    }

    #[test]
    fn register_rejects_overlong_code() {
        let code = "X".repeat(MAX_CODE_LEN + 1);
        let err = Warehouse::register(WarehouseId::new(), details("Main", &code), Utc::now())
            .unwrap_err();
        assert!(matches!(err, StockError::Validation(_)));
    }

    #[test]
    fn referenced_warehouse_keeps_its_details() {
        let mut w =
            Warehouse::register(WarehouseId::new(), details("Main", "MAIN"), Utc::now()).unwrap();
        let err = w
            .update_details(details("Other", "OTH"), true, Utc::now())
            .unwrap_err();
        assert!(matches!(err, StockError::InvariantViolation(_)));
        assert_eq!(w.code(), "MAIN");

        w.update_details(details("Other", "OTH"), false, Utc::now())
            .unwrap();
        assert_eq!(w.code(), "OTH");
    }
}
