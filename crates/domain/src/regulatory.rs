//! Per-jurisdiction regulatory packs and the explicit tenant context.

use std::collections::HashMap;
use std::sync::Arc;

use common::TenantId;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::account::Account;
use crate::money::{CurrencyCode, Money, MoneyError};

/// Jurisdiction a tenant operates under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Jurisdiction {
    Brazil,
    UnitedStates,
    EuropeanUnion,
}

impl Jurisdiction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Jurisdiction::Brazil => "BR",
            Jurisdiction::UnitedStates => "US",
            Jurisdiction::EuropeanUnion => "EU",
        }
    }
}

impl std::fmt::Display for Jurisdiction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller identity passed explicitly into every handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantContext {
    pub tenant_id: TenantId,
    pub jurisdiction: Jurisdiction,
}

impl TenantContext {
    pub fn new(tenant_id: TenantId, jurisdiction: Jurisdiction) -> Self {
        Self {
            tenant_id,
            jurisdiction,
        }
    }
}

/// Operation kinds, also used as idempotency operation types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationType {
    OpenAccount,
    Credit,
    Debit,
    Transfer,
    Pix,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::OpenAccount => "OPEN_ACCOUNT",
            OperationType::Credit => "CREDIT",
            OperationType::Debit => "DEBIT",
            OperationType::Transfer => "TRANSFER",
            OperationType::Pix => "PIX",
        }
    }

    /// Operations that carry a tax on top of the requested amount.
    pub fn is_taxable(&self) -> bool {
        matches!(self, OperationType::Debit | OperationType::Pix)
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rules of one jurisdiction, consulted synchronously before money moves.
pub trait RegulatoryPack: Send + Sync {
    fn jurisdiction(&self) -> Jurisdiction;

    /// Accepts the operation or returns the rejection reason.
    fn validate_transaction(
        &self,
        account: &Account,
        amount: &Money,
        operation: OperationType,
    ) -> Result<(), String>;

    /// Tax owed on top of `amount`, in the amount's currency.
    fn calculate_tax(
        &self,
        amount: &Money,
        operation: OperationType,
    ) -> Result<Decimal, MoneyError>;
}

/// Packs keyed by jurisdiction.
#[derive(Clone, Default)]
pub struct RegulatoryRegistry {
    packs: HashMap<Jurisdiction, Arc<dyn RegulatoryPack>>,
}

impl RegulatoryRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with [`BrazilPack`] for Brazil and [`PermissivePack`] elsewhere.
    pub fn with_defaults() -> Self {
        Self::new()
            .register(BrazilPack::default())
            .register(PermissivePack::new(Jurisdiction::UnitedStates))
            .register(PermissivePack::new(Jurisdiction::EuropeanUnion))
    }

    /// Adds or replaces the pack for its jurisdiction.
    pub fn register(mut self, pack: impl RegulatoryPack + 'static) -> Self {
        self.packs.insert(pack.jurisdiction(), Arc::new(pack));
        self
    }

    pub fn get(&self, jurisdiction: Jurisdiction) -> Option<Arc<dyn RegulatoryPack>> {
        self.packs.get(&jurisdiction).cloned()
    }
}

impl std::fmt::Debug for RegulatoryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegulatoryRegistry")
            .field("jurisdictions", &self.packs.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Brazilian rules: Pix moves BRL only and is capped per transaction.
#[derive(Debug, Clone)]
pub struct BrazilPack {
    pix_limit: Decimal,
    tax_rates: HashMap<OperationType, Decimal>,
}

impl Default for BrazilPack {
    fn default() -> Self {
        Self {
            pix_limit: Decimal::from(100_000),
            tax_rates: HashMap::new(),
        }
    }
}

impl BrazilPack {
    pub fn with_pix_limit(mut self, limit: Decimal) -> Self {
        self.pix_limit = limit;
        self
    }

    /// Sets a proportional tax rate (e.g. `0.0038`) for an operation.
    pub fn with_tax_rate(mut self, operation: OperationType, rate: Decimal) -> Self {
        self.tax_rates.insert(operation, rate);
        self
    }
}

impl RegulatoryPack for BrazilPack {
    fn jurisdiction(&self) -> Jurisdiction {
        Jurisdiction::Brazil
    }

    fn validate_transaction(
        &self,
        _account: &Account,
        amount: &Money,
        operation: OperationType,
    ) -> Result<(), String> {
        if operation == OperationType::Pix {
            if amount.currency() != CurrencyCode::BRL {
                return Err(format!("Pix only settles BRL, got {}", amount.currency()));
            }
            if amount.amount() > self.pix_limit {
                return Err(format!(
                    "Pix amount {} exceeds the per-transaction limit of {}",
                    amount, self.pix_limit
                ));
            }
        }
        Ok(())
    }

    fn calculate_tax(
        &self,
        amount: &Money,
        operation: OperationType,
    ) -> Result<Decimal, MoneyError> {
        let Some(rate) = self.tax_rates.get(&operation) else {
            return Ok(Decimal::ZERO);
        };
        let tax = amount
            .amount()
            .checked_mul(*rate)
            .ok_or(MoneyError::Overflow)?;
        Ok(tax.round_dp_with_strategy(
            amount.currency().minor_units(),
            RoundingStrategy::MidpointAwayFromZero,
        ))
    }
}

/// Pack with no rules and no tax.
#[derive(Debug, Clone)]
pub struct PermissivePack {
    jurisdiction: Jurisdiction,
}

impl PermissivePack {
    pub fn new(jurisdiction: Jurisdiction) -> Self {
        Self { jurisdiction }
    }
}

impl RegulatoryPack for PermissivePack {
    fn jurisdiction(&self) -> Jurisdiction {
        self.jurisdiction
    }

    fn validate_transaction(&self, _: &Account, _: &Money, _: OperationType) -> Result<(), String> {
        Ok(())
    }

    fn calculate_tax(&self, _: &Money, _: OperationType) -> Result<Decimal, MoneyError> {
        Ok(Decimal::ZERO)
    }
}
