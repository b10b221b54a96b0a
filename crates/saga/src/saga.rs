//! The persisted Pix saga.

use chrono::{DateTime, Utc};
use common::{AccountId, CorrelationId, SagaId, TenantId};
use domain::{CurrencyCode, Money};
use rust_decimal::Decimal;
use store::{SagaRecord, Version};

use crate::error::{Result, SagaError};
use crate::state::PixSagaStatus;

/// A Pix payment in flight.
///
/// The saga is reloaded from the store before every step and written back
/// with a conditional version write after every transition, so no
/// in-memory copy outlives a single step.
#[derive(Debug, Clone, PartialEq)]
pub struct PixSaga {
    id: SagaId,
    tenant_id: TenantId,
    account_id: AccountId,
    amount: Money,
    tax: Decimal,
    pix_key: String,
    status: PixSagaStatus,
    failure_reason: Option<String>,
    funds_locked: bool,
    settlement_id: Option<String>,
    version: Version,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl PixSaga {
    /// Creates a saga in [`PixSagaStatus::Created`]. It is not persisted yet.
    pub fn new(
        tenant_id: TenantId,
        account_id: AccountId,
        amount: Money,
        tax: Decimal,
        pix_key: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: SagaId::new(),
            tenant_id,
            account_id,
            amount,
            tax,
            pix_key: pix_key.into(),
            status: PixSagaStatus::Created,
            failure_reason: None,
            funds_locked: false,
            settlement_id: None,
            version: Version::initial(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> SagaId {
        self.id
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn account_id(&self) -> AccountId {
        self.account_id
    }

    /// Amount delivered to the payee.
    pub fn amount(&self) -> Money {
        self.amount
    }

    pub fn tax(&self) -> Decimal {
        self.tax
    }

    /// Amount debited from the source account: payment plus tax.
    pub fn total(&self) -> Result<Money> {
        Ok(self
            .amount
            .add(&Money::of(self.tax, self.amount.currency()))?)
    }

    pub fn pix_key(&self) -> &str {
        &self.pix_key
    }

    pub fn status(&self) -> PixSagaStatus {
        self.status
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    /// True while the source account holds a debit this saga must settle
    /// or refund.
    pub fn funds_locked(&self) -> bool {
        self.funds_locked
    }

    pub fn settlement_id(&self) -> Option<&str> {
        self.settlement_id.as_deref()
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Ledger entries written by this saga share its id as correlation id.
    pub fn correlation_id(&self) -> CorrelationId {
        self.id.into()
    }

    /// A failed saga still holding funds owes a refund.
    pub fn needs_compensation(&self) -> bool {
        self.status == PixSagaStatus::Failed && self.funds_locked
    }

    /// Created -> BalanceLocked, after the debit was staged.
    pub fn lock_funds(&mut self) -> Result<()> {
        self.transition(PixSagaStatus::BalanceLocked)?;
        self.funds_locked = true;
        Ok(())
    }

    /// BalanceLocked -> Completed.
    pub fn complete(&mut self, settlement_id: impl Into<String>) -> Result<()> {
        self.transition(PixSagaStatus::Completed)?;
        self.settlement_id = Some(settlement_id.into());
        self.funds_locked = false;
        Ok(())
    }

    /// Created or BalanceLocked -> Failed. Locked funds stay locked until
    /// compensation.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition(PixSagaStatus::Failed)?;
        self.failure_reason = Some(reason.into());
        Ok(())
    }

    /// Failed -> Refunded, after the credit back was staged.
    pub fn refund(&mut self) -> Result<()> {
        if !self.funds_locked {
            return Err(SagaError::InvalidTransition {
                from: self.status,
                to: PixSagaStatus::Refunded,
            });
        }
        self.transition(PixSagaStatus::Refunded)?;
        self.funds_locked = false;
        Ok(())
    }

    fn transition(&mut self, to: PixSagaStatus) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(SagaError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub(crate) fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    /// Stored form of the saga at `version`.
    pub fn to_record(&self, version: Version) -> SagaRecord {
        SagaRecord {
            id: self.id,
            tenant_id: self.tenant_id,
            account_id: self.account_id,
            amount: self.amount.amount(),
            tax: self.tax,
            currency_code: self.amount.currency().as_str().to_string(),
            pix_key: self.pix_key.clone(),
            status: self.status.as_str().to_string(),
            failure_reason: self.failure_reason.clone(),
            funds_locked: self.funds_locked,
            settlement_id: self.settlement_id.clone(),
            version,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

impl TryFrom<SagaRecord> for PixSaga {
    type Error = SagaError;

    fn try_from(record: SagaRecord) -> Result<Self> {
        let currency = CurrencyCode::parse(&record.currency_code)?;
        Ok(Self {
            id: record.id,
            tenant_id: record.tenant_id,
            account_id: record.account_id,
            amount: Money::of(record.amount, currency),
            tax: record.tax,
            pix_key: record.pix_key,
            status: record.status.parse()?,
            failure_reason: record.failure_reason,
            funds_locked: record.funds_locked,
            settlement_id: record.settlement_id,
            version: record.version,
            created_at: record.created_at,
            updated_at: record.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn saga() -> PixSaga {
        PixSaga::new(
            TenantId::new(),
            AccountId::new(),
            Money::of(Decimal::from(20), CurrencyCode::BRL),
            Decimal::new(8, 2),
            "alice@example.com",
        )
    }

    #[test]
    fn total_includes_tax() {
        assert_eq!(
            saga().total().unwrap(),
            Money::of(Decimal::new(2008, 2), CurrencyCode::BRL)
        );
    }

    #[test]
    fn rejection_path_ends_refunded() {
        let mut saga = saga();
        saga.lock_funds().unwrap();
        assert!(saga.funds_locked());

        saga.fail("AM04").unwrap();
        assert!(saga.needs_compensation());
        assert_eq!(saga.failure_reason(), Some("AM04"));

        saga.refund().unwrap();
        assert_eq!(saga.status(), PixSagaStatus::Refunded);
        assert!(!saga.funds_locked());
        assert!(!saga.needs_compensation());
    }

    #[test]
    fn failed_debit_has_nothing_to_refund() {
        let mut saga = saga();
        saga.fail("insufficient funds").unwrap();
        assert!(!saga.needs_compensation());
        assert!(matches!(
            saga.refund(),
            Err(SagaError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn completed_saga_cannot_fail() {
        let mut saga = saga();
        saga.lock_funds().unwrap();
        saga.complete("E2E-1").unwrap();
        assert_eq!(saga.settlement_id(), Some("E2E-1"));
        assert!(saga.fail("late").is_err());
        assert_eq!(saga.status(), PixSagaStatus::Completed);
    }

    #[test]
    fn record_round_trip_keeps_state() {
        let mut saga = saga();
        saga.lock_funds().unwrap();
        let record = saga.to_record(Version::new(2));
        assert_eq!(record.status, "BALANCE_LOCKED");

        let mut expected = saga.clone();
        expected.set_version(Version::new(2));
        assert_eq!(PixSaga::try_from(record).unwrap(), expected);
    }
}
