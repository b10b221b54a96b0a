//! Account aggregate.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use common::{AccountId, TenantId};
use store::{AccountDocument, Version};
use thiserror::Error;

use crate::money::{CurrencyCode, Money, MoneyError};

/// Errors raised by balance mutations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccountError {
    /// The account holds no balance in the requested currency.
    #[error("Account has no {0} balance")]
    UnknownCurrency(CurrencyCode),

    /// The balance is smaller than the requested debit.
    #[error("Insufficient funds: available {available}, requested {requested}")]
    InsufficientFunds { available: Money, requested: Money },

    /// Debits and credits take strictly positive amounts.
    #[error("Amount must be positive: {0}")]
    NonPositiveAmount(Money),

    #[error(transparent)]
    Money(#[from] MoneyError),
}

/// A tenant's account with one balance per currency.
///
/// `debit` and `credit` only touch the in-memory state; persisting the
/// change is the job of [`crate::repository`]. The version is the
/// optimistic-concurrency token read at load time.
#[derive(Debug, Clone, PartialEq)]
pub struct Account {
    id: AccountId,
    tenant_id: TenantId,
    balances: BTreeMap<CurrencyCode, Money>,
    version: Version,
    last_updated: DateTime<Utc>,
}

impl Account {
    /// Opens a new, empty account that has not been persisted yet.
    pub fn open(id: AccountId, tenant_id: TenantId) -> Self {
        Self {
            id,
            tenant_id,
            balances: BTreeMap::new(),
            version: Version::initial(),
            last_updated: Utc::now(),
        }
    }

    pub fn id(&self) -> AccountId {
        self.id
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn last_updated(&self) -> DateTime<Utc> {
        self.last_updated
    }

    /// Returns the balance held in `currency`, if any.
    pub fn balance(&self, currency: &CurrencyCode) -> Option<&Money> {
        self.balances.get(currency)
    }

    /// Returns the balance held in `currency`, or zero.
    pub fn balance_or_zero(&self, currency: CurrencyCode) -> Money {
        self.balances
            .get(&currency)
            .copied()
            .unwrap_or_else(|| Money::zero(currency))
    }

    /// Iterates over all balances ordered by currency code.
    pub fn balances(&self) -> impl Iterator<Item = &Money> {
        self.balances.values()
    }

    /// Withdraws `amount` from the balance of its currency.
    ///
    /// On error the balance is left untouched.
    pub fn debit(&mut self, amount: &Money) -> Result<(), AccountError> {
        ensure_positive(amount)?;
        let current = self
            .balances
            .get(&amount.currency())
            .ok_or(AccountError::UnknownCurrency(amount.currency()))?;

        if current.checked_cmp(amount)?.is_lt() {
            return Err(AccountError::InsufficientFunds {
                available: *current,
                requested: *amount,
            });
        }

        let updated = current.subtract(amount)?;
        self.balances.insert(amount.currency(), updated);
        self.last_updated = Utc::now();
        Ok(())
    }

    /// Deposits `amount`, opening a zero balance for a new currency first.
    pub fn credit(&mut self, amount: &Money) -> Result<(), AccountError> {
        ensure_positive(amount)?;
        let updated = self.balance_or_zero(amount.currency()).add(amount)?;
        self.balances.insert(amount.currency(), updated);
        self.last_updated = Utc::now();
        Ok(())
    }

    pub(crate) fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    /// Builds the stored form of the account at the given version.
    pub fn to_document(&self, version: Version) -> AccountDocument {
        AccountDocument {
            id: self.id,
            tenant_id: self.tenant_id,
            balances: self
                .balances
                .iter()
                .map(|(code, money)| (code.as_str().to_string(), money.amount()))
                .collect(),
            version,
            last_updated: self.last_updated,
        }
    }
}

fn ensure_positive(amount: &Money) -> Result<(), AccountError> {
    if !amount.is_positive() {
        return Err(AccountError::NonPositiveAmount(*amount));
    }
    Ok(())
}

impl TryFrom<AccountDocument> for Account {
    type Error = MoneyError;

    fn try_from(doc: AccountDocument) -> Result<Self, Self::Error> {
        let balances = doc
            .balances
            .into_iter()
            .map(|(code, amount)| {
                let currency = CurrencyCode::parse(&code)?;
                Ok((currency, Money::of(amount, currency)))
            })
            .collect::<Result<BTreeMap<_, _>, MoneyError>>()?;

        Ok(Self {
            id: doc.id,
            tenant_id: doc.tenant_id,
            balances,
            version: doc.version,
            last_updated: doc.last_updated,
        })
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::*;

    fn brl(amount: i64) -> Money {
        Money::of(Decimal::from(amount), CurrencyCode::BRL)
    }

    fn funded(amount: i64) -> Account {
        let mut account = Account::open(AccountId::new(), TenantId::new());
        account.credit(&brl(amount)).unwrap();
        account
    }

    #[test]
    fn open_account_is_empty_and_unpersisted() {
        let account = Account::open(AccountId::new(), TenantId::new());
        assert_eq!(account.version(), Version::initial());
        assert_eq!(account.balances().count(), 0);
    }

    #[test]
    fn debit_reduces_balance() {
        let mut account = funded(100);
        account.debit(&brl(40)).unwrap();
        assert_eq!(account.balance(&CurrencyCode::BRL), Some(&brl(60)));
    }

    #[test]
    fn debit_of_entire_balance_leaves_zero() {
        let mut account = funded(50);
        account.debit(&brl(50)).unwrap();
        assert!(account.balance_or_zero(CurrencyCode::BRL).is_zero());
    }

    #[test]
    fn overdraft_is_rejected_and_balance_untouched() {
        let mut account = funded(50);
        let before = account.last_updated();

        let result = account.debit(&brl(100));
        assert!(matches!(
            result,
            Err(AccountError::InsufficientFunds { available, requested })
                if available == brl(50) && requested == brl(100)
        ));
        assert_eq!(account.balance(&CurrencyCode::BRL), Some(&brl(50)));
        assert_eq!(account.last_updated(), before);
    }

    #[test]
    fn debit_in_unknown_currency_fails() {
        let mut account = funded(50);
        let dollars = Money::of(Decimal::from(5), CurrencyCode::USD);
        assert_eq!(
            account.debit(&dollars),
            Err(AccountError::UnknownCurrency(CurrencyCode::USD))
        );
    }

    #[test]
    fn credit_opens_new_currency_at_zero() {
        let mut account = funded(10);
        let euros = Money::of(Decimal::new(1250, 2), CurrencyCode::EUR);
        account.credit(&euros).unwrap();

        assert_eq!(account.balance(&CurrencyCode::EUR), Some(&euros));
        assert_eq!(account.balance(&CurrencyCode::BRL), Some(&brl(10)));
    }

    #[test]
    fn non_positive_amounts_are_rejected() {
        let mut account = funded(10);
        assert!(matches!(
            account.credit(&brl(0)),
            Err(AccountError::NonPositiveAmount(_))
        ));
        assert!(matches!(
            account.debit(&brl(-5)),
            Err(AccountError::NonPositiveAmount(_))
        ));
        assert_eq!(account.balance(&CurrencyCode::BRL), Some(&brl(10)));
    }

    #[test]
    fn document_conversion_round_trips() {
        let mut account = funded(75);
        account.set_version(Version::new(4));

        let doc = account.to_document(account.version());
        assert_eq!(doc.balances["BRL"], Decimal::from(75));

        let restored = Account::try_from(doc).unwrap();
        assert_eq!(restored, account);
    }

    #[test]
    fn corrupt_currency_in_document_is_rejected() {
        let mut doc = funded(1).to_document(Version::first());
        doc.balances.insert("??".to_string(), Decimal::ONE);
        assert!(Account::try_from(doc).is_err());
    }
}
