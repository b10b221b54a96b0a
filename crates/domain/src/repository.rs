//! Account persistence with optimistic concurrency.
//!
//! Protocol: load the document, mutate the in-memory [`Account`], then issue
//! a conditional write filtered on the version read at load time. A write
//! that modifies nothing means another session committed first; the caller
//! gets [`DomainError::ConcurrencyConflict`] and must start over from a fresh
//! read. Nothing here retries.

use common::{AccountId, TenantId};
use store::{Session, Version};

use crate::account::Account;
use crate::error::{DomainError, Result};

/// Loads an account owned by `tenant_id`.
///
/// Accounts of other tenants are reported as not found.
pub async fn load_account<S: Session>(
    session: &mut S,
    tenant_id: TenantId,
    id: AccountId,
) -> Result<Account> {
    let doc = session
        .load_account(id)
        .await?
        .filter(|doc| doc.tenant_id == tenant_id)
        .ok_or(DomainError::AccountNotFound(id))?;
    Ok(Account::try_from(doc)?)
}

/// Persists a newly opened account at [`Version::first`].
pub async fn insert_account<S: Session>(session: &mut S, account: &mut Account) -> Result<()> {
    let version = Version::first();
    session.insert_account(&account.to_document(version)).await?;
    account.set_version(version);
    Ok(())
}

/// Conditionally writes `account` back, bumping its version by one.
pub async fn save_account<S: Session>(session: &mut S, account: &mut Account) -> Result<()> {
    let expected = account.version();
    let next = expected.next();

    let modified = session
        .update_account(&account.to_document(next), expected)
        .await?;
    if modified == 0 {
        tracing::warn!(account_id = %account.id(), %expected, "stale account version");
        return Err(DomainError::ConcurrencyConflict {
            entity: "account",
            id: account.id().to_string(),
        });
    }

    account.set_version(next);
    Ok(())
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;
    use store::{InMemoryStore, Store};

    use super::*;
    use crate::money::{CurrencyCode, Money};

    fn brl(amount: i64) -> Money {
        Money::of(Decimal::from(amount), CurrencyCode::BRL)
    }

    async fn opened(store: &InMemoryStore, tenant_id: TenantId) -> Account {
        let mut account = Account::open(AccountId::new(), tenant_id);
        account.credit(&brl(50)).unwrap();
        let mut session = store.begin().await.unwrap();
        insert_account(&mut session, &mut account).await.unwrap();
        session.commit().await.unwrap();
        account
    }

    #[tokio::test]
    async fn insert_persists_at_first_version() {
        let store = InMemoryStore::new();
        let account = opened(&store, TenantId::new()).await;
        assert_eq!(account.version(), Version::first());

        let doc = store.get_account(account.id()).await.unwrap().unwrap();
        assert_eq!(doc.version, Version::first());
    }

    #[tokio::test]
    async fn save_bumps_version_by_exactly_one() {
        let store = InMemoryStore::new();
        let tenant_id = TenantId::new();
        let account = opened(&store, tenant_id).await;

        let mut session = store.begin().await.unwrap();
        let mut loaded = load_account(&mut session, tenant_id, account.id())
            .await
            .unwrap();
        loaded.debit(&brl(20)).unwrap();
        save_account(&mut session, &mut loaded).await.unwrap();
        session.commit().await.unwrap();

        assert_eq!(loaded.version(), Version::new(2));
        let doc = store.get_account(account.id()).await.unwrap().unwrap();
        assert_eq!(doc.version, Version::new(2));
        assert_eq!(doc.balances["BRL"], Decimal::from(30));
    }

    #[tokio::test]
    async fn save_with_stale_version_conflicts() {
        let store = InMemoryStore::new();
        let tenant_id = TenantId::new();
        let account = opened(&store, tenant_id).await;

        let mut first = store.begin().await.unwrap();
        let mut a = load_account(&mut first, tenant_id, account.id())
            .await
            .unwrap();
        a.debit(&brl(30)).unwrap();
        save_account(&mut first, &mut a).await.unwrap();
        first.commit().await.unwrap();

        // `account` still carries version 1.
        let mut stale = account.clone();
        stale.debit(&brl(30)).unwrap();
        let mut second = store.begin().await.unwrap();
        let result = save_account(&mut second, &mut stale).await;

        assert!(matches!(
            result,
            Err(DomainError::ConcurrencyConflict { .. })
        ));
        assert_eq!(stale.version(), Version::first());
    }

    #[tokio::test]
    async fn foreign_tenant_cannot_load_account() {
        let store = InMemoryStore::new();
        let account = opened(&store, TenantId::new()).await;

        let mut session = store.begin().await.unwrap();
        let result = load_account(&mut session, TenantId::new(), account.id()).await;
        assert!(matches!(result, Err(DomainError::AccountNotFound(_))));
    }
}
