//! Saga persistence. Same conditional-write protocol as accounts.

use common::SagaId;
use domain::DomainError;
use store::{Session, Version};

use crate::error::{Result, SagaError};
use crate::saga::PixSaga;

/// Loads a saga through `session`.
pub async fn load<S: Session>(session: &mut S, id: SagaId) -> Result<PixSaga> {
    let record = session
        .load_saga(id)
        .await?
        .ok_or(SagaError::SagaNotFound(id))?;
    PixSaga::try_from(record)
}

/// Persists a new saga at [`Version::first`].
pub async fn insert<S: Session>(session: &mut S, saga: &mut PixSaga) -> store::Result<()> {
    let version = Version::first();
    session.insert_saga(&saga.to_record(version)).await?;
    saga.set_version(version);
    Ok(())
}

/// Conditionally writes `saga` back, bumping its version by one.
///
/// A concurrent writer that committed first makes this fail with a
/// concurrency conflict; the caller must roll back.
pub async fn save<S: Session>(session: &mut S, saga: &mut PixSaga) -> Result<()> {
    let expected = saga.version();
    let next = expected.next();

    let modified = session.update_saga(&saga.to_record(next), expected).await?;
    if modified == 0 {
        tracing::warn!(saga_id = %saga.id(), %expected, "stale saga version");
        return Err(DomainError::ConcurrencyConflict {
            entity: "saga",
            id: saga.id().to_string(),
        }
        .into());
    }

    saga.set_version(next);
    Ok(())
}

#[cfg(test)]
mod tests {
    use common::{AccountId, TenantId};
    use domain::{CurrencyCode, Money};
    use rust_decimal::Decimal;
    use store::{InMemoryStore, Store};

    use super::*;

    fn new_saga() -> PixSaga {
        PixSaga::new(
            TenantId::new(),
            AccountId::new(),
            Money::of(Decimal::from(20), CurrencyCode::BRL),
            Decimal::ZERO,
            "bob@example.com",
        )
    }

    #[tokio::test]
    async fn stale_write_is_a_conflict() {
        let store = InMemoryStore::new();
        let mut saga = new_saga();
        let mut session = store.begin().await.unwrap();
        insert(&mut session, &mut saga).await.unwrap();
        session.commit().await.unwrap();

        let mut first = store.begin().await.unwrap();
        let mut second = store.begin().await.unwrap();
        let mut a = load(&mut first, saga.id()).await.unwrap();
        let mut b = load(&mut second, saga.id()).await.unwrap();

        a.lock_funds().unwrap();
        save(&mut first, &mut a).await.unwrap();
        first.commit().await.unwrap();

        b.fail("racing").unwrap();
        let err = save(&mut second, &mut b).await.unwrap_err();
        assert!(err.is_retryable());

        let stored = PixSaga::try_from(store.get_saga(saga.id()).await.unwrap().unwrap()).unwrap();
        assert_eq!(stored.status(), crate::PixSagaStatus::BalanceLocked);
        assert_eq!(stored.version(), Version::new(2));
    }

    #[tokio::test]
    async fn missing_saga_is_not_found() {
        let store = InMemoryStore::new();
        let mut session = store.begin().await.unwrap();
        let id = SagaId::new();
        assert!(matches!(
            load(&mut session, id).await,
            Err(SagaError::SagaNotFound(missing)) if missing == id
        ));
    }
}
