//! Integration tests for the account command path.
//!
//! These tests drive `AccountService` against the in-memory store and check
//! balances, ledger and outbox together.

use common::{AccountId, CommandId, TenantId};
use domain::{
    AccountEvent, AccountService, CommandOutcome, Credit, CurrencyCode, Debit, DomainError,
    Jurisdiction, Money, MoneyError, OpenAccount, RegulatoryRegistry, TenantContext, Transfer,
    repository, topics,
};
use rust_decimal::Decimal;
use store::{InMemoryStore, Session, Store, Version};

fn brl(amount: i64) -> Money {
    Money::of(Decimal::from(amount), CurrencyCode::BRL)
}

struct TestHarness {
    store: InMemoryStore,
    service: AccountService<InMemoryStore>,
    ctx: TenantContext,
}

impl TestHarness {
    fn new() -> Self {
        Self::with_store(InMemoryStore::new())
    }

    fn with_store(store: InMemoryStore) -> Self {
        Self {
            service: AccountService::new(store.clone(), RegulatoryRegistry::with_defaults()),
            store,
            ctx: TenantContext::new(TenantId::new(), Jurisdiction::Brazil),
        }
    }

    /// Opens an account and funds it with `balance` BRL.
    async fn funded_account(&self, balance: i64) -> AccountId {
        let account_id = self
            .service
            .open_account(&self.ctx, OpenAccount::new(CommandId::random()))
            .await
            .unwrap()
            .into_value()
            .unwrap()
            .account_id;
        if balance > 0 {
            self.service
                .credit(
                    &self.ctx,
                    Credit::new(CommandId::random(), account_id, brl(balance)),
                )
                .await
                .unwrap();
        }
        account_id
    }

    async fn balance(&self, account_id: AccountId) -> Money {
        self.service
            .get_account(&self.ctx, account_id)
            .await
            .unwrap()
            .balance_or_zero(CurrencyCode::BRL)
    }

    async fn version(&self, account_id: AccountId) -> Version {
        self.service
            .get_account(&self.ctx, account_id)
            .await
            .unwrap()
            .version()
    }

    async fn ledger_types(&self, account_id: AccountId) -> Vec<String> {
        self.service
            .statement(&self.ctx, account_id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect()
    }

    async fn account_events(&self) -> Vec<AccountEvent> {
        self.store
            .all_outbox()
            .await
            .into_iter()
            .filter(|m| m.topic == topics::ACCOUNT_EVENTS)
            .map(|m| serde_json::from_value(m.payload).unwrap())
            .collect()
    }
}

mod scenarios {
    use super::*;

    #[tokio::test]
    async fn debit_within_balance() {
        let h = TestHarness::new();
        let account_id = h.funded_account(100).await;
        let outbox_before = h.store.outbox_count().await;

        let receipt = h
            .service
            .debit(&h.ctx, Debit::new("debit-40", account_id, brl(40)))
            .await
            .unwrap();

        assert!(matches!(receipt, CommandOutcome::Executed(_)));
        assert_eq!(h.balance(account_id).await, brl(60));

        let statement = h.service.statement(&h.ctx, account_id).await.unwrap();
        let debits: Vec<_> = statement
            .iter()
            .filter(|e| e.event_type == "DEBIT")
            .collect();
        assert_eq!(debits.len(), 1);
        assert_eq!(debits[0].amount, Decimal::from(40));
        assert_eq!(debits[0].balance_after, Decimal::from(60));

        assert_eq!(h.store.outbox_count().await, outbox_before + 1);
        let last = h.store.all_outbox().await.pop().unwrap();
        assert_eq!(last.topic, "account-events");
        assert_eq!(last.payload["type"], "balance-debited");
    }

    #[tokio::test]
    async fn overdraft_changes_nothing() {
        let h = TestHarness::new();
        let account_id = h.funded_account(50).await;
        let outbox_before = h.store.outbox_count().await;
        let ledger_before = h.store.ledger_count().await;
        let version_before = h.version(account_id).await;

        let result = h
            .service
            .debit(&h.ctx, Debit::new("debit-100", account_id, brl(100)))
            .await;

        let err = result.unwrap_err();
        assert!(err.is_insufficient_funds());
        assert!(!err.is_retryable());
        assert_eq!(h.balance(account_id).await, brl(50));
        assert_eq!(h.version(account_id).await, version_before);
        assert_eq!(h.store.ledger_count().await, ledger_before);
        assert_eq!(h.store.outbox_count().await, outbox_before);
    }

    #[tokio::test]
    async fn amount_below_minor_unit_is_rejected() {
        let h = TestHarness::new();
        let account_id = h.funded_account(100).await;
        let outbox_before = h.store.outbox_count().await;

        let result = h
            .service
            .credit(
                &h.ctx,
                Credit::new(
                    "fraction",
                    account_id,
                    Money::of(Decimal::new(1, 3), CurrencyCode::BRL),
                ),
            )
            .await;

        assert!(matches!(
            result,
            Err(DomainError::Money(MoneyError::TooPrecise { .. }))
        ));
        assert_eq!(h.balance(account_id).await, brl(100));
        assert_eq!(h.store.outbox_count().await, outbox_before);
    }

    #[tokio::test]
    async fn concurrent_saves_on_same_version_conflict() {
        let h = TestHarness::new();
        let account_id = h.funded_account(50).await;
        // Opening writes version 1; the funding credit moves it to 2.
        let start = h.version(account_id).await;

        let mut first = h.store.begin().await.unwrap();
        let mut second = h.store.begin().await.unwrap();

        let mut a = repository::load_account(&mut first, h.ctx.tenant_id, account_id)
            .await
            .unwrap();
        let mut b = repository::load_account(&mut second, h.ctx.tenant_id, account_id)
            .await
            .unwrap();
        assert_eq!(a.version(), b.version());

        a.debit(&brl(30)).unwrap();
        b.debit(&brl(30)).unwrap();

        repository::save_account(&mut first, &mut a).await.unwrap();
        first.commit().await.unwrap();

        repository::save_account(&mut second, &mut b).await.unwrap_err();
        second.abort().await.unwrap();

        assert_eq!(h.balance(account_id).await, brl(20));
        assert_eq!(h.version(account_id).await, start.next());
    }

    #[tokio::test]
    async fn concurrent_debits_let_exactly_one_through() {
        let h = TestHarness::new();
        let account_id = h.funded_account(50).await;
        let start = h.version(account_id).await;

        let (r1, r2) = tokio::join!(
            h.service
                .debit(&h.ctx, Debit::new("debit-a", account_id, brl(30))),
            h.service
                .debit(&h.ctx, Debit::new("debit-b", account_id, brl(30))),
        );

        let (ok, failed): (Vec<_>, Vec<_>) = [r1, r2].into_iter().partition(|r| r.is_ok());
        assert_eq!(ok.len(), 1);
        assert_eq!(failed.len(), 1);
        let err = failed.into_iter().next().unwrap().unwrap_err();
        assert!(err.is_retryable() || err.is_insufficient_funds());

        assert_eq!(h.balance(account_id).await, brl(20));
        assert_eq!(h.version(account_id).await, start.next());
    }

    #[tokio::test]
    async fn duplicate_command_replays_first_result() {
        let h = TestHarness::new();
        let account_id = h.funded_account(100).await;
        let outbox_before = h.store.outbox_count().await;

        let first = h
            .service
            .debit(&h.ctx, Debit::new("debit-once", account_id, brl(40)))
            .await
            .unwrap();
        let second = h
            .service
            .debit(&h.ctx, Debit::new("debit-once", account_id, brl(40)))
            .await
            .unwrap();

        assert!(matches!(first, CommandOutcome::Executed(_)));
        assert!(second.is_replayed());
        assert_eq!(first.value(), second.value());

        assert_eq!(h.balance(account_id).await, brl(60));
        assert_eq!(
            h.ledger_types(account_id)
                .await
                .iter()
                .filter(|t| *t == "DEBIT")
                .count(),
            1
        );
        assert_eq!(h.store.outbox_count().await, outbox_before + 1);
    }
}

mod idempotency {
    use super::*;

    #[tokio::test]
    async fn concurrent_duplicates_execute_once() {
        let h = TestHarness::new();
        let account_id = h.funded_account(100).await;

        let (r1, r2) = tokio::join!(
            h.service
                .debit(&h.ctx, Debit::new("same-id", account_id, brl(40))),
            h.service
                .debit(&h.ctx, Debit::new("same-id", account_id, brl(40))),
        );
        let outcomes = [r1.unwrap(), r2.unwrap()];

        let executed = outcomes
            .iter()
            .filter(|o| matches!(o, CommandOutcome::Executed(_)))
            .count();
        assert_eq!(executed, 1);
        assert_eq!(h.balance(account_id).await, brl(60));
    }

    #[tokio::test]
    async fn failed_command_can_be_retried_with_same_id() {
        let h = TestHarness::new();
        let account_id = h.funded_account(10).await;

        let result = h
            .service
            .debit(&h.ctx, Debit::new("retry-me", account_id, brl(40)))
            .await;
        assert!(result.is_err());

        h.service
            .credit(&h.ctx, Credit::new("top-up", account_id, brl(50)))
            .await
            .unwrap();

        let retried = h
            .service
            .debit(&h.ctx, Debit::new("retry-me", account_id, brl(40)))
            .await
            .unwrap();
        assert!(matches!(retried, CommandOutcome::Executed(_)));
        assert_eq!(h.balance(account_id).await, brl(20));
    }

    #[tokio::test]
    async fn failed_command_can_be_retried_without_transactions() {
        let h = TestHarness::with_store(InMemoryStore::without_transactions());
        let account_id = h.funded_account(10).await;

        let result = h
            .service
            .debit(&h.ctx, Debit::new("retry-me", account_id, brl(40)))
            .await;
        assert!(result.unwrap_err().is_insufficient_funds());

        h.service
            .credit(&h.ctx, Credit::new("top-up", account_id, brl(50)))
            .await
            .unwrap();

        let retried = h
            .service
            .debit(&h.ctx, Debit::new("retry-me", account_id, brl(40)))
            .await
            .unwrap();
        assert!(matches!(retried, CommandOutcome::Executed(_)));
        assert_eq!(h.balance(account_id).await, brl(20));
    }

    #[tokio::test]
    async fn command_ids_are_scoped_to_the_tenant() {
        let h = TestHarness::new();
        let own = h.funded_account(100).await;
        h.service
            .credit(&h.ctx, Credit::new("deposit-1", own, brl(10)))
            .await
            .unwrap();

        let other = TenantContext::new(TenantId::new(), Jurisdiction::Brazil);
        let theirs = h
            .service
            .open_account(&other, OpenAccount::new("open-theirs"))
            .await
            .unwrap()
            .into_value()
            .unwrap()
            .account_id;
        let outcome = h
            .service
            .credit(&other, Credit::new("deposit-1", theirs, brl(25)))
            .await
            .unwrap();

        assert!(matches!(outcome, CommandOutcome::Executed(_)));
        let receipt = outcome.into_value().unwrap();
        assert_eq!(receipt.account_id, theirs);
        assert_eq!(receipt.balance_after, brl(25));
        assert_eq!(h.balance(own).await, brl(110));
    }

    #[tokio::test]
    async fn reusing_an_id_for_another_operation_is_rejected() {
        let h = TestHarness::new();
        let x = h.funded_account(100).await;
        let y = h.funded_account(0).await;
        h.service
            .debit(&h.ctx, Debit::new("op-1", x, brl(10)))
            .await
            .unwrap();
        let balance_after_debit = h.balance(x).await;

        let result = h
            .service
            .transfer(&h.ctx, Transfer::new("op-1", x, y, brl(10)))
            .await;

        assert!(matches!(
            result,
            Err(DomainError::CommandIdReused { ref recorded, requested: "TRANSFER", .. })
                if recorded == "DEBIT"
        ));
        assert_eq!(h.balance(x).await, balance_after_debit);
        assert_eq!(h.balance(y).await, brl(0));
    }

    #[tokio::test]
    async fn replayed_open_account_returns_same_account() {
        let h = TestHarness::new();
        let first = h
            .service
            .open_account(&h.ctx, OpenAccount::new("open-twice"))
            .await
            .unwrap();
        // A retry carries a fresh account id but must not open a second account.
        let second = h
            .service
            .open_account(&h.ctx, OpenAccount::new("open-twice"))
            .await
            .unwrap();

        assert!(second.is_replayed());
        assert_eq!(
            first.value().unwrap().account_id,
            second.value().unwrap().account_id
        );
        assert_eq!(h.store.outbox_count().await, 1);
    }
}

mod transfers {
    use super::*;

    #[tokio::test]
    async fn transfer_conserves_money() {
        let h = TestHarness::new();
        let x = h.funded_account(100).await;
        let y = h.funded_account(20).await;
        let before = h.balance(x).await.add(&h.balance(y).await).unwrap();

        let receipt = h
            .service
            .transfer(&h.ctx, Transfer::new("move-30", x, y, brl(30)))
            .await
            .unwrap()
            .into_value()
            .unwrap();

        assert_eq!(receipt.from_balance_after, brl(70));
        assert_eq!(receipt.to_balance_after, brl(50));
        let after = h.balance(x).await.add(&h.balance(y).await).unwrap();
        assert_eq!(before, after);

        let events = h
            .store
            .ledger_for_correlation(receipt.correlation_id)
            .await
            .unwrap();
        let mut types: Vec<_> = events.iter().map(|e| e.event_type.as_str()).collect();
        types.sort();
        assert_eq!(types, ["TRANSFER_RECEIVED", "TRANSFER_SENT"]);

        let transfers = h
            .account_events()
            .await
            .into_iter()
            .filter(|e| matches!(e, AccountEvent::TransferCompleted { .. }))
            .count();
        assert_eq!(transfers, 1);
    }

    #[tokio::test]
    async fn transfer_with_missing_counterparty_changes_nothing() {
        let h = TestHarness::new();
        let x = h.funded_account(100).await;
        let outbox_before = h.store.outbox_count().await;

        let result = h
            .service
            .transfer(&h.ctx, Transfer::new("ghost", x, AccountId::new(), brl(30)))
            .await;

        assert!(matches!(result, Err(DomainError::AccountNotFound(_))));
        assert_eq!(h.balance(x).await, brl(100));
        assert_eq!(h.store.outbox_count().await, outbox_before);
    }

    #[tokio::test]
    async fn transfer_to_self_is_invalid() {
        let h = TestHarness::new();
        let x = h.funded_account(100).await;
        let result = h
            .service
            .transfer(&h.ctx, Transfer::new("loop", x, x, brl(1)))
            .await;
        assert!(matches!(result, Err(DomainError::Validation(_))));
    }

    #[tokio::test]
    async fn accounts_of_other_tenants_are_invisible() {
        let h = TestHarness::new();
        let x = h.funded_account(100).await;
        let other = TenantContext::new(TenantId::new(), Jurisdiction::Brazil);

        let result = h
            .service
            .debit(&other, Debit::new("steal", x, brl(10)))
            .await;
        assert!(matches!(result, Err(DomainError::AccountNotFound(_))));
        assert_eq!(h.balance(x).await, brl(100));
    }
}

mod ledger {
    use super::*;

    #[tokio::test]
    async fn balances_are_reconstructible_from_ledger() {
        let h = TestHarness::new();
        let x = h.funded_account(100).await;
        let y = h.funded_account(0).await;

        h.service
            .debit(&h.ctx, Debit::new("d1", x, brl(15)))
            .await
            .unwrap();
        h.service
            .transfer(&h.ctx, Transfer::new("t1", x, y, brl(25)))
            .await
            .unwrap();

        assert!(h.service.reconcile(&h.ctx, x).await.unwrap());
        assert!(h.service.reconcile(&h.ctx, y).await.unwrap());
        assert_eq!(
            h.ledger_types(x).await,
            ["CREDIT", "DEBIT", "TRANSFER_SENT"]
        );
    }
}

mod degraded_mode {
    use super::*;

    #[tokio::test]
    async fn commands_still_work_without_transactions() {
        let h = TestHarness::with_store(InMemoryStore::without_transactions());
        assert!(!h.store.mode().is_atomic());

        let account_id = h.funded_account(100).await;
        h.service
            .debit(&h.ctx, Debit::new("degraded", account_id, brl(40)))
            .await
            .unwrap();

        assert_eq!(h.balance(account_id).await, brl(60));
        let session = h.store.begin().await.unwrap();
        assert!(!session.mode().is_atomic());
    }
}
