//! Account command handlers.

use std::sync::Arc;

use common::{AccountId, CorrelationId};
use store::{LedgerEvent, Store};

use crate::account::Account;
use crate::commands::{
    AccountOpened, BalanceChanged, Credit, Debit, OpenAccount, Transfer, TransferReceipt,
};
use crate::error::{DomainError, Result};
use crate::events::AccountEvent;
use crate::idempotency::{self, CommandOutcome, LockOutcome};
use crate::ledger::{self, LedgerEntry, LedgerEventType};
use crate::money::Money;
use crate::outbox::{self, topics};
use crate::regulatory::{OperationType, RegulatoryPack, RegulatoryRegistry, TenantContext};
use crate::repository;

/// Service executing account commands.
///
/// Every command runs in one unit of work: begin, take the idempotency lock,
/// load, validate, mutate, conditionally save, append the ledger, stage the
/// outbox message, record the result, commit. Any failure aborts the session
/// so no partial state becomes visible.
pub struct AccountService<S: Store> {
    store: S,
    regulatory: RegulatoryRegistry,
}

impl<S: Store> AccountService<S> {
    /// Creates a new account service.
    pub fn new(store: S, regulatory: RegulatoryRegistry) -> Self {
        Self { store, regulatory }
    }

    /// Returns a reference to the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn regulatory(&self) -> &RegulatoryRegistry {
        &self.regulatory
    }

    /// Opens a new account for the caller's tenant.
    #[tracing::instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id))]
    pub async fn open_account(
        &self,
        ctx: &TenantContext,
        cmd: OpenAccount,
    ) -> Result<CommandOutcome<AccountOpened>> {
        pack_for(&self.regulatory, ctx)?;

        let mut session = self.store.begin().await?;
        let result = self.apply_open_account(&mut session, ctx, &cmd).await;
        idempotency::finish_command(
            &self.store,
            session,
            ctx.tenant_id,
            &cmd.command_id,
            OperationType::OpenAccount,
            result,
        )
        .await
    }

    /// Deposits money into an account.
    #[tracing::instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id))]
    pub async fn credit(
        &self,
        ctx: &TenantContext,
        cmd: Credit,
    ) -> Result<CommandOutcome<BalanceChanged>> {
        ensure_positive(&cmd.amount)?;

        let mut session = self.store.begin().await?;
        let result = self.apply_credit(&mut session, ctx, &cmd).await;
        idempotency::finish_command(
            &self.store,
            session,
            ctx.tenant_id,
            &cmd.command_id,
            OperationType::Credit,
            result,
        )
        .await
    }

    /// Withdraws money plus the jurisdiction's tax from an account.
    #[tracing::instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id))]
    pub async fn debit(
        &self,
        ctx: &TenantContext,
        cmd: Debit,
    ) -> Result<CommandOutcome<BalanceChanged>> {
        ensure_positive(&cmd.amount)?;

        let mut session = self.store.begin().await?;
        let result = self.apply_debit(&mut session, ctx, &cmd).await;
        idempotency::finish_command(
            &self.store,
            session,
            ctx.tenant_id,
            &cmd.command_id,
            OperationType::Debit,
            result,
        )
        .await
    }

    /// Moves money between two accounts of the caller's tenant.
    ///
    /// Both conditional writes happen in one session, lower account id first.
    #[tracing::instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id))]
    pub async fn transfer(
        &self,
        ctx: &TenantContext,
        cmd: Transfer,
    ) -> Result<CommandOutcome<TransferReceipt>> {
        ensure_positive(&cmd.amount)?;
        if cmd.from == cmd.to {
            return Err(DomainError::Validation(
                "cannot transfer to the same account".to_string(),
            ));
        }

        let mut session = self.store.begin().await?;
        let result = self.apply_transfer(&mut session, ctx, &cmd).await;
        idempotency::finish_command(
            &self.store,
            session,
            ctx.tenant_id,
            &cmd.command_id,
            OperationType::Transfer,
            result,
        )
        .await
    }

    /// Loads the committed state of an account.
    #[tracing::instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id))]
    pub async fn get_account(&self, ctx: &TenantContext, account_id: AccountId) -> Result<Account> {
        let doc = self
            .store
            .get_account(account_id)
            .await?
            .filter(|doc| doc.tenant_id == ctx.tenant_id)
            .ok_or(DomainError::AccountNotFound(account_id))?;
        Ok(Account::try_from(doc)?)
    }

    /// Returns the ledger history of an account, oldest first.
    #[tracing::instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id))]
    pub async fn statement(
        &self,
        ctx: &TenantContext,
        account_id: AccountId,
    ) -> Result<Vec<LedgerEvent>> {
        self.get_account(ctx, account_id).await?;
        Ok(self.store.ledger_for_account(account_id).await?)
    }

    /// Returns true when the cached balances equal the balances replayed
    /// from the ledger.
    #[tracing::instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id))]
    pub async fn reconcile(&self, ctx: &TenantContext, account_id: AccountId) -> Result<bool> {
        let account = self.get_account(ctx, account_id).await?;
        let events = self.store.ledger_for_account(account_id).await?;
        let replayed = ledger::replay_balances(&events)?;

        let matches = account.balances().count() == replayed.len()
            && account
                .balances()
                .all(|money| replayed.get(&money.currency()) == Some(money));
        if !matches {
            tracing::error!(%account_id, "cached balances diverge from the ledger");
        }
        Ok(matches)
    }

    async fn apply_open_account(
        &self,
        session: &mut S::Session,
        ctx: &TenantContext,
        cmd: &OpenAccount,
    ) -> Result<CommandOutcome<AccountOpened>> {
        let lock = idempotency::try_lock(
            session,
            ctx.tenant_id,
            &cmd.command_id,
            OperationType::OpenAccount,
        )
        .await?;
        if lock != LockOutcome::Acquired {
            return idempotency::replay(lock);
        }

        let mut account = Account::open(cmd.account_id, ctx.tenant_id);
        repository::insert_account(session, &mut account).await?;

        outbox::enqueue(
            session,
            ctx.tenant_id,
            topics::ACCOUNT_EVENTS,
            &AccountEvent::AccountOpened {
                account_id: account.id(),
            },
        )
        .await?;

        let receipt = AccountOpened {
            account_id: account.id(),
            version: account.version(),
        };
        idempotency::complete(session, ctx.tenant_id, &cmd.command_id, &receipt).await?;

        tracing::info!(account_id = %account.id(), "account opened");
        Ok(CommandOutcome::Executed(receipt))
    }

    async fn apply_credit(
        &self,
        session: &mut S::Session,
        ctx: &TenantContext,
        cmd: &Credit,
    ) -> Result<CommandOutcome<BalanceChanged>> {
        let lock = idempotency::try_lock(
            session,
            ctx.tenant_id,
            &cmd.command_id,
            OperationType::Credit,
        )
        .await?;
        if lock != LockOutcome::Acquired {
            return idempotency::replay(lock);
        }

        let pack = pack_for(&self.regulatory, ctx)?;
        let mut account = repository::load_account(session, ctx.tenant_id, cmd.account_id).await?;
        validate(pack.as_ref(), &account, &cmd.amount, OperationType::Credit)?;

        account.credit(&cmd.amount)?;
        repository::save_account(session, &mut account).await?;

        let correlation_id = CorrelationId::new();
        ledger::append(
            session,
            &account,
            LedgerEntry::new(LedgerEventType::Credit, cmd.amount, correlation_id)
                .metadata("command_id", cmd.command_id.as_str()),
        )
        .await?;

        let balance_after = account.balance_or_zero(cmd.amount.currency());
        outbox::enqueue(
            session,
            ctx.tenant_id,
            topics::ACCOUNT_EVENTS,
            &AccountEvent::BalanceCredited {
                account_id: account.id(),
                correlation_id,
                amount: cmd.amount,
                balance_after,
            },
        )
        .await?;

        let receipt = BalanceChanged {
            account_id: account.id(),
            correlation_id,
            amount: cmd.amount,
            tax: rust_decimal::Decimal::ZERO,
            balance_after,
            version: account.version(),
        };
        idempotency::complete(session, ctx.tenant_id, &cmd.command_id, &receipt).await?;

        tracing::info!(account_id = %account.id(), amount = %cmd.amount, "account credited");
        Ok(CommandOutcome::Executed(receipt))
    }

    async fn apply_debit(
        &self,
        session: &mut S::Session,
        ctx: &TenantContext,
        cmd: &Debit,
    ) -> Result<CommandOutcome<BalanceChanged>> {
        let lock = idempotency::try_lock(
            session,
            ctx.tenant_id,
            &cmd.command_id,
            OperationType::Debit,
        )
        .await?;
        if lock != LockOutcome::Acquired {
            return idempotency::replay(lock);
        }

        let pack = pack_for(&self.regulatory, ctx)?;
        let mut account = repository::load_account(session, ctx.tenant_id, cmd.account_id).await?;
        validate(pack.as_ref(), &account, &cmd.amount, OperationType::Debit)?;

        let tax = pack.calculate_tax(&cmd.amount, OperationType::Debit)?;
        let total = cmd
            .amount
            .add(&Money::of(tax, cmd.amount.currency()))?;

        account.debit(&total)?;
        repository::save_account(session, &mut account).await?;

        let correlation_id = CorrelationId::new();
        ledger::append(
            session,
            &account,
            LedgerEntry::new(LedgerEventType::Debit, total, correlation_id)
                .metadata("tax", tax.to_string())
                .metadata("command_id", cmd.command_id.as_str()),
        )
        .await?;

        let balance_after = account.balance_or_zero(total.currency());
        outbox::enqueue(
            session,
            ctx.tenant_id,
            topics::ACCOUNT_EVENTS,
            &AccountEvent::BalanceDebited {
                account_id: account.id(),
                correlation_id,
                amount: total,
                tax,
                balance_after,
            },
        )
        .await?;

        let receipt = BalanceChanged {
            account_id: account.id(),
            correlation_id,
            amount: total,
            tax,
            balance_after,
            version: account.version(),
        };
        idempotency::complete(session, ctx.tenant_id, &cmd.command_id, &receipt).await?;

        tracing::info!(account_id = %account.id(), amount = %total, "account debited");
        Ok(CommandOutcome::Executed(receipt))
    }

    async fn apply_transfer(
        &self,
        session: &mut S::Session,
        ctx: &TenantContext,
        cmd: &Transfer,
    ) -> Result<CommandOutcome<TransferReceipt>> {
        let lock = idempotency::try_lock(
            session,
            ctx.tenant_id,
            &cmd.command_id,
            OperationType::Transfer,
        )
        .await?;
        if lock != LockOutcome::Acquired {
            return idempotency::replay(lock);
        }

        let pack = pack_for(&self.regulatory, ctx)?;

        // Touch the lower account id first.
        let (first_id, second_id) = if cmd.from < cmd.to {
            (cmd.from, cmd.to)
        } else {
            (cmd.to, cmd.from)
        };
        let mut first = repository::load_account(session, ctx.tenant_id, first_id).await?;
        let mut second = repository::load_account(session, ctx.tenant_id, second_id).await?;

        {
            let (from, to) = if first_id == cmd.from {
                (&mut first, &mut second)
            } else {
                (&mut second, &mut first)
            };
            validate(pack.as_ref(), from, &cmd.amount, OperationType::Transfer)?;
            from.debit(&cmd.amount)?;
            to.credit(&cmd.amount)?;
        }

        repository::save_account(session, &mut first).await?;
        repository::save_account(session, &mut second).await?;

        let (from, to) = if first_id == cmd.from {
            (&first, &second)
        } else {
            (&second, &first)
        };

        let correlation_id = CorrelationId::new();
        ledger::append(
            session,
            from,
            LedgerEntry::new(LedgerEventType::TransferSent, cmd.amount, correlation_id)
                .metadata("counterparty", to.id().to_string())
                .metadata("command_id", cmd.command_id.as_str()),
        )
        .await?;
        ledger::append(
            session,
            to,
            LedgerEntry::new(LedgerEventType::TransferReceived, cmd.amount, correlation_id)
                .metadata("counterparty", from.id().to_string())
                .metadata("command_id", cmd.command_id.as_str()),
        )
        .await?;

        outbox::enqueue(
            session,
            ctx.tenant_id,
            topics::ACCOUNT_EVENTS,
            &AccountEvent::TransferCompleted {
                correlation_id,
                from: from.id(),
                to: to.id(),
                amount: cmd.amount,
            },
        )
        .await?;

        let receipt = TransferReceipt {
            correlation_id,
            from: from.id(),
            to: to.id(),
            amount: cmd.amount,
            from_balance_after: from.balance_or_zero(cmd.amount.currency()),
            to_balance_after: to.balance_or_zero(cmd.amount.currency()),
        };
        idempotency::complete(session, ctx.tenant_id, &cmd.command_id, &receipt).await?;

        tracing::info!(from = %from.id(), to = %to.id(), amount = %cmd.amount, "transfer completed");
        Ok(CommandOutcome::Executed(receipt))
    }
}

/// Resolves the regulatory pack of the caller's jurisdiction.
pub fn pack_for(
    registry: &RegulatoryRegistry,
    ctx: &TenantContext,
) -> Result<Arc<dyn RegulatoryPack>> {
    registry
        .get(ctx.jurisdiction)
        .ok_or_else(|| DomainError::RegulatoryRejection {
            reason: format!("no regulatory pack for jurisdiction {}", ctx.jurisdiction),
        })
}

/// Runs the pack's validation, mapping a refusal to a domain error.
pub fn validate(
    pack: &dyn RegulatoryPack,
    account: &Account,
    amount: &Money,
    operation: OperationType,
) -> Result<()> {
    pack.validate_transaction(account, amount, operation)
        .map_err(|reason| {
            tracing::warn!(account_id = %account.id(), %operation, %reason, "regulatory rejection");
            DomainError::RegulatoryRejection { reason }
        })
}

/// Rejects zero, negative and over-precise amounts before any state is
/// touched.
pub fn ensure_positive(amount: &Money) -> Result<()> {
    if !amount.is_positive() {
        return Err(DomainError::Validation(format!(
            "amount must be positive, got {amount}"
        )));
    }
    amount.ensure_precision()?;
    Ok(())
}
