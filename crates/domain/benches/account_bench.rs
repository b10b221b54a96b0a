use common::{AccountId, CommandId, TenantId};
use criterion::{Criterion, criterion_group, criterion_main};
use domain::{
    AccountService, Credit, CurrencyCode, Debit, Jurisdiction, LedgerEntry, LedgerEventType,
    Money, OpenAccount, RegulatoryRegistry, TenantContext, Transfer, replay_balances,
};
use rust_decimal::Decimal;
use store::InMemoryStore;

fn brl(amount: i64) -> Money {
    Money::of(Decimal::from(amount), CurrencyCode::BRL)
}

fn ctx() -> TenantContext {
    TenantContext::new(TenantId::new(), Jurisdiction::Brazil)
}

async fn funded(service: &AccountService<InMemoryStore>, ctx: &TenantContext) -> AccountId {
    let account_id = service
        .open_account(ctx, OpenAccount::new(CommandId::random()))
        .await
        .unwrap()
        .into_value()
        .unwrap()
        .account_id;
    service
        .credit(
            ctx,
            Credit::new(CommandId::random(), account_id, brl(1_000_000_000)),
        )
        .await
        .unwrap();
    account_id
}

fn bench_open_account(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("account/open", |b| {
        b.iter(|| {
            rt.block_on(async {
                let service =
                    AccountService::new(InMemoryStore::new(), RegulatoryRegistry::with_defaults());
                service
                    .open_account(&ctx(), OpenAccount::new(CommandId::random()))
                    .await
                    .unwrap();
            });
        });
    });
}

fn bench_debit(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let service = AccountService::new(InMemoryStore::new(), RegulatoryRegistry::with_defaults());
    let ctx = ctx();
    let account_id = rt.block_on(funded(&service, &ctx));

    c.bench_function("account/debit", |b| {
        b.iter(|| {
            rt.block_on(async {
                service
                    .debit(&ctx, Debit::new(CommandId::random(), account_id, brl(1)))
                    .await
                    .unwrap();
            });
        });
    });
}

fn bench_duplicate_debit(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let service = AccountService::new(InMemoryStore::new(), RegulatoryRegistry::with_defaults());
    let ctx = ctx();
    let account_id = rt.block_on(funded(&service, &ctx));
    rt.block_on(async {
        service
            .debit(&ctx, Debit::new("bench-dup", account_id, brl(1)))
            .await
            .unwrap()
    });

    c.bench_function("account/debit_replayed", |b| {
        b.iter(|| {
            rt.block_on(async {
                service
                    .debit(&ctx, Debit::new("bench-dup", account_id, brl(1)))
                    .await
                    .unwrap();
            });
        });
    });
}

fn bench_transfer(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let service = AccountService::new(InMemoryStore::new(), RegulatoryRegistry::with_defaults());
    let ctx = ctx();
    let (x, y) = rt.block_on(async { (funded(&service, &ctx).await, funded(&service, &ctx).await) });

    c.bench_function("account/transfer", |b| {
        b.iter(|| {
            rt.block_on(async {
                service
                    .transfer(&ctx, Transfer::new(CommandId::random(), x, y, brl(1)))
                    .await
                    .unwrap();
            });
        });
    });
}

fn bench_replay_ledger(c: &mut Criterion) {
    let mut account = domain::Account::open(AccountId::new(), TenantId::new());
    let correlation_id = common::CorrelationId::new();
    let mut events = Vec::with_capacity(100);
    for i in 1..=100 {
        account.credit(&brl(i)).unwrap();
        events.push(LedgerEntry::new(LedgerEventType::Credit, brl(i), correlation_id).build(&account));
    }

    c.bench_function("account/replay_100_ledger_events", |b| {
        b.iter(|| replay_balances(&events).unwrap());
    });
}

criterion_group!(
    benches,
    bench_open_account,
    bench_debit,
    bench_duplicate_debit,
    bench_transfer,
    bench_replay_ledger,
);
criterion_main!(benches);
