//! Pix payment saga for the banking core.
//!
//! A Pix payment cannot commit together with the external rail, so it runs
//! as a saga with durable intermediate states:
//! 1. Create the saga (no money moves)
//! 2. Lock the balance: debit the source account
//! 3. Settle with the gateway
//!
//! A gateway rejection fails the saga and refunds the debit. A timeout
//! leaves the saga balance-locked for the reaper to retry.

pub mod commands;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod gateway;
pub mod reaper;
pub mod repository;
pub mod saga;
pub mod state;
pub mod subscriber;

pub use commands::SendPix;
pub use coordinator::{OrchestratorConfig, PixSagaOrchestrator};
pub use error::{Result, SagaError};
pub use events::PixSagaEvent;
pub use gateway::{
    GatewayBehavior, GatewayError, InMemorySettlementGateway, SettlementGateway,
    SettlementOutcome, SettlementRequest,
};
pub use reaper::{ReaperConfig, SagaReaper, SweepReport};
pub use saga::PixSaga;
pub use state::PixSagaStatus;
pub use subscriber::PixSagaSubscriber;
