//! Marketplace core: development requests, competing proposals, escrowed
//! selection, product verification and per-seller settlement.
//!
//! Every component is generic over a [`MarketStorage`] backend and keeps no
//! in-process locks: exclusivity (one accepted proposal per request, one
//! claimant per verification, one settlement per seller period) holds through
//! version-guarded updates and storage constraints alone.

pub mod auth;
pub mod clock;
pub mod config;
pub mod error;
pub mod fees;
pub mod notify;
pub mod payments;
pub mod payout;
pub mod proposals;
pub mod requests;
pub mod selection;
pub mod settlement;
mod txn;
pub mod verification;

use std::sync::Arc;

use bazaar_storage::MarketStorage;

pub use auth::{Caller, Role};
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{MarketConfig, RetryPolicy, VerificationPrices};
pub use error::{BusinessRuleKind, ConflictKind, MarketError, Result};
pub use notify::{NoopNotifier, NotificationEvent, Notifier, OutboxNotifier};
pub use payments::{PaymentCapture, ProductSale};
pub use payout::{
    PayoutDispatcher, PayoutError, PayoutProvider, TransferInstruction, TransferReceipt,
};
pub use proposals::{NewProposal, ProposalPatch, ProposalStore};
pub use requests::{NewRequest, Paged, RequestPatch, RequestStore};
pub use selection::{Selection, SelectionCoordinator};
pub use settlement::{RunAllReport, SettlementCalculator, SettlementRun};
pub use verification::{Review, VerificationWorkflowEngine, VerifierStats};

/// Shared handles every component works through.
pub struct Context<S> {
    pub(crate) storage: Arc<S>,
    pub(crate) config: Arc<MarketConfig>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) notifier: Arc<dyn Notifier>,
}

impl<S> Clone for Context<S> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            config: self.config.clone(),
            clock: self.clock.clone(),
            notifier: self.notifier.clone(),
        }
    }
}

/// Entry point wiring one storage backend, configuration, clock and
/// notifier into the marketplace components.
pub struct Marketplace<S> {
    ctx: Context<S>,
}

impl<S> Clone for Marketplace<S> {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
        }
    }
}

impl<S: MarketStorage> Marketplace<S> {
    pub fn new(storage: Arc<S>, config: MarketConfig) -> Self {
        Self {
            ctx: Context {
                storage,
                config: Arc::new(config),
                clock: Arc::new(SystemClock),
                notifier: Arc::new(NoopNotifier),
            },
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.ctx.clock = clock;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.ctx.notifier = notifier;
        self
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.ctx.storage
    }

    pub fn config(&self) -> &MarketConfig {
        &self.ctx.config
    }

    pub fn requests(&self) -> RequestStore<S> {
        RequestStore::new(self.ctx.clone())
    }

    pub fn proposals(&self) -> ProposalStore<S> {
        ProposalStore::new(self.ctx.clone())
    }

    pub fn selection(&self) -> SelectionCoordinator<S> {
        SelectionCoordinator::new(self.ctx.clone())
    }

    pub fn payments(&self) -> PaymentCapture<S> {
        PaymentCapture::new(self.ctx.clone())
    }

    pub fn verification(&self) -> VerificationWorkflowEngine<S> {
        VerificationWorkflowEngine::new(self.ctx.clone())
    }

    pub fn settlement(&self) -> SettlementCalculator<S> {
        SettlementCalculator::new(self.ctx.clone())
    }

    pub fn payouts(&self, provider: Arc<dyn PayoutProvider>) -> PayoutDispatcher<S> {
        PayoutDispatcher::new(self.ctx.clone(), provider)
    }
}
