pub mod adapters;
pub mod api;
pub mod checkout;
pub mod events;
pub mod ledger;
pub mod models;
pub mod reconciliation;
pub mod state_machine;
pub mod usage;

pub use adapters::{GatewayError, PaymentGateway, StripeGateway};
pub use checkout::{CheckoutService, CheckoutSettings};
pub use events::{BillingEvent, BillingEventType, NewBillingEvent};
pub use models::{BillingCatalog, BillingState, PlanTier, SubscriptionStatus, UsageSnapshot};
pub use reconciliation::Reconciler;
pub use state_machine::{SubscriptionPatch, SubscriptionStateMachine, TransitionOutcome};
pub use usage::UsageMeter;
