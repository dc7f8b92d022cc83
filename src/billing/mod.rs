pub mod api;
pub mod catalog;
pub mod cycle;
pub mod error;
pub mod fanout;
pub mod gateway;
pub mod ingestor;
pub mod models;
pub mod proration;
pub mod receivables;
pub mod reconciliation;
pub mod reference;
pub mod scheduler;
pub mod service;
pub mod store;

pub use api::routes;
pub use catalog::PaymentMethodCatalog;
pub use cycle::{add_days, next_date, BillingCycle};
pub use error::{BillingError, ErrorKind, FanOutError, ParticipantFailure};
pub use fanout::{FanOutReport, FanOutSettings, PackageFanOutEngine};
pub use gateway::{
    GatewayClient, GatewayError, GatewayResource, HttpGatewayClient, HttpGatewayConfig,
    PaymentResource, ResourceKind, SubscriptionResource,
};
pub use ingestor::{ForceReconcileResult, GatewayEventIngestor, PollResult, PushAck};
pub use receivables::{MarkPaidRequest, ReceivableChainGenerator, Settlement};
pub use reconciliation::{ReconciliationEngine, ReconciliationOutcome};
pub use reference::ExternalReference;
pub use scheduler::{
    process_tick as run_billing_automation_tick, spawn as spawn_billing_scheduler,
    BillingSettings, TickReport,
};
pub use service::SubscriptionService;
pub use store::{EntityStore, LockMode};
