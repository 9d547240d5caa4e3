//! Domain models for billing-service.

mod audit;
mod compliance;
mod item;
mod payment;
mod sale;
mod webhook;

pub use audit::AuditRecord;
pub use compliance::{EInvoiceSubmission, SubmissionStatus};
pub use item::{CreateItem, Item};
pub use payment::{
    CreatePaymentIntent, IntentStatus, PaymentIntent, PaymentTransaction, TransactionPatch,
};
pub use sale::{
    GstStatus, ListSalesFilter, NewSale, NewSaleLine, PaymentStatus, PeriodLock, Sale, SaleLine,
};
pub use webhook::{
    CreateWebhookRegistration, ListWebhookEventsFilter, RegistrationStatus,
    UpdateWebhookRegistration, WebhookEvent, WebhookEventStatus, WebhookRegistration,
};
