//! Payment integration module
//!
//! STK push initiation, the provider callback, and status reconciliation for
//! M-Pesa donations.

pub mod callback;
pub mod providers;
pub mod reconciler;
pub mod service;
pub mod traits;
pub mod types;

pub use callback::{CallbackAck, CallbackDelivery, CallbackGuard, CallbackReceiver};
pub use reconciler::{PendingSweeper, StatusReconciler, StatusReport, StatusSource, SweeperConfig};
pub use service::PaymentService;
pub use traits::PaymentProvider;
