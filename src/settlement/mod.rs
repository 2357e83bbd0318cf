pub mod machine;
pub mod reconciler;
pub mod service;

pub use reconciler::{ReconcilerConfig, SettlementReconciler};
pub use service::SettlementService;
