pub mod ledger;
pub mod receipts;

pub use ledger::{InitReport, PendingFetch, UnreadLedger, UnreadMap};
pub use receipts::{DeliveryStatus, ReadReceipts};
