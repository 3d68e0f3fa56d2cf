pub mod receipts;
pub mod session_log;
pub mod summary;
