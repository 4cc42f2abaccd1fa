pub mod engine;
pub mod flag;
pub mod http;
pub mod router;
pub mod socket;
pub mod store;
pub mod sync;
pub mod tabs;
