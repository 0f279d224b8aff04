//! Built-in DIMSE service handlers

mod echo;
mod find;
mod store;

pub use echo::EchoHandler;
pub use find::FindHandler;
pub use store::StoreHandler;
