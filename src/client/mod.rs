//! Client-side functionality modules.

mod apistub;
mod balstub;

/// Client stub ID type.
pub type ClientId = u64;

pub use apistub::ClientApiStub;
pub use balstub::BalancerStub;
