pub mod entities;
pub mod ports;
pub mod snapshot;
pub mod types;
pub mod views;

pub use dispatchd_errors::{DispatchError, DispatchResult};
pub use entities::*;
pub use ports::*;
pub use snapshot::*;
pub use types::*;
pub use views::*;
