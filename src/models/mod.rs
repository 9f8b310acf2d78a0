mod payment_method;
mod plan;
mod provider;
mod subscription;
mod transaction;
mod user;

pub use payment_method::*;
pub use plan::*;
pub use provider::*;
pub use subscription::*;
pub use transaction::*;
pub use user::*;
