pub mod error;
pub mod reading;
pub mod repository;

pub use error::{DomainError, DomainResult};
pub use reading::*;
pub use repository::*;
