pub mod client;
pub mod iot_repo;
pub mod registry;
pub mod user_repo;

pub use client::PostgresClient;
pub use iot_repo::PgIotRepository;
pub use registry::PostgresRegistry;
pub use user_repo::PgUserRepository;
