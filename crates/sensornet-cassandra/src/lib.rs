pub mod iot_repo;
pub mod registry;
pub mod session;
pub mod ts_deduper;

pub use iot_repo::CassIotRepository;
pub use registry::CassandraRegistry;
pub use session::{parse_consistency, CassandraSession};
pub use ts_deduper::TsDeduper;
