//! Master-detail relations and query generation tracking

pub mod coordinator;
pub mod query_manager;

pub use coordinator::{BlockCoordinator, Link};
pub use query_manager::QueryManager;
