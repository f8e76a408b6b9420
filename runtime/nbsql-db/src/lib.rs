//! Database plumbing for nbsql: profile records, the driver boundary, the
//! profile-keyed connection pool and cooperative cancellation.

pub mod cancel;
pub mod driver;
pub mod pool;
pub mod profile;

#[cfg(all(feature = "postgres", not(target_arch = "wasm32")))]
pub mod postgres;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use cancel::{CancelReason, CancelToken, Deadline};
pub use driver::{BackendPid, Cell, Column, DriverError, QueryOutput, SqlConnection, SqlDriver};
pub use pool::{
    CloseFailure, CloseReport, ConnectionPool, Lease, PoolConfig, PoolError, PoolStats,
    ProfilePoolStats,
};
pub use profile::{
    ConnectionProfile, CredentialSource, EnvCredentials, Environment, MemoryProfileStore,
    ProfileId, ProfileLoadError, ProfileStore, SafetyProfile,
};

#[cfg(all(feature = "postgres", not(target_arch = "wasm32")))]
pub use postgres::{PgDriver, PgDriverConfig};
