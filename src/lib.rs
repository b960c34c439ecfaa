pub mod config;
pub mod driver;
pub mod error;

pub use config::{ClusterConfig, ClusterConfigBuilder};
pub use driver::protocol::{Consistency, QueryResults, Row};
pub use driver::{
    Authenticator, Cluster, ConnectionPolicy, DriverEvent, DriverEventListener, ExecuteOptions,
    LeastBusyPolicy, PlainTextAuthenticator, RoundRobinPolicy, Session, TracingEventListener,
};
pub use error::{DriverError, DriverResult};
