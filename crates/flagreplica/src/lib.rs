pub mod bus;
pub mod config;
pub mod db;
pub mod error;
pub mod evaluator;
pub mod eventlog;
pub mod model;
pub mod replica;
pub mod source;
pub mod transport;
pub mod worker;

pub use bus::{BusError, ChangeEventBus, Subscription};
pub use config::{load_config, Config, ReplicaMode};
pub use db::{Database, DatabaseError};
pub use error::{ConfigError, ReplicaError, Result};
pub use evaluator::{evaluate, Context};
pub use eventlog::{EventLog, EventLogError, Replicator, ReplicatorError};
pub use model::{
    ChangeEvent, ChangeKind, PartitionKey, ReplicatedVariant, ValidationError, VariantKey,
};
pub use replica::{LocalReplica, Replica, ReplicaSettings, ReplicaStore, ValueQuery};
pub use source::{DumpFilter, LazyPool, PgReplicaSource, PoolSettings, ReplicaSource, SourceError};
pub use transport::{
    ChangeNotificationTransport, Notification, PgNotifyConnector, TransportError,
    TransportSettings,
};
pub use worker::CoalescingReplicaWorker;
