pub mod connection;
pub mod sql;
pub mod sqlite;
pub mod types;

pub use connection::establish_connection;
pub use sqlite::SqliteEngine;
pub use types::{
    AnalyticsEngine, BasicMeasure, DimensionValues, EngineOperation, EngineOutput,
    LeaderboardRequest, MetricsFilter, QueryError, RollupGrain, RollupInterval, Row, SortDirection,
    SortEntry, TimeSeriesRequest, TotalsRequest,
};
