pub mod data_replication;
pub mod history_cleanup;
pub mod http_request;

pub use data_replication::DataReplicationHandler;
pub use history_cleanup::HistoryCleanupHandler;
pub use http_request::HttpRequestHandler;
