pub mod models;

pub use models::AppConfig;
