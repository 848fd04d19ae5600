//! Background services

pub mod refresh;

pub use refresh::{PoolRefresher, RefreshConfig, RefresherHandle};
