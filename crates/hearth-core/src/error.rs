use thiserror::Error;

use hearth_shared::error::{
    CryptoError, DeliveryError, FilterError, KeyError, LifecycleError, ScheduleError,
};
use hearth_store::StoreError;

#[derive(Error, Debug)]
pub enum HearthError {
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    #[error("Schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("Filter error: {0}")]
    Filter(#[from] FilterError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

pub type Result<T> = std::result::Result<T, HearthError>;
