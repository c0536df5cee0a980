//! BLE adapter initialization

use btleplug::api::Manager as _;
use btleplug::platform::{Adapter, Manager};
use tracing::info;

use crate::error::{BleError, Result};

/// Pick the adapter at `index` from the platform manager
pub async fn init_adapter(index: usize) -> Result<Adapter> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;

    if adapters.is_empty() {
        return Err(BleError::AdapterNotAvailable);
    }
    let available = adapters.len();
    let adapter = adapters
        .into_iter()
        .nth(index)
        .ok_or(BleError::AdapterIndexOutOfRange { index, available })?;

    info!("BLE adapter {} of {} initialized", index, available);
    Ok(adapter)
}
