//! Process-wide broker handle.
//!
//! Prefer passing an `Arc<Broker>` to the components that need it. This
//! registry exists for call sites that cannot be threaded through, such as
//! CRUD hooks registered before the service wiring is known. It is empty
//! until [`install`] is called and can be cleared with [`reset`] in tests.

use crate::broker::Broker;
use crate::error::{BrokerError, BrokerResult};
use std::sync::{Arc, RwLock};

static DEFAULT_BROKER: RwLock<Option<Arc<Broker>>> = RwLock::new(None);

/// Install the process-wide broker. Fails if one is already installed.
pub fn install(broker: Arc<Broker>) -> BrokerResult<()> {
    let mut slot = DEFAULT_BROKER
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if slot.is_some() {
        return Err(BrokerError::ConfigError(
            "a default broker is already installed".into(),
        ));
    }
    *slot = Some(broker);
    Ok(())
}

/// The installed broker, if any.
pub fn get() -> Option<Arc<Broker>> {
    DEFAULT_BROKER
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
}

/// Remove and return the installed broker.
pub fn reset() -> Option<Arc<Broker>> {
    DEFAULT_BROKER
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .take()
}
