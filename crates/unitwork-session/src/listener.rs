//! Load event hooks.

use std::fmt;

use unitwork_core::{InstanceId, PropertyValue, Result, Value};

/// Fired after an entity's associations are resolved and before its state
/// is copied onto the instance.
#[derive(Debug, Clone, Copy)]
pub struct PreLoadEvent<'a> {
    pub instance: InstanceId,
    pub entity_name: &'a str,
    pub id: &'a Value,
    pub state: &'a [PropertyValue],
}

/// Fired once an entity is fully materialized.
#[derive(Debug, Clone, Copy)]
pub struct PostLoadEvent<'a> {
    pub instance: InstanceId,
    pub entity_name: &'a str,
    pub id: &'a Value,
    pub read_only: bool,
}

/// Observer of two-phase load. An error aborts the load.
pub trait LoadEventListener: fmt::Debug + Send + Sync {
    fn on_pre_load(&self, event: &PreLoadEvent<'_>) -> Result<()> {
        let _ = event;
        Ok(())
    }

    fn on_post_load(&self, event: &PostLoadEvent<'_>) -> Result<()> {
        let _ = event;
        Ok(())
    }
}
