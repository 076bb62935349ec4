//! Data store ownership module.
//!
//! Passive module owning the runtime [`DataStore`], wiring its event
//! bus dependency and publishing it as the `datastore` service.

use std::sync::Arc;

use anyhow::Result;
use log::info;

use crate::core::config::ConfigStore;
use crate::core::data::DataStore;
use crate::core::module::Module;
use crate::core::services::{Service, ServiceRegistry};

pub struct DataStoreModule {
    store: Arc<DataStore>,
}

impl DataStoreModule {
    pub fn new() -> Self {
        Self {
            store: Arc::new(DataStore::new()),
        }
    }

    pub fn store(&self) -> Arc<DataStore> {
        self.store.clone()
    }
}

impl Default for DataStoreModule {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for DataStoreModule {
    fn id(&self) -> &'static str {
        "datastore"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["loghub", "eventbus"]
    }

    fn init(&mut self, _cfg: &Arc<ConfigStore>, services: &mut ServiceRegistry) -> Result<()> {
        if let Some(bus) = services.event_bus("eventbus") {
            self.store.set_event_bus(bus);
        }
        services.add("datastore", Service::Data(self.store.clone()));
        info!("DataStore service registered");
        Ok(())
    }

    fn run_once(&mut self) {}

    fn has_task(&self) -> bool {
        false
    }
}
