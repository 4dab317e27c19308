use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rand::Rng;
use rand::distr::Alphanumeric;
use tracing::info;

use crate::collection::{Collection, CollectionHandlers};
use crate::config::{CollectionOptions, DatabaseOptions};
use crate::error::{Error, Result};
use crate::idle_queue::IdleQueue;
use crate::storage::{Storage, StorageInstanceParams};
use crate::storage_wrapper::WrappedStorage;

const TOKEN_LEN: usize = 10;

/// A named set of collections over one storage backend.
pub struct Database {
    options: DatabaseOptions,
    token: String,
    storage: Arc<dyn Storage>,
    idle: Arc<IdleQueue>,
    collections: RwLock<HashMap<String, Collection>>,
}

impl Database {
    pub fn create(storage: Arc<dyn Storage>, options: DatabaseOptions) -> Result<Self> {
        options.validate()?;
        let token: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(TOKEN_LEN)
            .map(char::from)
            .collect();
        info!(database = %options.name, storage = storage.name(), "database created");
        Ok(Self {
            options,
            token,
            storage,
            idle: IdleQueue::new(),
            collections: RwLock::new(HashMap::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    /// Random per-instance token stamped into every revision.
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn options(&self) -> &DatabaseOptions {
        &self.options
    }

    pub async fn add_collection(&self, name: &str, options: CollectionOptions) -> Result<Collection> {
        self.add_collection_with(name, options, CollectionHandlers::default()).await
    }

    pub async fn add_collection_with(
        &self,
        name: &str,
        options: CollectionOptions,
        handlers: CollectionHandlers,
    ) -> Result<Collection> {
        if self.collections.read().contains_key(name) {
            return Err(Error::CollectionAlreadyExists(name.to_string()));
        }
        let instance = self
            .storage
            .create_storage_instance(StorageInstanceParams {
                database_name: self.options.name.clone(),
                collection_name: name.to_string(),
                primary_path: options.primary_key.clone(),
                database_token: self.token.clone(),
                multi_instance: self.options.multi_instance,
                change_stream_capacity: self.options.change_stream_capacity,
            })
            .await?;
        let wrapped = Arc::new(WrappedStorage::new(
            instance,
            &self.token,
            Arc::clone(&self.idle),
            self.options.dev_mode,
        ));
        let collection = Collection::open(
            name,
            &options,
            wrapped,
            Arc::clone(&self.idle),
            self.options.event_reduce,
            self.options.event_buffer_size,
            handlers,
        );

        let mut collections = self.collections.write();
        if collections.contains_key(name) {
            return Err(Error::CollectionAlreadyExists(name.to_string()));
        }
        collections.insert(name.to_string(), collection.clone());
        Ok(collection)
    }

    pub fn collection(&self, name: &str) -> Result<Collection> {
        self.collections
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::CollectionNotFound(name.to_string()))
    }

    pub fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Resolves once no storage call of this database is in flight.
    pub async fn request_idle(&self) {
        self.idle.request_idle().await;
    }

    pub async fn close(&self) -> Result<()> {
        self.idle.request_idle().await;
        let collections: Vec<Collection> = self.collections.write().drain().map(|(_, c)| c).collect();
        for collection in &collections {
            collection.close().await?;
        }
        info!(database = %self.options.name, collections = collections.len(), "database closed");
        Ok(())
    }

    /// Close the database and delete the data of all its collections.
    pub async fn remove(&self) -> Result<()> {
        let collections: Vec<Collection> = self.collections.write().drain().map(|(_, c)| c).collect();
        for collection in collections {
            collection.remove_collection().await?;
        }
        info!(database = %self.options.name, "database removed");
        Ok(())
    }
}
