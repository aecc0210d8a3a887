//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::sync::Arc;

use dal::{ContextFactory, MemoryStore, Record, StorageContext};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub customer: String,
    pub total_cents: u64,
}

impl Order {
    pub fn new(id: &str, customer: &str, total_cents: u64) -> Self {
        Self {
            id: id.to_string(),
            customer: customer.to_string(),
            total_cents,
        }
    }
}

impl Record for Order {
    const TAG: &'static str = "order";

    fn key(&self) -> String {
        self.id.clone()
    }
}

/// Fresh memory store and a lazy context over it
pub fn memory_context(store: &str) -> (Arc<MemoryStore>, StorageContext) {
    MemoryStore::forget(store);
    let handle = MemoryStore::named(store);
    let context = ContextFactory::create("memory", &format!("memory:{store}"), None)
        .expect("memory descriptor is valid");
    (handle, context)
}
