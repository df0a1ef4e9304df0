// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # Dataset marshaller
//!
//! Schema-driven serialisation of application datasets to and from network
//! byte order. Schemas come from the external configuration collaborator
//! and are registered per dataset id; a ComID-to-dataset mapping selects
//! the schema for each telegram.
//!
//! The registry is concurrent: the engines resolve schemas on the process
//! thread while the host registers configuration from its own thread.

/// Schema model (type codes, elements, datasets).
pub mod schema;
mod walk;

pub use schema::{Dataset, Element, ElementType, TypeCode};
pub use walk::MAX_NESTING;

use dashmap::DashMap;
use std::sync::Arc;

use crate::api::{Error, Result};

/// Dataset registry plus ComID mapping.
#[derive(Default)]
pub struct MarshalConfig {
    datasets: DashMap<u32, Arc<Dataset>>,
    com_map: DashMap<u32, u32>,
}

impl MarshalConfig {
    /// Empty registry.
    pub fn new() -> Self {
        MarshalConfig::default()
    }

    /// Register a dataset schema. Re-registering an id replaces the schema
    /// (the configuration collaborator reloads on inauguration).
    pub fn add_dataset(&self, ds: Dataset) -> Result<()> {
        ds.validate()?;
        self.datasets.insert(ds.id, Arc::new(ds));
        Ok(())
    }

    /// Bind `com_id` to a registered dataset.
    pub fn map_com_id(&self, com_id: u32, dataset_id: u32) -> Result<()> {
        if !self.datasets.contains_key(&dataset_id) {
            return Err(Error::Param(format!("unknown dataset {}", dataset_id)));
        }
        self.com_map.insert(com_id, dataset_id);
        Ok(())
    }

    /// Look up a dataset schema by id.
    pub fn dataset(&self, id: u32) -> Option<Arc<Dataset>> {
        self.datasets.get(&id).map(|e| Arc::clone(e.value()))
    }

    /// Look up the schema bound to `com_id`.
    pub fn dataset_for_com(&self, com_id: u32) -> Option<Arc<Dataset>> {
        let id = *self.com_map.get(&com_id)?.value();
        self.dataset(id)
    }

    /// True when a schema is bound to `com_id`.
    pub fn has_com_id(&self, com_id: u32) -> bool {
        self.com_map.contains_key(&com_id)
    }

    /// Marshal a host-layout dataset into wire bytes.
    ///
    /// Fails with `ComId` when no schema is bound to `com_id`.
    pub fn marshal(&self, com_id: u32, host: &[u8]) -> Result<Vec<u8>> {
        let ds = self.dataset_for_com(com_id).ok_or(Error::ComId)?;
        walk::marshal_with(self, &ds, host)
    }

    /// Unmarshal wire bytes into a freshly allocated host-layout buffer.
    pub fn unmarshal(&self, com_id: u32, wire: &[u8]) -> Result<Vec<u8>> {
        let ds = self.dataset_for_com(com_id).ok_or(Error::ComId)?;
        walk::unmarshal_with(self, &ds, wire, None)
    }

    /// Unmarshal into a caller-supplied buffer; fails with `Mem` when the
    /// destination would overflow. Returns the host-layout length.
    pub fn unmarshal_into(&self, com_id: u32, wire: &[u8], dst: &mut [u8]) -> Result<usize> {
        let ds = self.dataset_for_com(com_id).ok_or(Error::ComId)?;
        let host = walk::unmarshal_with(self, &ds, wire, Some(dst.len()))?;
        dst[..host.len()].copy_from_slice(&host);
        Ok(host.len())
    }
}
