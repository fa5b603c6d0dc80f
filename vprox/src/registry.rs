//! The process-wide `container_id -> VmSession` map.
//!
//! This is the sole serialisation point preventing two concurrent
//! `hello`s for the same container id from racing each other; once a
//! [`crate::vm::VmSession`] is inserted, the registry's own mutex is
//! never held while doing I/O on it.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::vm::VmSession;

#[derive(Debug, PartialEq, Eq)]
pub enum RegistryError {
    AlreadyRegistered(String),
    NotFound(String),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::AlreadyRegistered(id) => write!(f, "{}: container already registered", id),
            Self::NotFound(id) => write!(f, "{}: no such container", id),
        }
    }
}

impl std::error::Error for RegistryError {}

#[derive(Default)]
pub struct VmRegistry {
    inner: Mutex<HashMap<String, Arc<VmSession>>>,
}

impl VmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `vm` under `vm.container_id`, failing if the id is
    /// already taken. This is the only operation in the registry that
    /// needs to observe-and-mutate atomically.
    pub fn insert_new_or_fail(&self, vm: Arc<VmSession>) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.contains_key(&vm.container_id) {
            return Err(RegistryError::AlreadyRegistered(vm.container_id.clone()));
        }
        inner.insert(vm.container_id.clone(), vm);
        Ok(())
    }

    pub fn get(&self, container_id: &str) -> Option<Arc<VmSession>> {
        self.inner.lock().unwrap().get(container_id).cloned()
    }

    /// Unpublish a container: new `attach`es will fail, but any handle
    /// already held by a client or a pump keeps the `VmSession` alive
    /// until it is dropped.
    pub fn remove(&self, container_id: &str) -> Option<Arc<VmSession>> {
        self.inner.lock().unwrap().remove(container_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every currently-registered session, for callers (daemon
    /// shutdown) that need to drive each one to completion rather than
    /// look one up by id.
    pub fn snapshot(&self) -> Vec<Arc<VmSession>> {
        self.inner.lock().unwrap().values().cloned().collect()
    }
}
