//! Credential access for nodes
//!
//! The engine never sees raw secrets. A collaborator store resolves an
//! alias to an opaque handle; nodes hand that handle to their integration
//! layer, which knows the concrete shape.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{EngineError, Result};

/// Opaque reference to resolved credential material
#[derive(Clone)]
pub struct CredentialHandle {
    alias: String,
    inner: Arc<dyn Any + Send + Sync>,
}

impl CredentialHandle {
    pub fn new(alias: impl Into<String>, inner: Arc<dyn Any + Send + Sync>) -> Self {
        Self {
            alias: alias.into(),
            inner,
        }
    }

    /// The alias this handle was looked up under
    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Downcast to the store's concrete credential type
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.inner).downcast::<T>().ok()
    }
}

impl std::fmt::Debug for CredentialHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The payload is deliberately not printable
        write!(f, "CredentialHandle({})", self.alias)
    }
}

/// Collaborator interface to a credential vault
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Resolve an alias to a handle
    async fn lookup(&self, alias: &str) -> Result<CredentialHandle>;
}

/// Store used when no vault is configured; every lookup fails
pub struct NullCredentialStore;

#[async_trait]
impl CredentialStore for NullCredentialStore {
    async fn lookup(&self, alias: &str) -> Result<CredentialHandle> {
        Err(EngineError::internal(format!(
            "no credential store configured (alias '{}')",
            alias
        )))
    }
}
