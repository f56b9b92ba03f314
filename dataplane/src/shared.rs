//! Shared ownership of one flow table by several pipeline modules
//!
//! Each handle counts as one attachment in the table's `ref_count`. The
//! table lives behind a mutex; a module takes the lock once per batch and
//! holds it for the whole run-to-completion step, so concurrent writers on
//! different workers are serialised rather than racing on slot words.

use crate::error::{DataplaneError, Result};
use crate::flowtable::FlowTable;
use log::{debug, warn};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

/// Attachment handle to a shared [`FlowTable`]
#[derive(Debug)]
pub struct SharedFlowTable {
    inner: Option<Arc<Mutex<FlowTable>>>,
}

impl SharedFlowTable {
    /// Wrap a freshly created table; the new handle is its first attachment
    pub fn new(table: FlowTable) -> Self {
        Self {
            inner: Some(Arc::new(Mutex::new(table))),
        }
    }

    /// Create a second attachment to the same table
    pub fn attach(&self) -> Result<SharedFlowTable> {
        let inner = self.arc()?;
        inner.lock().attach()?;
        Ok(Self {
            inner: Some(Arc::clone(inner)),
        })
    }

    /// Release this attachment
    ///
    /// # Returns
    ///
    /// `true` when this was the last attachment and the storage was freed
    pub fn detach(mut self) -> Result<bool> {
        self.release()
    }

    /// Lock the table for one batch
    pub fn lock(&self) -> Result<MutexGuard<'_, FlowTable>> {
        Ok(self.arc()?.lock())
    }

    /// Current attachment count
    pub fn ref_count(&self) -> u32 {
        self.inner
            .as_ref()
            .map(|inner| inner.lock().ref_count())
            .unwrap_or(0)
    }

    /// Whether two handles refer to the same table
    pub fn same_table(&self, other: &SharedFlowTable) -> bool {
        match (&self.inner, &other.inner) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    fn arc(&self) -> Result<&Arc<Mutex<FlowTable>>> {
        self.inner
            .as_ref()
            .ok_or_else(|| DataplaneError::invalid("flow table handle already detached"))
    }

    fn release(&mut self) -> Result<bool> {
        let inner = self
            .inner
            .take()
            .ok_or_else(|| DataplaneError::invalid("flow table handle already detached"))?;
        let released = inner.lock().detach()?;
        debug!("Flow table handle detached (released = {})", released);
        Ok(released)
    }
}

impl Drop for SharedFlowTable {
    fn drop(&mut self) {
        if self.inner.is_some() {
            if let Err(e) = self.release() {
                warn!("Failed to detach flow table: {}", e);
            }
        }
    }
}
