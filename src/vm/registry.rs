//! In-memory VM registry.
//!
//! Ids move through a two-phase registration: [`VmRegistry::reserve`] claims
//! the id and its tap device while the VM is being started, and
//! [`ReservationGuard::complete`] publishes the running VM. Dropping the guard
//! releases the claim, so a failed start leaves nothing behind.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;

use super::{RunningVm, VmState};
use crate::error::{Error, Result};

/// RAII guard for an id reservation.
pub struct ReservationGuard<'a> {
    registry: &'a VmRegistry,
    id: String,
    completed: bool,
}

impl<'a> ReservationGuard<'a> {
    /// Reserved id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Publish the VM, consuming the guard without releasing.
    pub fn complete(mut self, vm: RunningVm) -> Arc<RunningVm> {
        self.completed = true;
        self.registry.complete_registration(vm)
    }
}

impl std::fmt::Debug for ReservationGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReservationGuard")
            .field("id", &self.id)
            .field("completed", &self.completed)
            .finish()
    }
}

impl Drop for ReservationGuard<'_> {
    fn drop(&mut self) {
        if !self.completed {
            self.registry.release_reservation(&self.id);
            tracing::debug!(vm = %self.id, "reservation guard released on drop");
        }
    }
}

/// Registry of VMs owned by this node.
#[derive(Default)]
pub struct VmRegistry {
    vms: RwLock<BTreeMap<String, Arc<RunningVm>>>,
    /// Ids being started, with the tap device each will use.
    reserved: RwLock<HashMap<String, String>>,
}

impl VmRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `id` and `tap_device` for a VM about to start.
    ///
    /// Fails with `VmAlreadyExists` if the id is registered or being started,
    /// and with a network error if another VM holds or is claiming the tap.
    pub fn reserve(&self, id: &str, tap_device: &str) -> Result<ReservationGuard<'_>> {
        {
            let vms = self.vms.read();
            if vms.contains_key(id) {
                return Err(Error::vm_already_exists(id));
            }
        }

        let mut reserved = self.reserved.write();

        // Double-check under the reservation lock
        let vms = self.vms.read();
        if vms.contains_key(id) || reserved.contains_key(id) {
            return Err(Error::vm_already_exists(id));
        }

        let holder = vms
            .values()
            .find(|vm| vm.lease().tap_device == tap_device)
            .map(|vm| vm.id().to_string())
            .or_else(|| {
                reserved
                    .iter()
                    .find(|(_, tap)| tap.as_str() == tap_device)
                    .map(|(other, _)| other.clone())
            });
        if let Some(other) = holder {
            return Err(Error::network(
                "allocate tap",
                format!(
                    "tap device {} for vm {} is already used by vm {}",
                    tap_device, id, other
                ),
            ));
        }
        drop(vms);

        reserved.insert(id.to_string(), tap_device.to_string());
        tracing::debug!(vm = %id, tap = %tap_device, "reserved vm id");
        Ok(ReservationGuard {
            registry: self,
            id: id.to_string(),
            completed: false,
        })
    }

    fn release_reservation(&self, id: &str) {
        if self.reserved.write().remove(id).is_some() {
            tracing::debug!(vm = %id, "released vm reservation");
        }
    }

    fn complete_registration(&self, vm: RunningVm) -> Arc<RunningVm> {
        let id = vm.id().to_string();
        let vm = Arc::new(vm);
        // Insert before dropping the reservation so the id is never unclaimed
        self.vms.write().insert(id.clone(), vm.clone());
        self.reserved.write().remove(&id);
        vm
    }

    /// Look up a VM.
    pub fn get(&self, id: &str) -> Result<Arc<RunningVm>> {
        self.vms
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::vm_not_found(id))
    }

    /// Whether `id` is registered.
    pub fn contains(&self, id: &str) -> bool {
        self.vms.read().contains_key(id)
    }

    /// Remove a VM, returning it if present.
    pub fn remove(&self, id: &str) -> Option<Arc<RunningVm>> {
        self.vms.write().remove(id)
    }

    /// Registered ids in sorted order.
    pub fn list_ids(&self) -> Vec<String> {
        self.vms.read().keys().cloned().collect()
    }

    /// Registered VMs in id order.
    pub fn list(&self) -> Vec<Arc<RunningVm>> {
        self.vms.read().values().cloned().collect()
    }

    /// Number of registered VMs.
    pub fn len(&self) -> usize {
        self.vms.read().len()
    }

    /// Whether no VMs are registered.
    pub fn is_empty(&self) -> bool {
        self.vms.read().is_empty()
    }

    /// Move a VM into `Stopping`.
    ///
    /// A second concurrent stop gets `InvalidState`.
    pub fn begin_stop(&self, id: &str) -> Result<Arc<RunningVm>> {
        let vm = self.get(id)?;
        match vm.begin_stop() {
            VmState::Stopping => Err(Error::invalid_state(id, "running", "stopping")),
            previous => {
                tracing::debug!(vm = %id, previous = %previous, "stopping vm");
                Ok(vm)
            }
        }
    }

    /// Mark a running VM as failed.
    ///
    /// Returns `Ok(false)` if the VM was not running, e.g. it is already
    /// being stopped.
    pub fn mark_failed(&self, id: &str, reason: impl Into<String>) -> Result<bool> {
        Ok(self.get(id)?.mark_failed(reason.into()))
    }
}
