//! Backend-side device table
//!
//! Runs on the USB worker thread: enumerates devices, opens them when they
//! are claimed, and resolves claim handles back to devices for the
//! transfer path. Root hubs are never exported.

use crate::usb::device::PhysicalDevice;
use common::{BackendError, ClaimHandle};
use protocol::UsbDevice;
use rusb::{Context, UsbContext};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

pub struct DeviceManager {
    context: Context,
    /// device_key -> device
    devices: HashMap<String, PhysicalDevice>,
    /// claim handle -> device_key
    claims: HashMap<ClaimHandle, String>,
    next_handle: u32,
    /// Seqnums cancelled before their transfer was picked up
    cancelled: HashSet<u32>,
}

impl DeviceManager {
    pub fn new() -> Result<Self, rusb::Error> {
        Ok(Self {
            context: Context::new()?,
            devices: HashMap::new(),
            claims: HashMap::new(),
            next_handle: 1,
            cancelled: HashSet::new(),
        })
    }

    /// Re-enumerate; open (claimed) devices are kept even if enumeration
    /// briefly misses them
    fn refresh(&mut self) -> Result<(), rusb::Error> {
        let mut seen = HashSet::new();

        for device in self.context.devices()?.iter() {
            // Root hubs cannot be exported
            if let Ok(descriptor) = device.device_descriptor() {
                if descriptor.class_code() == 0x09 && device.port_number() == 0 {
                    continue;
                }
            }

            let physical = match PhysicalDevice::new(device) {
                Ok(physical) => physical,
                Err(e) => {
                    debug!(error = %e, "skipping unreadable device");
                    continue;
                }
            };
            let key = physical.device_key();
            seen.insert(key.clone());
            self.devices.entry(key).or_insert(physical);
        }

        self.devices
            .retain(|key, device| device.is_open() || seen.contains(key));
        Ok(())
    }

    pub fn list_devices(&mut self) -> Result<Vec<UsbDevice>, BackendError> {
        self.refresh()
            .map_err(|e| BackendError::Internal(e.to_string()))?;
        Ok(self.devices.values().map(PhysicalDevice::info).collect())
    }

    pub fn claim(&mut self, bus_id: &str, device_id: &str) -> Result<ClaimHandle, BackendError> {
        if let Err(e) = self.refresh() {
            warn!(error = %e, "enumeration failed during claim");
        }

        let device = self
            .devices
            .values_mut()
            .find(|device| device.bus_id() == bus_id && device.device_id() == device_id)
            .ok_or(BackendError::NotFound)?;

        device.open()?;

        let handle = ClaimHandle(self.next_handle);
        self.next_handle += 1;
        self.claims.insert(handle, device.device_key());
        debug!(bus_id, device_id, handle = handle.0, "claimed device");
        Ok(handle)
    }

    pub fn release(&mut self, handle: ClaimHandle) -> Result<(), BackendError> {
        let key = self.claims.remove(&handle).ok_or(BackendError::NotFound)?;
        if let Some(device) = self.devices.get_mut(&key) {
            device.close();
        }
        debug!(handle = handle.0, device = %key, "released device");
        Ok(())
    }

    pub fn open_interface(
        &mut self,
        handle: ClaimHandle,
        interface: u8,
    ) -> Result<(), BackendError> {
        self.device_for(handle)?.open_interface(interface)
    }

    pub fn device_for(&mut self, handle: ClaimHandle) -> Result<&mut PhysicalDevice, BackendError> {
        let key = self.claims.get(&handle).ok_or(BackendError::NotFound)?;
        self.devices
            .get_mut(key)
            .ok_or(BackendError::Disconnected)
    }

    /// Record a cancel for a transfer that has not been picked up yet
    pub fn mark_cancelled(&mut self, seqnum: u32) {
        self.cancelled.insert(seqnum);
    }

    /// Consume a pending cancel mark
    pub fn take_cancelled(&mut self, seqnum: u32) -> bool {
        self.cancelled.remove(&seqnum)
    }
}
