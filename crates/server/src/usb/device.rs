//! Physical USB device wrapper
//!
//! Wraps a `rusb::Device` with its cached descriptor, the bus/device
//! identity strings the protocol uses, and the open handle once the device
//! is claimed. Opening detaches kernel drivers so transfers can go through;
//! closing reattaches them to hand the device back to the host.

use common::BackendError;
use protocol::{DeviceSpeed, UsbDevice};
use rusb::{Context, Device, DeviceDescriptor, DeviceHandle};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// A locally attached device known to the backend
pub struct PhysicalDevice {
    device: Device<Context>,
    descriptor: DeviceDescriptor,
    /// Shared so per-transfer threads can use it while the worker keeps
    /// servicing commands
    handle: Option<Arc<DeviceHandle<Context>>>,
    open_interfaces: HashSet<u8>,
    num_interfaces: u8,
    configuration_value: u8,
    speed: DeviceSpeed,
    bus_id: String,
    device_id: String,
}

impl PhysicalDevice {
    pub fn new(device: Device<Context>) -> Result<Self, rusb::Error> {
        let descriptor = device.device_descriptor()?;
        let speed = map_device_speed(device.speed());
        let bus = device.bus_number();
        let port = device.port_number();
        let address = device.address();

        let (num_interfaces, configuration_value) = match device.active_config_descriptor() {
            Ok(config) => (config.num_interfaces(), config.number()),
            Err(_) => (1, 1),
        };

        Ok(Self {
            device,
            descriptor,
            handle: None,
            open_interfaces: HashSet::new(),
            num_interfaces,
            configuration_value,
            speed,
            bus_id: format!("{}-{}", bus, port.max(1)),
            device_id: format!("{}-{}", bus, address),
        })
    }

    pub fn bus_id(&self) -> &str {
        &self.bus_id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn device_key(&self) -> String {
        format!("{}-{}", self.bus_id, self.device_id)
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    /// Shared handle for transfer threads; None until the device is open
    pub fn shared_handle(&self) -> Option<Arc<DeviceHandle<Context>>> {
        self.handle.clone()
    }

    /// Convert to the protocol device record
    ///
    /// String descriptors are read through a temporary open so listing does
    /// not require a claim.
    pub fn info(&self) -> UsbDevice {
        let strings = self
            .device
            .open()
            .ok()
            .and_then(|handle| self.read_string_descriptors(&handle));
        let (manufacturer, product, serial) = strings.unwrap_or((None, None, None));

        UsbDevice {
            bus_id: self.bus_id.clone(),
            device_id: self.device_id.clone(),
            bus_num: self.device.bus_number() as u32,
            dev_num: self.device.address() as u32,
            vendor_id: self.descriptor.vendor_id(),
            product_id: self.descriptor.product_id(),
            bcd_device: bcd_version(self.descriptor.device_version()),
            class: self.descriptor.class_code(),
            subclass: self.descriptor.sub_class_code(),
            protocol: self.descriptor.protocol_code(),
            configuration_value: self.configuration_value,
            num_configurations: self.descriptor.num_configurations(),
            num_interfaces: self.num_interfaces,
            speed: self.speed,
            manufacturer,
            product,
            serial,
        }
    }

    /// Open the device for transfers and take it away from the kernel
    pub fn open(&mut self) -> Result<(), BackendError> {
        if self.handle.is_some() {
            return Err(BackendError::Busy);
        }

        let handle = self.device.open().map_err(|e| {
            warn!(device = %self.device_key(), error = %e, "failed to open device");
            map_open_error(e)
        })?;

        // Kernel drivers (usbhid, usb-storage, ...) hold the interfaces;
        // detach them all so they can be claimed on demand
        for iface in 0..self.num_interfaces {
            match handle.kernel_driver_active(iface) {
                Ok(true) => {
                    if let Err(e) = handle.detach_kernel_driver(iface) {
                        warn!(iface, error = %e, "failed to detach kernel driver");
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    // Not supported on every platform
                    debug!(iface, error = %e, "could not query kernel driver state");
                }
            }
        }

        debug!(device = %self.device_key(), "opened device");
        self.handle = Some(Arc::new(handle));
        Ok(())
    }

    /// Claim an interface; idempotent per interface
    pub fn open_interface(&mut self, interface: u8) -> Result<(), BackendError> {
        if self.open_interfaces.contains(&interface) {
            return Ok(());
        }
        let handle = self.handle.as_ref().ok_or(BackendError::NotFound)?;
        handle.claim_interface(interface).map_err(|e| {
            warn!(interface, error = %e, "failed to claim interface");
            crate::usb::transfers::map_rusb_error(e)
        })?;
        debug!(device = %self.device_key(), interface, "claimed interface");
        self.open_interfaces.insert(interface);
        Ok(())
    }

    /// Release interfaces, reattach kernel drivers and drop the handle
    pub fn close(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        for iface in self.open_interfaces.drain() {
            if let Err(e) = handle.release_interface(iface) {
                warn!(iface, error = %e, "failed to release interface");
            }
        }

        for iface in 0..self.num_interfaces {
            if let Err(e) = handle.attach_kernel_driver(iface) {
                // Fails when no driver was attached originally
                debug!(iface, error = %e, "could not reattach kernel driver");
            }
        }

        debug!(device = %self.device_key(), "closed device");
    }

    fn read_string_descriptors(
        &self,
        handle: &DeviceHandle<Context>,
    ) -> Option<(Option<String>, Option<String>, Option<String>)> {
        let manufacturer = self
            .descriptor
            .manufacturer_string_index()
            .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok());
        let product = self
            .descriptor
            .product_string_index()
            .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok());
        let serial = self
            .descriptor
            .serial_number_string_index()
            .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok());
        Some((manufacturer, product, serial))
    }
}

fn map_open_error(error: rusb::Error) -> BackendError {
    match error {
        rusb::Error::Access => BackendError::AccessDenied,
        rusb::Error::NotFound | rusb::Error::NoDevice => BackendError::NotFound,
        rusb::Error::Busy => BackendError::Busy,
        other => BackendError::Internal(other.to_string()),
    }
}

/// Pack a descriptor version back into its BCD wire form
fn bcd_version(version: rusb::Version) -> u16 {
    ((version.major() as u16) << 8)
        | (((version.minor() as u16) & 0x0f) << 4)
        | ((version.sub_minor() as u16) & 0x0f)
}

/// Map rusb device speed to the protocol speed enum
pub fn map_device_speed(speed: rusb::Speed) -> DeviceSpeed {
    match speed {
        rusb::Speed::Low => DeviceSpeed::Low,
        rusb::Speed::Full => DeviceSpeed::Full,
        rusb::Speed::High => DeviceSpeed::High,
        rusb::Speed::Super | rusb::Speed::SuperPlus => DeviceSpeed::Super,
        _ => DeviceSpeed::Unknown,
    }
}
