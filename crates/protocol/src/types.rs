//! USB device and transfer type definitions
//!
//! This module defines the device model shared by the codec, the registry
//! and the backend, plus the direction/speed/transfer-kind enums used
//! throughout the URB pipeline.

/// USB device speed
///
/// Wire codes follow the kernel's `usb_device_speed` numbering, which is
/// what importing peers expect in the exported-device record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSpeed {
    /// Speed not reported by the host controller
    Unknown,
    /// Low speed - 1.5 Mbps (USB 1.0)
    Low,
    /// Full speed - 12 Mbps (USB 1.1)
    Full,
    /// High speed - 480 Mbps (USB 2.0)
    High,
    /// SuperSpeed - 5 Gbps (USB 3.0)
    Super,
}

impl DeviceSpeed {
    /// Numeric code used in the exported-device record
    pub fn wire_code(self) -> u32 {
        match self {
            DeviceSpeed::Unknown => 0,
            DeviceSpeed::Low => 1,
            DeviceSpeed::Full => 2,
            DeviceSpeed::High => 3,
            DeviceSpeed::Super => 5,
        }
    }

    /// Decode a wire speed code; unrecognized codes map to `Unknown`
    pub fn from_wire(code: u32) -> Self {
        match code {
            1 => DeviceSpeed::Low,
            2 => DeviceSpeed::Full,
            3 => DeviceSpeed::High,
            5 => DeviceSpeed::Super,
            _ => DeviceSpeed::Unknown,
        }
    }
}

/// Transfer direction as carried on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Host to device
    Out,
    /// Device to host
    In,
}

impl Direction {
    /// Wire encoding: 0 = OUT, 1 = IN
    pub fn wire_code(self) -> u32 {
        match self {
            Direction::Out => 0,
            Direction::In => 1,
        }
    }

    /// Decode the wire direction field
    pub fn from_wire(code: u32) -> Option<Self> {
        match code {
            0 => Some(Direction::Out),
            1 => Some(Direction::In),
            _ => None,
        }
    }
}

/// USB transfer kind
///
/// Inferred from the submitted URB: endpoint 0 is control, a non-zero
/// packet count is isochronous, everything else defaults to bulk.
/// Interrupt endpoints are indistinguishable from bulk at this layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Control,
    Bulk,
    Interrupt,
    Isochronous,
}

/// A locally attached, exportable USB device
///
/// Immutable for the device's lifetime; the registry replaces the whole
/// record when the underlying device is re-enumerated.
#[derive(Debug, Clone, PartialEq)]
pub struct UsbDevice {
    /// Bus identity, e.g. "1-1" or "3-2.1.4"
    pub bus_id: String,
    /// Device identity on the bus, same syntax as `bus_id`
    pub device_id: String,
    /// Bus number as reported by the host
    pub bus_num: u32,
    /// Device number as reported by the host
    pub dev_num: u32,
    /// USB vendor ID
    pub vendor_id: u16,
    /// USB product ID
    pub product_id: u16,
    /// Device release number (bcdDevice)
    pub bcd_device: u16,
    /// USB device class
    pub class: u8,
    /// USB device subclass
    pub subclass: u8,
    /// USB device protocol
    pub protocol: u8,
    /// Active configuration value
    pub configuration_value: u8,
    /// Number of configurations
    pub num_configurations: u8,
    /// Number of interfaces in the active configuration
    pub num_interfaces: u8,
    /// Device speed
    pub speed: DeviceSpeed,
    /// Manufacturer string (if available)
    pub manufacturer: Option<String>,
    /// Product string (if available)
    pub product: Option<String>,
    /// Serial number string (if available)
    pub serial: Option<String>,
}

impl UsbDevice {
    /// Key identifying the device across the protocol and persisted state
    pub fn device_key(&self) -> String {
        format!("{}-{}", self.bus_id, self.device_id)
    }

    /// Wire device id: bus number in the high half, device number in the low
    pub fn devid(&self) -> u32 {
        (self.bus_num << 16) | (self.dev_num & 0xffff)
    }
}

/// Validate a bus-id style identifier: `^\d+-\d+(\.\d+)*$`
///
/// Both `bus_id` and `device_id` use this syntax, as do CLI `bind`/`unbind`
/// arguments.
pub fn is_valid_bus_id(value: &str) -> bool {
    let Some((bus, ports)) = value.split_once('-') else {
        return false;
    };
    if bus.is_empty() || !bus.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    ports
        .split('.')
        .all(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()))
}

/// Validate a device key: two bus-id style identifiers joined by '-'
///
/// Keys are not self-delimiting, so any split that yields two valid bus ids
/// is accepted.
pub fn is_valid_device_key(value: &str) -> bool {
    value
        .char_indices()
        .filter(|&(_, c)| c == '-')
        .any(|(i, _)| is_valid_bus_id(&value[..i]) && is_valid_bus_id(&value[i + 1..]))
}
