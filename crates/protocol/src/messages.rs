//! USB/IP wire message definitions
//!
//! Every message starts with the same 8-byte header. Op-phase messages
//! (device list, import) carry the protocol version `0x0111` in the first
//! word; command-phase messages (SUBMIT, UNLINK) use the non-op command
//! space and carry a zero version word, so the decoder routes on the
//! version word first.
//!
//! All multi-byte integers are big-endian (network byte order). Strings in
//! fixed-length slots are NUL-padded to the slot width on encode; the first
//! NUL terminates on decode.

use crate::error::{ProtocolError, Result};
use crate::types::{DeviceSpeed, UsbDevice};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use std::io::{Cursor, Read, Write};

/// USB/IP protocol version (1.1.1)
pub const USBIP_VERSION: u16 = 0x0111;

/// Request the exportable device list (client -> server)
pub const OP_REQ_DEVLIST: u16 = 0x8005;
/// Device list reply (server -> client)
pub const OP_REP_DEVLIST: u16 = 0x0005;
/// Request to import a device by bus id (client -> server)
pub const OP_REQ_IMPORT: u16 = 0x8003;
/// Import reply (server -> client)
pub const OP_REP_IMPORT: u16 = 0x0003;

/// Submit a URB to the imported device (client -> server)
pub const CMD_SUBMIT: u16 = 0x0001;
/// Cancel an in-flight URB by seqnum (client -> server)
pub const CMD_UNLINK: u16 = 0x0002;
/// URB completion (server -> client)
pub const RET_SUBMIT: u16 = 0x0003;
/// Unlink completion (server -> client)
pub const RET_UNLINK: u16 = 0x0004;

/// Width of the path slot in the exported-device record
pub const SYSFS_PATH_MAX: usize = 256;
/// Width of the bus-id slot in the exported-device record
pub const SYSFS_BUS_ID_SIZE: usize = 32;

/// Op-phase reply status codes carried in the header status field
pub const ST_OK: u32 = 0x00;
/// Generic request failure
pub const ST_NA: u32 = 0x01;
/// Device requested for import is already exported
pub const ST_DEVICE_BUSY: u32 = 0x02;
/// Device is in an error state
pub const ST_DEVICE_ERROR: u32 = 0x03;
/// Requested device does not exist on this host
pub const ST_NO_SUCH_DEVICE: u32 = 0x04;
/// Some other opaque error
pub const ST_ERROR: u32 = 0x05;

/// Common 8-byte message header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Protocol version word; 0x0111 for op messages, 0 for CMD/RET
    pub version: u16,
    /// Command code
    pub command: u16,
    /// Status field; 0 in requests, op status in op replies
    pub status: u32,
}

impl Header {
    /// Size of the header in bytes
    pub const SIZE: usize = 8;

    /// Header for an op-phase message
    pub fn op(command: u16, status: u32) -> Self {
        Self {
            version: USBIP_VERSION,
            command,
            status,
        }
    }

    /// Header for a command-phase message
    pub fn cmd(command: u16) -> Self {
        Self {
            version: 0,
            command,
            status: 0,
        }
    }

    /// Read a header from a reader
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let version = reader.read_u16::<BigEndian>()?;
        let command = reader.read_u16::<BigEndian>()?;
        let status = reader.read_u32::<BigEndian>()?;
        Ok(Self {
            version,
            command,
            status,
        })
    }

    /// Write the header to a writer
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u16::<BigEndian>(self.version)?;
        writer.write_u16::<BigEndian>(self.command)?;
        writer.write_u32::<BigEndian>(self.status)?;
        Ok(())
    }

    /// Fail with `InvalidMessageFormat` unless the command word matches
    pub fn expect_command(&self, command: u16) -> Result<()> {
        if self.command != command {
            return Err(ProtocolError::InvalidMessageFormat {
                command: self.command,
            });
        }
        Ok(())
    }
}

/// Write a string into a fixed NUL-padded slot, truncating if necessary
fn write_fixed_str<W: Write>(writer: &mut W, value: &str, width: usize) -> Result<()> {
    let bytes = value.as_bytes();
    let len = bytes.len().min(width);
    writer.write_all(&bytes[..len])?;
    if len < width {
        writer.write_all(&vec![0u8; width - len])?;
    }
    Ok(())
}

/// Read a fixed NUL-padded slot; the first NUL terminates the string
fn read_fixed_str(slot: &[u8]) -> Result<String> {
    let end = slot.iter().position(|&b| b == 0).unwrap_or(slot.len());
    std::str::from_utf8(&slot[..end])
        .map(str::to_owned)
        .map_err(|_| ProtocolError::StringEncoding)
}

fn check_len(buf: &[u8], needed: usize) -> Result<()> {
    if buf.len() < needed {
        return Err(ProtocolError::InvalidDataLength {
            needed,
            actual: buf.len(),
        });
    }
    Ok(())
}

/// The fixed 312-byte exported-device record
///
/// Derivable from a [`UsbDevice`]; never stored by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedDevice {
    /// Host-side sysfs-style path of the device
    pub path: String,
    /// Bus identity the client imports by
    pub bus_id: String,
    pub bus_num: u32,
    pub dev_num: u32,
    /// Wire speed code, see [`DeviceSpeed::wire_code`]
    pub speed: u32,
    pub id_vendor: u16,
    pub id_product: u16,
    pub bcd_device: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub configuration_value: u8,
    pub num_configurations: u8,
    pub num_interfaces: u8,
}

impl ExportedDevice {
    /// Size of the record in bytes
    pub const SIZE: usize = 312;

    /// Build the wire record for a registry device
    pub fn from_device(device: &UsbDevice) -> Self {
        Self {
            path: format!("/sys/devices/usb/{}", device.bus_id),
            bus_id: device.bus_id.clone(),
            bus_num: device.bus_num,
            dev_num: device.dev_num,
            speed: device.speed.wire_code(),
            id_vendor: device.vendor_id,
            id_product: device.product_id,
            bcd_device: device.bcd_device,
            device_class: device.class,
            device_subclass: device.subclass,
            device_protocol: device.protocol,
            configuration_value: device.configuration_value,
            num_configurations: device.num_configurations,
            num_interfaces: device.num_interfaces,
        }
    }

    /// Device speed as an enum
    pub fn device_speed(&self) -> DeviceSpeed {
        DeviceSpeed::from_wire(self.speed)
    }

    /// Write the 312-byte record to a writer
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        write_fixed_str(writer, &self.path, SYSFS_PATH_MAX)?;
        write_fixed_str(writer, &self.bus_id, SYSFS_BUS_ID_SIZE)?;
        writer.write_u32::<BigEndian>(self.bus_num)?;
        writer.write_u32::<BigEndian>(self.dev_num)?;
        writer.write_u32::<BigEndian>(self.speed)?;
        writer.write_u16::<BigEndian>(self.id_vendor)?;
        writer.write_u16::<BigEndian>(self.id_product)?;
        writer.write_u16::<BigEndian>(self.bcd_device)?;
        writer.write_u8(self.device_class)?;
        writer.write_u8(self.device_subclass)?;
        writer.write_u8(self.device_protocol)?;
        writer.write_u8(self.configuration_value)?;
        writer.write_u8(self.num_configurations)?;
        writer.write_u8(self.num_interfaces)?;
        Ok(())
    }

    /// Decode a 312-byte record
    pub fn decode(buf: &[u8]) -> Result<Self> {
        check_len(buf, Self::SIZE)?;
        let path = read_fixed_str(&buf[..SYSFS_PATH_MAX])?;
        let bus_id = read_fixed_str(&buf[SYSFS_PATH_MAX..SYSFS_PATH_MAX + SYSFS_BUS_ID_SIZE])?;
        let mut cursor = Cursor::new(&buf[SYSFS_PATH_MAX + SYSFS_BUS_ID_SIZE..Self::SIZE]);
        Ok(Self {
            path,
            bus_id,
            bus_num: cursor.read_u32::<BigEndian>()?,
            dev_num: cursor.read_u32::<BigEndian>()?,
            speed: cursor.read_u32::<BigEndian>()?,
            id_vendor: cursor.read_u16::<BigEndian>()?,
            id_product: cursor.read_u16::<BigEndian>()?,
            bcd_device: cursor.read_u16::<BigEndian>()?,
            device_class: cursor.read_u8()?,
            device_subclass: cursor.read_u8()?,
            device_protocol: cursor.read_u8()?,
            configuration_value: cursor.read_u8()?,
            num_configurations: cursor.read_u8()?,
            num_interfaces: cursor.read_u8()?,
        })
    }
}

/// OP_REQ_DEVLIST: request the exportable device list (8 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DevlistRequest;

impl DevlistRequest {
    /// Total encoded size
    pub const SIZE: usize = Header::SIZE;

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        Header::op(OP_REQ_DEVLIST, 0).write_to(&mut buf)?;
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        check_len(buf, Self::SIZE)?;
        let header = Header::read_from(&mut Cursor::new(buf))?;
        if header.version != USBIP_VERSION {
            return Err(ProtocolError::UnsupportedVersion(header.version));
        }
        header.expect_command(OP_REQ_DEVLIST)?;
        Ok(Self)
    }
}

/// OP_REP_DEVLIST: header + device count + one record per device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevlistReply {
    pub devices: Vec<ExportedDevice>,
}

impl DevlistReply {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf =
            Vec::with_capacity(Header::SIZE + 4 + self.devices.len() * ExportedDevice::SIZE);
        Header::op(OP_REP_DEVLIST, ST_OK).write_to(&mut buf)?;
        buf.write_u32::<BigEndian>(self.devices.len() as u32)?;
        for device in &self.devices {
            device.write_to(&mut buf)?;
        }
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        check_len(buf, Header::SIZE + 4)?;
        let mut cursor = Cursor::new(buf);
        let header = Header::read_from(&mut cursor)?;
        if header.version != USBIP_VERSION {
            return Err(ProtocolError::UnsupportedVersion(header.version));
        }
        header.expect_command(OP_REP_DEVLIST)?;
        let count = cursor.read_u32::<BigEndian>()? as usize;
        check_len(buf, Header::SIZE + 4 + count * ExportedDevice::SIZE)?;
        let mut devices = Vec::with_capacity(count);
        for i in 0..count {
            let start = Header::SIZE + 4 + i * ExportedDevice::SIZE;
            devices.push(ExportedDevice::decode(&buf[start..])?);
        }
        Ok(Self { devices })
    }
}

/// OP_REQ_IMPORT: header + 32-byte NUL-padded bus id (40 bytes)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRequest {
    pub bus_id: String,
}

impl ImportRequest {
    /// Total encoded size
    pub const SIZE: usize = Header::SIZE + SYSFS_BUS_ID_SIZE;

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        Header::op(OP_REQ_IMPORT, 0).write_to(&mut buf)?;
        write_fixed_str(&mut buf, &self.bus_id, SYSFS_BUS_ID_SIZE)?;
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        check_len(buf, Self::SIZE)?;
        let header = Header::read_from(&mut Cursor::new(buf))?;
        if header.version != USBIP_VERSION {
            return Err(ProtocolError::UnsupportedVersion(header.version));
        }
        header.expect_command(OP_REQ_IMPORT)?;
        let bus_id = read_fixed_str(&buf[Header::SIZE..Self::SIZE])?;
        Ok(Self { bus_id })
    }
}

/// OP_REP_IMPORT: header + record on success, header only on failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportReply {
    /// Op status; 0 on success
    pub status: u32,
    /// The exported device, present iff `status == ST_OK`
    pub device: Option<ExportedDevice>,
}

impl ImportReply {
    /// Total encoded size of a successful reply
    pub const SIZE_OK: usize = Header::SIZE + ExportedDevice::SIZE;

    /// Successful import of `device`
    pub fn success(device: ExportedDevice) -> Self {
        Self {
            status: ST_OK,
            device: Some(device),
        }
    }

    /// Failed import with a non-zero op status
    pub fn failure(status: u32) -> Self {
        Self {
            status,
            device: None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(if self.device.is_some() {
            Self::SIZE_OK
        } else {
            Header::SIZE
        });
        Header::op(OP_REP_IMPORT, self.status).write_to(&mut buf)?;
        if let Some(ref device) = self.device {
            device.write_to(&mut buf)?;
        }
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        check_len(buf, Header::SIZE)?;
        let header = Header::read_from(&mut Cursor::new(buf))?;
        if header.version != USBIP_VERSION {
            return Err(ProtocolError::UnsupportedVersion(header.version));
        }
        header.expect_command(OP_REP_IMPORT)?;
        if header.status != ST_OK {
            return Ok(Self::failure(header.status));
        }
        let device = ExportedDevice::decode(&buf[Header::SIZE..])?;
        Ok(Self::success(device))
    }
}

/// CMD_SUBMIT: fixed 60-byte part plus the out-buffer for OUT transfers
///
/// Direction and endpoint are kept as raw wire words here; the URB layer
/// validates them. The setup slot is zero-padded when the endpoint is not
/// the control endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitRequest {
    pub seqnum: u32,
    pub devid: u32,
    /// Raw wire direction: 0 = OUT, 1 = IN
    pub direction: u32,
    /// Raw wire endpoint word; address in bits 0-6
    pub ep: u32,
    pub transfer_flags: u32,
    pub transfer_buffer_length: u32,
    pub start_frame: u32,
    pub number_of_packets: u32,
    pub interval: u32,
    /// Control setup packet; meaningful only for endpoint 0
    pub setup: [u8; 8],
    /// Out-buffer bytes, present iff direction is OUT and the length is non-zero
    pub data: Option<Bytes>,
}

impl SubmitRequest {
    /// Size of the fixed part in bytes
    pub const FIXED_SIZE: usize = 60;

    pub fn encode(&self) -> Result<Vec<u8>> {
        let data_len = self.data.as_ref().map_or(0, Bytes::len);
        let mut buf = Vec::with_capacity(Self::FIXED_SIZE + data_len);
        Header::cmd(CMD_SUBMIT).write_to(&mut buf)?;
        buf.write_u32::<BigEndian>(self.seqnum)?;
        buf.write_u32::<BigEndian>(self.devid)?;
        buf.write_u32::<BigEndian>(self.direction)?;
        buf.write_u32::<BigEndian>(self.ep)?;
        buf.write_u32::<BigEndian>(self.transfer_flags)?;
        buf.write_u32::<BigEndian>(self.transfer_buffer_length)?;
        buf.write_u32::<BigEndian>(self.start_frame)?;
        buf.write_u32::<BigEndian>(self.number_of_packets)?;
        buf.write_u32::<BigEndian>(self.interval)?;
        buf.write_all(&[0u8; 8])?;
        buf.write_all(&self.setup)?;
        if let Some(ref data) = self.data {
            buf.write_all(data)?;
        }
        Ok(buf)
    }

    /// Decode the fixed part; `body` starts after the header
    pub(crate) fn decode_parts(body: &[u8; 52], data: Option<Bytes>) -> Result<Self> {
        let mut cursor = Cursor::new(&body[..]);
        let seqnum = cursor.read_u32::<BigEndian>()?;
        let devid = cursor.read_u32::<BigEndian>()?;
        let direction = cursor.read_u32::<BigEndian>()?;
        let ep = cursor.read_u32::<BigEndian>()?;
        let transfer_flags = cursor.read_u32::<BigEndian>()?;
        let transfer_buffer_length = cursor.read_u32::<BigEndian>()?;
        let start_frame = cursor.read_u32::<BigEndian>()?;
        let number_of_packets = cursor.read_u32::<BigEndian>()?;
        let interval = cursor.read_u32::<BigEndian>()?;
        let mut reserved = [0u8; 8];
        cursor.read_exact(&mut reserved)?;
        let mut setup = [0u8; 8];
        cursor.read_exact(&mut setup)?;
        Ok(Self {
            seqnum,
            devid,
            direction,
            ep,
            transfer_flags,
            transfer_buffer_length,
            start_frame,
            number_of_packets,
            interval,
            setup,
            data,
        })
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        check_len(buf, Self::FIXED_SIZE)?;
        let header = Header::read_from(&mut Cursor::new(buf))?;
        if header.version != 0 {
            return Err(ProtocolError::UnsupportedVersion(header.version));
        }
        header.expect_command(CMD_SUBMIT)?;
        let body: [u8; 52] = buf[Header::SIZE..Self::FIXED_SIZE]
            .try_into()
            .expect("slice is exactly 52 bytes");
        let mut message = Self::decode_parts(&body, None)?;
        if message.direction == 0 && message.transfer_buffer_length > 0 {
            crate::codec::check_transfer_buffer(message.transfer_buffer_length)?;
            let data_len = message.transfer_buffer_length as usize;
            check_len(buf, Self::FIXED_SIZE + data_len)?;
            message.data = Some(Bytes::copy_from_slice(
                &buf[Self::FIXED_SIZE..Self::FIXED_SIZE + data_len],
            ));
        }
        Ok(message)
    }

    /// Endpoint address: bits 0-6 of the wire endpoint word
    pub fn endpoint_address(&self) -> u8 {
        (self.ep & 0x7f) as u8
    }
}

/// RET_SUBMIT: fixed 52-byte part plus the in-buffer for IN transfers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitReply {
    pub seqnum: u32,
    pub devid: u32,
    pub direction: u32,
    pub ep: u32,
    /// Signed URB status: 0 on success, negative errno on failure
    pub status: i32,
    pub actual_length: u32,
    pub start_frame: u32,
    pub number_of_packets: u32,
    pub error_count: u32,
    /// In-buffer bytes, present iff direction is IN and status indicates data
    pub data: Option<Bytes>,
}

impl SubmitReply {
    /// Size of the fixed part in bytes
    pub const FIXED_SIZE: usize = 52;

    pub fn encode(&self) -> Result<Vec<u8>> {
        let data_len = self.data.as_ref().map_or(0, Bytes::len);
        let mut buf = Vec::with_capacity(Self::FIXED_SIZE + data_len);
        Header::cmd(RET_SUBMIT).write_to(&mut buf)?;
        buf.write_u32::<BigEndian>(self.seqnum)?;
        buf.write_u32::<BigEndian>(self.devid)?;
        buf.write_u32::<BigEndian>(self.direction)?;
        buf.write_u32::<BigEndian>(self.ep)?;
        buf.write_i32::<BigEndian>(self.status)?;
        buf.write_u32::<BigEndian>(self.actual_length)?;
        buf.write_u32::<BigEndian>(self.start_frame)?;
        buf.write_u32::<BigEndian>(self.number_of_packets)?;
        buf.write_u32::<BigEndian>(self.error_count)?;
        buf.write_all(&[0u8; 8])?;
        if let Some(ref data) = self.data {
            buf.write_all(data)?;
        }
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        check_len(buf, Self::FIXED_SIZE)?;
        let mut cursor = Cursor::new(buf);
        let header = Header::read_from(&mut cursor)?;
        if header.version != 0 {
            return Err(ProtocolError::UnsupportedVersion(header.version));
        }
        header.expect_command(RET_SUBMIT)?;
        let seqnum = cursor.read_u32::<BigEndian>()?;
        let devid = cursor.read_u32::<BigEndian>()?;
        let direction = cursor.read_u32::<BigEndian>()?;
        let ep = cursor.read_u32::<BigEndian>()?;
        let status = cursor.read_i32::<BigEndian>()?;
        let actual_length = cursor.read_u32::<BigEndian>()?;
        let start_frame = cursor.read_u32::<BigEndian>()?;
        let number_of_packets = cursor.read_u32::<BigEndian>()?;
        let error_count = cursor.read_u32::<BigEndian>()?;
        let data = if direction == 1 && status == 0 && actual_length > 0 {
            let data_len = actual_length as usize;
            check_len(buf, Self::FIXED_SIZE + data_len)?;
            Some(Bytes::copy_from_slice(
                &buf[Self::FIXED_SIZE..Self::FIXED_SIZE + data_len],
            ))
        } else {
            None
        };
        Ok(Self {
            seqnum,
            devid,
            direction,
            ep,
            status,
            actual_length,
            start_frame,
            number_of_packets,
            error_count,
            data,
        })
    }
}

/// CMD_UNLINK: fixed 52 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnlinkRequest {
    pub seqnum: u32,
    pub devid: u32,
    pub direction: u32,
    pub ep: u32,
    /// Seqnum of the in-flight URB to cancel
    pub unlink_seqnum: u32,
}

impl UnlinkRequest {
    /// Total encoded size
    pub const SIZE: usize = 52;

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        Header::cmd(CMD_UNLINK).write_to(&mut buf)?;
        buf.write_u32::<BigEndian>(self.seqnum)?;
        buf.write_u32::<BigEndian>(self.devid)?;
        buf.write_u32::<BigEndian>(self.direction)?;
        buf.write_u32::<BigEndian>(self.ep)?;
        buf.write_u32::<BigEndian>(self.unlink_seqnum)?;
        buf.write_all(&[0u8; 24])?;
        Ok(buf)
    }

    /// Decode the fixed part; `body` starts after the header
    pub(crate) fn decode_parts(body: &[u8; 44]) -> Result<Self> {
        let mut cursor = Cursor::new(&body[..]);
        Ok(Self {
            seqnum: cursor.read_u32::<BigEndian>()?,
            devid: cursor.read_u32::<BigEndian>()?,
            direction: cursor.read_u32::<BigEndian>()?,
            ep: cursor.read_u32::<BigEndian>()?,
            unlink_seqnum: cursor.read_u32::<BigEndian>()?,
        })
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        check_len(buf, Self::SIZE)?;
        let header = Header::read_from(&mut Cursor::new(buf))?;
        if header.version != 0 {
            return Err(ProtocolError::UnsupportedVersion(header.version));
        }
        header.expect_command(CMD_UNLINK)?;
        let body: [u8; 44] = buf[Header::SIZE..Self::SIZE]
            .try_into()
            .expect("slice is exactly 44 bytes");
        Self::decode_parts(&body)
    }
}

/// RET_UNLINK: same layout as CMD_UNLINK with a signed status in place of
/// the unlink seqnum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnlinkReply {
    pub seqnum: u32,
    pub devid: u32,
    pub direction: u32,
    pub ep: u32,
    /// 0 on successful cancellation, negative errno otherwise
    pub status: i32,
}

impl UnlinkReply {
    /// Total encoded size
    pub const SIZE: usize = 52;

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        Header::cmd(RET_UNLINK).write_to(&mut buf)?;
        buf.write_u32::<BigEndian>(self.seqnum)?;
        buf.write_u32::<BigEndian>(self.devid)?;
        buf.write_u32::<BigEndian>(self.direction)?;
        buf.write_u32::<BigEndian>(self.ep)?;
        buf.write_i32::<BigEndian>(self.status)?;
        buf.write_all(&[0u8; 24])?;
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        check_len(buf, Self::SIZE)?;
        let mut cursor = Cursor::new(buf);
        let header = Header::read_from(&mut cursor)?;
        if header.version != 0 {
            return Err(ProtocolError::UnsupportedVersion(header.version));
        }
        header.expect_command(RET_UNLINK)?;
        Ok(Self {
            seqnum: cursor.read_u32::<BigEndian>()?,
            devid: cursor.read_u32::<BigEndian>()?,
            direction: cursor.read_u32::<BigEndian>()?,
            ep: cursor.read_u32::<BigEndian>()?,
            status: cursor.read_i32::<BigEndian>()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = Header::op(OP_REQ_DEVLIST, 0);
        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), Header::SIZE);
        assert_eq!(buf, [0x01, 0x11, 0x80, 0x05, 0x00, 0x00, 0x00, 0x00]);

        let decoded = Header::read_from(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_fixed_str_padding() {
        let mut buf = Vec::new();
        write_fixed_str(&mut buf, "1-1", 32).unwrap();
        assert_eq!(buf.len(), 32);
        assert_eq!(&buf[..3], b"1-1");
        assert!(buf[3..].iter().all(|&b| b == 0));
        assert_eq!(read_fixed_str(&buf).unwrap(), "1-1");
    }

    #[test]
    fn test_fixed_str_truncation() {
        let mut buf = Vec::new();
        write_fixed_str(&mut buf, "abcdefgh", 4).unwrap();
        assert_eq!(buf, b"abcd");
    }

    #[test]
    fn test_fixed_str_invalid_utf8() {
        let slot = [0xff, 0xfe, 0x00, 0x00];
        assert!(matches!(
            read_fixed_str(&slot),
            Err(ProtocolError::StringEncoding)
        ));
    }

    #[test]
    fn test_exported_device_size() {
        let device = ExportedDevice {
            path: "/sys/devices/usb/1-1".to_string(),
            bus_id: "1-1".to_string(),
            bus_num: 1,
            dev_num: 2,
            speed: 3,
            id_vendor: 0x1234,
            id_product: 0x5678,
            bcd_device: 0x0100,
            device_class: 0,
            device_subclass: 0,
            device_protocol: 0,
            configuration_value: 1,
            num_configurations: 1,
            num_interfaces: 2,
        };
        let mut buf = Vec::new();
        device.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), ExportedDevice::SIZE);
        assert_eq!(&buf[256..259], b"1-1");

        let decoded = ExportedDevice::decode(&buf).unwrap();
        assert_eq!(decoded, device);
    }

    #[test]
    fn test_unlink_sizes_match() {
        let request = UnlinkRequest {
            seqnum: 9,
            devid: 0x10004,
            direction: 1,
            ep: 0x81,
            unlink_seqnum: 3,
        };
        let reply = UnlinkReply {
            seqnum: 9,
            devid: 0x10004,
            direction: 1,
            ep: 0x81,
            status: 0,
        };
        assert_eq!(request.encode().unwrap().len(), UnlinkRequest::SIZE);
        assert_eq!(reply.encode().unwrap().len(), UnlinkReply::SIZE);
    }

    #[test]
    fn test_submit_request_out_data() {
        let request = SubmitRequest {
            seqnum: 2,
            devid: 0x10004,
            direction: 0,
            ep: 0x02,
            transfer_flags: 0,
            transfer_buffer_length: 4,
            start_frame: 0,
            number_of_packets: 0,
            interval: 0,
            setup: [0u8; 8],
            data: Some(Bytes::from_static(&[0x42; 4])),
        };
        let encoded = request.encode().unwrap();
        assert_eq!(encoded.len(), SubmitRequest::FIXED_SIZE + 4);
        let decoded = SubmitRequest::decode(&encoded).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_submit_request_short_out_data() {
        let request = SubmitRequest {
            seqnum: 2,
            devid: 0x10004,
            direction: 0,
            ep: 0x02,
            transfer_buffer_length: 64,
            transfer_flags: 0,
            start_frame: 0,
            number_of_packets: 0,
            interval: 0,
            setup: [0u8; 8],
            data: None,
        };
        // Fixed part only, missing the declared 64-byte out buffer
        let encoded = request.encode().unwrap();
        assert!(matches!(
            SubmitRequest::decode(&encoded),
            Err(ProtocolError::InvalidDataLength { .. })
        ));
    }
}
