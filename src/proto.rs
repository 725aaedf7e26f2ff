//! PIMA 15740 wire codec.
//!
//! Everything the protocol puts on the bulk endpoints is little-endian:
//! 12-byte container headers, length-prefixed UCS-2 strings, and the
//! fixed-layout device-info / storage-info / object-info records. This
//! module owns the byte-level encoding so the engine and store can work
//! with plain Rust values.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};
use thiserror::Error;

/// The single storage unit this device exposes.
pub const STORE_ID: u32 = 0x0001_0001;

/// Parameter value meaning "not specified".
pub const PARAM_UNUSED: u32 = 0;
/// Parameter value meaning "all" / wildcard.
pub const PARAM_ANY: u32 = 0xffff_ffff;

/// Every container starts with a 12-byte header.
pub const CONTAINER_HEADER_LEN: usize = 12;

/// Handle of the synthetic `/DCIM` directory.
pub const DCIM_HANDLE: u32 = 1;
/// Handle of the synthetic `/DCIM/<MODEL_DIR>` directory holding all
/// real objects.
pub const MODEL_DIR_HANDLE: u32 = 2;

pub const MANUFACTURER: &str = "Linux Foundation";
pub const MODEL: &str = "PTP Gadget";
pub const STORAGE_DESC: &str = "SD/MMC";
pub const MODEL_DIR: &str = "100LINUX";

/// Container types (header `type` field).
pub mod container {
    pub const COMMAND: u16 = 1;
    pub const DATA: u16 = 2;
    pub const RESPONSE: u16 = 3;
    pub const EVENT: u16 = 4;
}

/// Operation codes of the supported subset.
pub mod op {
    pub const GET_DEVICE_INFO: u16 = 0x1001;
    pub const OPEN_SESSION: u16 = 0x1002;
    pub const CLOSE_SESSION: u16 = 0x1003;
    pub const GET_STORAGE_IDS: u16 = 0x1004;
    pub const GET_STORAGE_INFO: u16 = 0x1005;
    pub const GET_NUM_OBJECTS: u16 = 0x1006;
    pub const GET_OBJECT_HANDLES: u16 = 0x1007;
    pub const GET_OBJECT_INFO: u16 = 0x1008;
    pub const GET_OBJECT: u16 = 0x1009;
    pub const GET_THUMB: u16 = 0x100a;
    pub const DELETE_OBJECT: u16 = 0x100b;
    pub const SEND_OBJECT_INFO: u16 = 0x100c;
    pub const SEND_OBJECT: u16 = 0x100d;
}

/// Response codes.
pub mod resp {
    pub const OK: u16 = 0x2001;
    pub const GENERAL_ERROR: u16 = 0x2002;
    pub const SESSION_NOT_OPEN: u16 = 0x2003;
    pub const OPERATION_NOT_SUPPORTED: u16 = 0x2005;
    pub const INCOMPLETE_TRANSFER: u16 = 0x2007;
    pub const INVALID_STORAGE_ID: u16 = 0x2008;
    pub const INVALID_OBJECT_HANDLE: u16 = 0x2009;
    pub const INVALID_OBJECT_FORMAT_CODE: u16 = 0x200b;
    pub const STORE_FULL: u16 = 0x200c;
    pub const OBJECT_WRITE_PROTECTED: u16 = 0x200d;
    pub const ACCESS_DENIED: u16 = 0x200f;
    pub const NO_THUMBNAIL_PRESENT: u16 = 0x2010;
    pub const PARTIAL_DELETION: u16 = 0x2012;
    pub const STORE_NOT_AVAILABLE: u16 = 0x2013;
    pub const SPECIFICATION_BY_FORMAT_NOT_SUPPORTED: u16 = 0x2014;
    pub const NO_VALID_OBJECT_INFO: u16 = 0x2015;
    pub const INVALID_PARENT_OBJECT: u16 = 0x201a;
    pub const INVALID_PARAMETER: u16 = 0x201d;
    pub const SESSION_ALREADY_OPEN: u16 = 0x201e;
    pub const SPECIFICATION_OF_DESTINATION_UNSUPPORTED: u16 = 0x2020;
}

/// Object format codes.
pub mod format {
    pub const UNDEFINED: u16 = 0x3000;
    pub const ASSOCIATION: u16 = 0x3001;
    pub const TEXT: u16 = 0x3004;
    pub const EXIF_JPEG: u16 = 0x3801;
    pub const TIFF_EP: u16 = 0x3802;
    pub const JFIF: u16 = 0x3808;
    pub const PNG: u16 = 0x380b;
    pub const TIFF: u16 = 0x380d;
    pub const TIFF_IT: u16 = 0x380e;
}

pub const STORAGE_REMOVABLE_RAM: u16 = 0x0004;
pub const FILESYSTEM_DCF: u16 = 0x0003;
pub const ACCESS_CAP_RW: u16 = 0;
pub const ASSOCIATION_GENERIC_FOLDER: u16 = 1;

/// Operations advertised in the device-info record, in wire order.
pub const SUPPORTED_OPERATIONS: [u16; 13] = [
    op::GET_DEVICE_INFO,
    op::OPEN_SESSION,
    op::CLOSE_SESSION,
    op::GET_STORAGE_IDS,
    op::GET_STORAGE_INFO,
    op::GET_NUM_OBJECTS,
    op::GET_OBJECT_HANDLES,
    op::GET_OBJECT_INFO,
    op::GET_OBJECT,
    op::GET_THUMB,
    op::DELETE_OBJECT,
    op::SEND_OBJECT_INFO,
    op::SEND_OBJECT,
];

/// Image formats advertised in the device-info record, in wire order.
pub const SUPPORTED_FORMATS: [u16; 8] = [
    format::UNDEFINED,
    format::TEXT,
    format::EXIF_JPEG,
    format::TIFF_EP,
    format::PNG,
    format::TIFF,
    format::TIFF_IT,
    format::JFIF,
];

/// Errors raised while encoding or decoding wire data.
#[derive(Error, Debug)]
pub enum ProtoError {
    /// Fewer bytes available than a container header needs.
    #[error("container header truncated: {0} bytes")]
    Truncated(usize),

    /// A string is not representable as single UCS-2 code units.
    #[error("string not representable in UCS-2: {0:?}")]
    Unencodable(char),

    /// A string exceeds the 8-bit length prefix (255 code units).
    #[error("string too long for wire encoding: {0} characters")]
    StringTooLong(usize),

    /// A wire string contained invalid code units or ran past the buffer.
    #[error("malformed wire string")]
    MalformedString,

    /// A record ended before all fixed fields were read.
    #[error("record truncated: {0}")]
    RecordTruncated(#[from] std::io::Error),
}

/// The 12-byte header carried by every container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerHeader {
    /// Total container length in bytes, header included.
    pub length: u32,
    /// Container type, one of the [`container`] constants.
    pub kind: u16,
    /// Operation or response code.
    pub code: u16,
    /// Transaction id chosen by the host.
    pub id: u32,
}

impl ContainerHeader {
    /// Encode the header into its 12-byte wire form.
    pub fn encode(&self) -> [u8; CONTAINER_HEADER_LEN] {
        let mut out = [0u8; CONTAINER_HEADER_LEN];
        out[0..4].copy_from_slice(&self.length.to_le_bytes());
        out[4..6].copy_from_slice(&self.kind.to_le_bytes());
        out[6..8].copy_from_slice(&self.code.to_le_bytes());
        out[8..12].copy_from_slice(&self.id.to_le_bytes());
        out
    }

    /// Decode a header from the first 12 bytes of `buf`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtoError::Truncated`] when `buf` is shorter than a
    /// header.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtoError> {
        if buf.len() < CONTAINER_HEADER_LEN {
            return Err(ProtoError::Truncated(buf.len()));
        }
        let mut cur = Cursor::new(buf);
        Ok(Self {
            length: cur.read_u32::<LittleEndian>()?,
            kind: cur.read_u16::<LittleEndian>()?,
            code: cur.read_u16::<LittleEndian>()?,
            id: cur.read_u32::<LittleEndian>()?,
        })
    }
}

/// Permitted command-container sizes per operation: `(min, max)` total
/// bytes including the header. `None` means the operation is not
/// supported at all.
pub fn command_size_range(code: u16) -> Option<(u32, u32)> {
    Some(match code {
        op::GET_DEVICE_INFO | op::CLOSE_SESSION | op::GET_STORAGE_IDS | op::SEND_OBJECT => (12, 12),
        op::OPEN_SESSION
        | op::GET_STORAGE_INFO
        | op::GET_OBJECT_INFO
        | op::GET_OBJECT
        | op::GET_THUMB => (16, 16),
        op::GET_NUM_OBJECTS | op::GET_OBJECT_HANDLES => (16, 24),
        op::DELETE_OBJECT => (16, 20),
        op::SEND_OBJECT_INFO => (12, 20),
        _ => return None,
    })
}

/// Parse a command payload into its 32-bit parameters.
pub fn params_from_payload(payload: &[u8]) -> Vec<u32> {
    payload
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Append a PTP string: one count byte (code units including the
/// trailing NUL), then that many little-endian 16-bit units. The empty
/// string is a single zero byte.
///
/// # Errors
///
/// Returns an error for characters outside the Basic Multilingual Plane
/// or strings longer than 254 characters.
pub fn put_ucs2(out: &mut Vec<u8>, s: &str) -> Result<(), ProtoError> {
    if s.is_empty() {
        out.push(0);
        return Ok(());
    }
    let mut units = Vec::with_capacity(s.len() + 1);
    for ch in s.chars() {
        let cp = ch as u32;
        if cp > 0xffff {
            return Err(ProtoError::Unencodable(ch));
        }
        units.push(cp as u16);
    }
    units.push(0);
    if units.len() > u8::MAX as usize {
        return Err(ProtoError::StringTooLong(s.chars().count()));
    }
    out.push(units.len() as u8);
    for unit in units {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    Ok(())
}

/// Read a PTP string from the cursor. The trailing NUL is consumed but
/// not part of the result.
///
/// # Errors
///
/// Returns [`ProtoError::MalformedString`] on truncation or invalid
/// code units.
pub fn get_ucs2(cur: &mut Cursor<&[u8]>) -> Result<String, ProtoError> {
    let count = cur.read_u8().map_err(|_| ProtoError::MalformedString)?;
    let mut s = String::with_capacity(count as usize);
    let mut terminated = count == 0;
    for _ in 0..count {
        let unit = cur
            .read_u16::<LittleEndian>()
            .map_err(|_| ProtoError::MalformedString)?;
        if terminated {
            continue;
        }
        if unit == 0 {
            terminated = true;
            continue;
        }
        let ch = char::from_u32(u32::from(unit)).ok_or(ProtoError::MalformedString)?;
        s.push(ch);
    }
    if !terminated {
        return Err(ProtoError::MalformedString);
    }
    Ok(s)
}

/// Per-object metadata mirroring the PIMA object-info dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub storage_id: u32,
    pub object_format: u16,
    pub protection_status: u16,
    pub object_compressed_size: u32,
    pub thumb_format: u16,
    pub thumb_compressed_size: u32,
    pub thumb_pix_width: u32,
    pub thumb_pix_height: u32,
    pub image_pix_width: u32,
    pub image_pix_height: u32,
    pub image_bit_depth: u32,
    pub parent_object: u32,
    pub association_type: u16,
    pub association_desc: u32,
    pub sequence_number: u32,
    pub filename: String,
    pub capture_date: String,
    pub modification_date: String,
    pub keywords: String,
}

impl ObjectInfo {
    /// A zeroed record with the given format, size and filename, parented
    /// under the model directory.
    pub fn for_file(
        object_format: u16,
        protection_status: u16,
        size: u32,
        filename: String,
        capture_date: String,
    ) -> Self {
        Self {
            storage_id: STORE_ID,
            object_format,
            protection_status,
            object_compressed_size: size,
            thumb_format: 0,
            thumb_compressed_size: 0,
            thumb_pix_width: 0,
            thumb_pix_height: 0,
            image_pix_width: 0,
            image_pix_height: 0,
            image_bit_depth: 0,
            parent_object: MODEL_DIR_HANDLE,
            association_type: 0,
            association_desc: 0,
            sequence_number: 0,
            filename,
            capture_date,
            modification_date: String::new(),
            keywords: String::new(),
        }
    }

    /// The synthetic record for handle 1 or 2.
    pub fn association(name: &str, parent: u32, size: u32) -> Self {
        Self {
            storage_id: STORE_ID,
            object_format: format::ASSOCIATION,
            protection_status: 0,
            object_compressed_size: size,
            thumb_format: 0,
            thumb_compressed_size: 0,
            thumb_pix_width: 0,
            thumb_pix_height: 0,
            image_pix_width: 0,
            image_pix_height: 0,
            image_bit_depth: 0,
            parent_object: parent,
            association_type: ASSOCIATION_GENERIC_FOLDER,
            association_desc: 0,
            sequence_number: 0,
            filename: name.to_owned(),
            capture_date: String::new(),
            modification_date: String::new(),
            keywords: String::new(),
        }
    }

    /// Encode the record into its wire form.
    ///
    /// # Errors
    ///
    /// Fails only when one of the four strings cannot be encoded.
    pub fn encode(&self) -> Result<Vec<u8>, ProtoError> {
        let mut out = Vec::with_capacity(64 + 2 * self.filename.len());
        out.extend_from_slice(&self.storage_id.to_le_bytes());
        out.extend_from_slice(&self.object_format.to_le_bytes());
        out.extend_from_slice(&self.protection_status.to_le_bytes());
        out.extend_from_slice(&self.object_compressed_size.to_le_bytes());
        out.extend_from_slice(&self.thumb_format.to_le_bytes());
        out.extend_from_slice(&self.thumb_compressed_size.to_le_bytes());
        out.extend_from_slice(&self.thumb_pix_width.to_le_bytes());
        out.extend_from_slice(&self.thumb_pix_height.to_le_bytes());
        out.extend_from_slice(&self.image_pix_width.to_le_bytes());
        out.extend_from_slice(&self.image_pix_height.to_le_bytes());
        out.extend_from_slice(&self.image_bit_depth.to_le_bytes());
        out.extend_from_slice(&self.parent_object.to_le_bytes());
        out.extend_from_slice(&self.association_type.to_le_bytes());
        out.extend_from_slice(&self.association_desc.to_le_bytes());
        out.extend_from_slice(&self.sequence_number.to_le_bytes());
        put_ucs2(&mut out, &self.filename)?;
        put_ucs2(&mut out, &self.capture_date)?;
        put_ucs2(&mut out, &self.modification_date)?;
        put_ucs2(&mut out, &self.keywords)?;
        Ok(out)
    }

    /// Decode a record from a data-phase payload.
    ///
    /// # Errors
    ///
    /// Returns an error when the fixed fields or any string are
    /// truncated or malformed.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtoError> {
        let mut cur = Cursor::new(buf);
        Ok(Self {
            storage_id: cur.read_u32::<LittleEndian>()?,
            object_format: cur.read_u16::<LittleEndian>()?,
            protection_status: cur.read_u16::<LittleEndian>()?,
            object_compressed_size: cur.read_u32::<LittleEndian>()?,
            thumb_format: cur.read_u16::<LittleEndian>()?,
            thumb_compressed_size: cur.read_u32::<LittleEndian>()?,
            thumb_pix_width: cur.read_u32::<LittleEndian>()?,
            thumb_pix_height: cur.read_u32::<LittleEndian>()?,
            image_pix_width: cur.read_u32::<LittleEndian>()?,
            image_pix_height: cur.read_u32::<LittleEndian>()?,
            image_bit_depth: cur.read_u32::<LittleEndian>()?,
            parent_object: cur.read_u32::<LittleEndian>()?,
            association_type: cur.read_u16::<LittleEndian>()?,
            association_desc: cur.read_u32::<LittleEndian>()?,
            sequence_number: cur.read_u32::<LittleEndian>()?,
            filename: get_ucs2(&mut cur)?,
            capture_date: get_ucs2(&mut cur)?,
            modification_date: get_ucs2(&mut cur)?,
            keywords: get_ucs2(&mut cur)?,
        })
    }
}

/// Encode the fixed device-info dataset: standard version 1.00, no
/// vendor extension, the supported operation and image-format arrays,
/// manufacturer and model strings, empty version and serial number.
///
/// # Errors
///
/// Fails only if the identity constants cannot be encoded.
pub fn encode_device_info() -> Result<Vec<u8>, ProtoError> {
    let mut out = Vec::with_capacity(128);
    out.extend_from_slice(&100u16.to_le_bytes()); // StandardVersion 1.00
    out.extend_from_slice(&0u32.to_le_bytes()); // VendorExtensionID
    out.extend_from_slice(&0u16.to_le_bytes()); // VendorExtensionVersion
    out.push(0); // VendorExtensionDesc
    out.extend_from_slice(&0u16.to_le_bytes()); // FunctionalMode
    out.extend_from_slice(&(SUPPORTED_OPERATIONS.len() as u32).to_le_bytes());
    for code in SUPPORTED_OPERATIONS {
        out.extend_from_slice(&code.to_le_bytes());
    }
    out.extend_from_slice(&0u32.to_le_bytes()); // EventsSupported
    out.extend_from_slice(&0u32.to_le_bytes()); // DevicePropertiesSupported
    out.extend_from_slice(&0u32.to_le_bytes()); // CaptureFormats
    out.extend_from_slice(&(SUPPORTED_FORMATS.len() as u32).to_le_bytes());
    for code in SUPPORTED_FORMATS {
        out.extend_from_slice(&code.to_le_bytes());
    }
    put_ucs2(&mut out, MANUFACTURER)?;
    put_ucs2(&mut out, MODEL)?;
    out.push(0); // DeviceVersion
    out.push(0); // SerialNumber
    Ok(out)
}

/// Encode the storage-info dataset for the single removable-RAM DCF
/// store with the given capacity and free space.
///
/// # Errors
///
/// Fails only if the storage description cannot be encoded.
pub fn encode_storage_info(max_capacity: u64, free_space: u64) -> Result<Vec<u8>, ProtoError> {
    let mut out = Vec::with_capacity(48);
    out.extend_from_slice(&STORAGE_REMOVABLE_RAM.to_le_bytes());
    out.extend_from_slice(&FILESYSTEM_DCF.to_le_bytes());
    out.extend_from_slice(&ACCESS_CAP_RW.to_le_bytes());
    out.extend_from_slice(&max_capacity.to_le_bytes());
    out.extend_from_slice(&free_space.to_le_bytes());
    out.extend_from_slice(&PARAM_ANY.to_le_bytes()); // FreeSpaceInImages
    put_ucs2(&mut out, STORAGE_DESC)?;
    out.push(0); // VolumeLabel
    Ok(out)
}
