//! The FunctionFS side of the gadget: endpoint files, the descriptor
//! and strings blobs written to ep0 at bind time, event-record parsing
//! and the endpoint ioctls.
//!
//! The function mounts at a fixed prefix with four endpoint files:
//! ep0 (control, bidirectional), ep1 (bulk-in), ep2 (bulk-out) and
//! ep3 (interrupt-in).

use std::fs::{File, OpenOptions};
use std::io::{self, Write as _};
use std::os::fd::AsRawFd;

pub const EP0: &str = "/dev/ptp/ep0";
pub const EP_BULK_IN: &str = "/dev/ptp/ep1";
pub const EP_BULK_OUT: &str = "/dev/ptp/ep2";
pub const EP_INTERRUPT: &str = "/dev/ptp/ep3";

/// Interface string presented to the host.
pub const INTERFACE_NAME: &str = "PTP Interface";

const DESCRIPTORS_MAGIC: u32 = 1;
const STRINGS_MAGIC: u32 = 2;

const USB_DT_INTERFACE: u8 = 4;
const USB_DT_ENDPOINT: u8 = 5;
const USB_CLASS_STILL_IMAGE: u8 = 6;
const USB_SC_IMAGE_CAPTURE: u8 = 1;
const USB_PR_CB: u8 = 1; // control/bulk without interrupt
const USB_DIR_IN: u8 = 0x80;
const XFER_BULK: u8 = 2;
const XFER_INT: u8 = 3;

/// Bulk max-packet size on a high-speed link.
const MAX_PACKET_HS: u16 = 512;
/// Interrupt endpoint packet size.
const STATUS_MAXPACKET: u16 = 8;

// _IO('g', n) requests from linux/usb/functionfs.h.
pub const FUNCTIONFS_FIFO_STATUS: libc::c_ulong = 0x6701;
pub const FUNCTIONFS_FIFO_FLUSH: libc::c_ulong = 0x6702;
pub const FUNCTIONFS_CLEAR_HALT: libc::c_ulong = 0x6703;

/// Size of one `usb_functionfs_event` record.
pub const EVENT_SIZE: usize = 12;
/// How many events one control read may deliver.
pub const EVENT_BATCH: usize = 5;

/// Function-level lifecycle transitions reported on ep0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Bind,
    Unbind,
    Enable,
    Disable,
    Setup,
    Suspend,
    Resume,
}

impl EventType {
    fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Self::Bind,
            1 => Self::Unbind,
            2 => Self::Enable,
            3 => Self::Disable,
            4 => Self::Setup,
            5 => Self::Suspend,
            6 => Self::Resume,
            _ => return None,
        })
    }
}

/// A USB setup packet, carried by [`EventType::Setup`] events.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetupRequest {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

/// One parsed control-endpoint event.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub kind: EventType,
    /// Meaningful only for [`EventType::Setup`].
    pub setup: SetupRequest,
}

/// Split a control read into event records. Truncated or unknown
/// records are logged and skipped.
pub fn parse_events(buf: &[u8]) -> Vec<Event> {
    let mut events = Vec::with_capacity(buf.len() / EVENT_SIZE);
    for record in buf.chunks(EVENT_SIZE) {
        if record.len() < EVENT_SIZE {
            log::warn!("truncated event record ({} bytes)", record.len());
            continue;
        }
        let Some(kind) = EventType::from_raw(record[8]) else {
            log::warn!("unhandled event type {}", record[8]);
            continue;
        };
        // The setup packet occupies the first eight bytes of the record.
        let setup = SetupRequest {
            request_type: record[0],
            request: record[1],
            value: u16::from_le_bytes([record[2], record[3]]),
            index: u16::from_le_bytes([record[4], record[5]]),
            length: u16::from_le_bytes([record[6], record[7]]),
        };
        events.push(Event { kind, setup });
    }
    events
}

fn endpoint_descriptor(address: u8, attributes: u8, max_packet: u16, interval: u8) -> [u8; 7] {
    [
        7,
        USB_DT_ENDPOINT,
        address,
        attributes,
        max_packet.to_le_bytes()[0],
        max_packet.to_le_bytes()[1],
        interval,
    ]
}

fn interface_descriptor() -> [u8; 9] {
    [
        9,
        USB_DT_INTERFACE,
        0, // bInterfaceNumber
        0, // bAlternateSetting
        3, // bNumEndpoints
        USB_CLASS_STILL_IMAGE,
        USB_SC_IMAGE_CAPTURE,
        USB_PR_CB,
        1, // iInterface
    ]
}

fn speed_descriptors(bulk_max_packet: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(30);
    out.extend_from_slice(&interface_descriptor());
    out.extend_from_slice(&endpoint_descriptor(1 | USB_DIR_IN, XFER_BULK, bulk_max_packet, 0));
    out.extend_from_slice(&endpoint_descriptor(2, XFER_BULK, bulk_max_packet, 0));
    out.extend_from_slice(&endpoint_descriptor(
        3 | USB_DIR_IN,
        XFER_INT,
        STATUS_MAXPACKET,
        10,
    ));
    out
}

/// The descriptor blob written to ep0 at bind: one still-image
/// interface with three endpoints, in full-speed and high-speed
/// variants.
pub fn descriptors() -> Vec<u8> {
    let fs = speed_descriptors(0);
    let hs = speed_descriptors(MAX_PACKET_HS);
    let length = 16 + fs.len() + hs.len();

    let mut out = Vec::with_capacity(length);
    out.extend_from_slice(&DESCRIPTORS_MAGIC.to_le_bytes());
    out.extend_from_slice(&(length as u32).to_le_bytes());
    out.extend_from_slice(&4u32.to_le_bytes()); // fs_count
    out.extend_from_slice(&4u32.to_le_bytes()); // hs_count
    out.extend_from_slice(&fs);
    out.extend_from_slice(&hs);
    out
}

/// The strings blob: a single en-us interface string.
pub fn strings() -> Vec<u8> {
    let text = INTERFACE_NAME.as_bytes();
    let length = 16 + 2 + text.len() + 1;

    let mut out = Vec::with_capacity(length);
    out.extend_from_slice(&STRINGS_MAGIC.to_le_bytes());
    out.extend_from_slice(&(length as u32).to_le_bytes());
    out.extend_from_slice(&1u32.to_le_bytes()); // str_count
    out.extend_from_slice(&1u32.to_le_bytes()); // lang_count
    out.extend_from_slice(&0x0409u16.to_le_bytes()); // en-us
    out.extend_from_slice(text);
    out.push(0);
    out
}

/// Open an endpoint file for both directions.
///
/// # Errors
///
/// Propagates the open failure; the caller decides whether that is
/// fatal.
pub fn open_endpoint(path: &str) -> io::Result<File> {
    OpenOptions::new().read(true).write(true).open(path)
}

/// Open ep0 and hand the kernel our descriptors and strings.
///
/// # Errors
///
/// Fails when the endpoint cannot be opened or either blob is
/// rejected.
pub fn init_control() -> io::Result<File> {
    let mut ep0 = open_endpoint(EP0)?;
    ep0.write_all(&descriptors())?;
    ep0.write_all(&strings())?;
    log::info!("descriptors written to {EP0}");
    Ok(ep0)
}

/// Clear the halt condition on a bulk endpoint after a device reset.
///
/// # Errors
///
/// Propagates the ioctl failure.
pub fn clear_halt(ep: &File) -> io::Result<()> {
    if unsafe { libc::ioctl(ep.as_raw_fd(), FUNCTIONFS_CLEAR_HALT as _) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Drain unclaimed FIFO state before closing an endpoint. `ENODEV` is
/// expected after a disconnect and stays quiet.
pub fn cleanup_endpoint(ep: &File, name: &str) {
    let unclaimed = unsafe { libc::ioctl(ep.as_raw_fd(), FUNCTIONFS_FIFO_STATUS as _) };
    if unclaimed < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ENODEV) {
            log::warn!("fifo status on {name}: {err}");
        }
        return;
    }
    if unclaimed > 0 {
        log::debug!("{name}: {unclaimed} unclaimed bytes, flushing");
        if unsafe { libc::ioctl(ep.as_raw_fd(), FUNCTIONFS_FIFO_FLUSH as _) } < 0 {
            log::warn!("fifo flush on {name}: {}", io::Error::last_os_error());
        }
    }
}
