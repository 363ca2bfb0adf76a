//! Error taxonomy for the mass-storage host.
//!
//! Kinds follow the layering of the stack: transport faults (USB), protocol
//! faults (BOT framing), SCSI check conditions, medium state, device
//! topology, and host-side resource exhaustion. Filesystem-driver errors
//! use the errno-style [`Errno`](crate::fs::Errno) type instead and only
//! cross into this enum at the mount boundary.

use std::time::Duration;

use thiserror::Error;

use crate::fs::Errno;
use crate::scsi::response::SenseData;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // Transport.
    #[error("usb transfer timed out after {0:?}")]
    Timeout(Duration),
    #[error("endpoint stalled")]
    Stall,
    #[error("usb transfer failed: {0}")]
    Transfer(nusb::transfer::TransferError),
    #[error("usb device error: {0}")]
    Usb(#[from] nusb::Error),
    #[error("short transfer: {actual} of {expected} bytes")]
    ShortTransfer { expected: usize, actual: usize },

    // BOT protocol.
    #[error("invalid CSW")]
    BadCsw,
    #[error("CSW tag mismatch: sent {sent:#010x}, received {received:#010x}")]
    TagMismatch { sent: u32, received: u32 },
    #[error("BOT phase error")]
    PhaseError,

    // SCSI.
    #[error("check condition: {0}")]
    CheckCondition(SenseData),

    // Medium.
    #[error("medium not present")]
    MediumNotPresent,
    #[error("logical unit is write-protected")]
    WriteProtected,

    // Topology.
    #[error("interface has no bulk {0} endpoint")]
    MissingEndpoint(&'static str),
    #[error("failed to claim bulk endpoint: {0}")]
    EndpointClaim(String),
    #[error("not a direct-access block device (qualifier {qualifier:#x}, type {device_type:#x})")]
    UnsupportedPeripheral { qualifier: u8, device_type: u8 },
    #[error("unusable geometry: {block_count} blocks of {block_len} bytes")]
    BadGeometry { block_count: u64, block_len: u32 },
    #[error("device exposes no bulk-only mass-storage interface")]
    NotMassStorage,

    // Partition / mount bookkeeping.
    #[error("sector range {lba}+{count} exceeds unit bounds")]
    OutOfRange { lba: u64, count: u64 },
    #[error("malformed {0} structure")]
    BadTable(&'static str),
    #[error("all mount slots are in use")]
    OutOfSlots,
    #[error("host library is already initialized")]
    AlreadyInitialized,
    #[error("hotplug monitor failed to start")]
    MonitorStart,
    #[error("no mounted volume named {0:?}")]
    NoSuchDevice(String),
    #[error("path has no mount-name prefix: {0:?}")]
    BadPath(String),

    // Filesystem driver, at the mount boundary.
    #[error("filesystem error: {0}")]
    Fs(#[from] Errno),
}

impl Error {
    /// True for faults that reset-recovery in the BOT layer may clear.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_)
                | Error::Stall
                | Error::Transfer(_)
                | Error::ShortTransfer { .. }
        )
    }
}

impl From<nusb::transfer::TransferError> for Error {
    fn from(err: nusb::transfer::TransferError) -> Self {
        match err {
            nusb::transfer::TransferError::Stall => Error::Stall,
            other => Error::Transfer(other),
        }
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        use std::io::ErrorKind;
        let kind = match &err {
            Error::Timeout(_) => ErrorKind::TimedOut,
            Error::WriteProtected => ErrorKind::PermissionDenied,
            Error::MediumNotPresent => ErrorKind::NotConnected,
            Error::OutOfRange { .. } => ErrorKind::InvalidInput,
            _ => ErrorKind::Other,
        };
        std::io::Error::new(kind, err)
    }
}
