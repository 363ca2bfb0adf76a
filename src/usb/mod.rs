//! Interactions with the USB host service: interface discovery, endpoint
//! plumbing, and the raw control/bulk transfer primitives everything above
//! is built on.
//!
//! A mass storage stick advertises itself through its interface descriptor:
//! mass storage class (0x08), SCSI transparent command set subclass (0x06),
//! and the bulk-only transport protocol (0x50). Everything after
//! enumeration happens on two bulk endpoints -- one OUT for commands and
//! written data, one IN for read data and status -- plus a pair of
//! class-specific requests (Get Max LUN, Bulk-Only Mass Storage Reset) on
//! the control endpoint.
//!
//! This module deliberately carries no retry or recovery policy: a transfer
//! either moves bytes or reports exactly what went wrong, and the BOT
//! sequencer in [`bot`](crate::usb::bot) decides what to do about it.

pub mod bot;
pub mod cbw;

use std::time::Duration;

use nusb::descriptors::TransferType;
use nusb::transfer::{Bulk, ControlIn, ControlOut, ControlType, Direction, In, Out, Recipient};
use nusb::{Device, DeviceInfo, Endpoint, Interface};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};

/// <https://www.usb.org/defined-class-codes>
pub const MASS_STORAGE_USB_CLASS: u8 = 0x08;

/// SCSI transparent command set.
pub const SCSI_TRANSPARENT_SUBCLASS: u8 = 0x06;

/// Bulk-Only Transport.
pub const BULK_ONLY_PROTOCOL: u8 = 0x50;

/// Class-specific request: Get Max LUN (BOT spec section 3.2).
const REQUEST_GET_MAX_LUN: u8 = 0xFE;

/// Class-specific request: Bulk-Only Mass Storage Reset (BOT spec 3.1).
const REQUEST_BOMSR: u8 = 0xFF;

/// Default bound on a single bulk post. Commodity drives finish a full
/// 8 MiB chunk well inside this even at USB 2.0 rates.
pub const DEFAULT_TRANSFER_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for the short class-specific control requests.
const CONTROL_TIMEOUT: Duration = Duration::from_millis(500);

/// Upper bound on LUNs per device; Get Max LUN reports at most 15.
pub const MAX_LUNS: u8 = 16;

/// Whether one interface of a device speaks MSC Bulk-Only.
pub fn is_bot_interface(class: u8, subclass: u8, protocol: u8) -> bool {
    class == MASS_STORAGE_USB_CLASS
        && subclass == SCSI_TRANSPARENT_SUBCLASS
        && protocol == BULK_ONLY_PROTOCOL
}

/// Returns every USB device currently connected that exposes a bulk-only
/// mass storage interface, with the interface number it was found on.
pub async fn enumerate_bot_devices() -> Result<Vec<(DeviceInfo, u8)>> {
    let all_usb_devices = nusb::list_devices().await?;

    // Each USB device exposes one or more *interfaces* as a way to interact
    // with specific functionality; the MSC triple lives at interface level,
    // so the device-level class bytes are usually zero and useless here.
    let devices = all_usb_devices
        .filter_map(|dev| {
            trace!("scanning usb device: {:04x}:{:04x}", dev.vendor_id(), dev.product_id());
            let num = dev
                .interfaces()
                .find(|iface| is_bot_interface(iface.class(), iface.subclass(), iface.protocol()))
                .map(|iface| iface.interface_number());
            num.map(|num| (dev, num))
        })
        .collect();
    Ok(devices)
}

/// One claimed bulk-only interface: the control pipe plus both bulk
/// endpoints, with a per-post timeout.
///
/// All bulk submissions go through the host service's own DMA-capable
/// buffers, so callers never see an alignment requirement.
pub struct UsbTransport {
    interface: Interface,
    interface_number: u8,
    bulk_in: Endpoint<Bulk, In>,
    bulk_out: Endpoint<Bulk, Out>,
    in_address: u8,
    out_address: u8,
    timeout: Duration,
}

impl UsbTransport {
    /// Claims `interface_number` on an opened device and resolves its bulk
    /// endpoint pair from the interface descriptor. Fails with
    /// [`Error::MissingEndpoint`] when either direction is absent.
    pub async fn open(device: &Device, interface_number: u8) -> Result<Self> {
        debug!(interface_number, "claiming mass storage interface");
        let interface = device.claim_interface(interface_number).await?;

        let mut in_address = None;
        let mut out_address = None;
        for descriptor in interface.descriptors() {
            for endpoint in descriptor.endpoints() {
                if endpoint.transfer_type() != TransferType::Bulk {
                    continue;
                }
                match endpoint.direction() {
                    Direction::In => in_address = Some(endpoint.address()),
                    Direction::Out => out_address = Some(endpoint.address()),
                }
            }
        }

        let in_address = in_address.ok_or(Error::MissingEndpoint("IN"))?;
        let out_address = out_address.ok_or(Error::MissingEndpoint("OUT"))?;
        debug!(in_address, out_address, "resolved bulk endpoint pair");

        let bulk_in = interface
            .endpoint::<Bulk, In>(in_address)
            .map_err(|err| Error::EndpointClaim(err.to_string()))?;
        let bulk_out = interface
            .endpoint::<Bulk, Out>(out_address)
            .map_err(|err| Error::EndpointClaim(err.to_string()))?;

        Ok(Self {
            interface,
            interface_number,
            bulk_in,
            bulk_out,
            in_address,
            out_address,
            timeout: DEFAULT_TRANSFER_TIMEOUT,
        })
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Sends up to `data.len()` bytes on the bulk OUT endpoint, returning
    /// the count actually accepted by the device.
    pub async fn bulk_out(&mut self, data: &[u8]) -> Result<usize> {
        let mut buffer = self.bulk_out.allocate(data.len());
        buffer.extend_from_slice(data);
        self.bulk_out.submit(buffer);

        let completion = match tokio::time::timeout(self.timeout, self.bulk_out.next_complete()).await {
            Ok(completion) => completion,
            Err(_) => {
                // The post cannot be safely abandoned mid-flight; cancel and
                // reap it before reporting the timeout.
                self.bulk_out.cancel_all();
                let _ = self.bulk_out.next_complete().await;
                return Err(Error::Timeout(self.timeout));
            }
        };
        completion.status.map_err(Error::from)?;
        Ok(completion.buffer.len())
    }

    /// Reads up to `len` bytes from the bulk IN endpoint. A short return is
    /// not an error at this layer; the device terminates a transfer early
    /// with a short packet whenever it has less to say.
    pub async fn bulk_in(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buffer = self.bulk_in.allocate(len);
        buffer.set_requested_len(len);
        self.bulk_in.submit(buffer);

        let completion = match tokio::time::timeout(self.timeout, self.bulk_in.next_complete()).await {
            Ok(completion) => completion,
            Err(_) => {
                self.bulk_in.cancel_all();
                let _ = self.bulk_in.next_complete().await;
                return Err(Error::Timeout(self.timeout));
            }
        };
        completion.status.map_err(Error::from)?;
        Ok(completion.buffer.to_vec())
    }

    /// Whether an endpoint currently reports the halt feature, via the
    /// standard GET_STATUS request to the endpoint. Some bridges fail a
    /// bulk transfer with a generic error while the endpoint is in fact
    /// halted; this is how the sequencer tells the two apart.
    pub async fn endpoint_halted(&mut self, direction: Direction) -> Result<bool> {
        let address = match direction {
            Direction::In => self.in_address,
            Direction::Out => self.out_address,
        };
        let request = ControlIn {
            control_type: ControlType::Standard,
            recipient: Recipient::Endpoint,
            request: 0x00, // GET_STATUS
            value: 0,
            index: address as u16,
            length: 2,
        };
        let data = self.interface.control_in(request, CONTROL_TIMEOUT).await?;
        if data.len() < 2 {
            return Err(Error::ShortTransfer {
                expected: 2,
                actual: data.len(),
            });
        }
        // Bit 0 of the endpoint status word is ENDPOINT_HALT.
        Ok(data[0] & 0x01 != 0)
    }

    pub async fn clear_halt_in(&mut self) -> Result<()> {
        debug!("clearing halt on bulk IN endpoint");
        self.bulk_in.clear_halt().await?;
        Ok(())
    }

    pub async fn clear_halt_out(&mut self) -> Result<()> {
        debug!("clearing halt on bulk OUT endpoint");
        self.bulk_out.clear_halt().await?;
        Ok(())
    }

    /// Get Max LUN, BOT spec section 3.2.
    ///
    /// Returns the number of logical units (max LUN + 1). Single-LUN sticks
    /// frequently STALL this request instead of answering; per the spec
    /// that means "one LUN", and both endpoints get their halt cleared
    /// before carrying on.
    pub async fn lun_count(&mut self) -> Result<u8> {
        let request = ControlIn {
            control_type: ControlType::Class,
            recipient: Recipient::Interface,
            request: REQUEST_GET_MAX_LUN,
            value: 0,
            index: self.interface_number as u16,
            length: 1,
        };
        match self.interface.control_in(request, CONTROL_TIMEOUT).await {
            Ok(data) if data.len() == 1 => {
                let count = data[0].saturating_add(1).min(MAX_LUNS);
                debug!(count, "device reported lun count");
                Ok(count)
            }
            Ok(_) => Ok(1),
            Err(nusb::transfer::TransferError::Stall) => {
                warn!("Get Max LUN stalled; assuming a single LUN");
                self.clear_halt_in().await.ok();
                self.clear_halt_out().await.ok();
                Ok(1)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Bulk-Only Mass Storage Reset, BOT spec section 3.1. Readies the
    /// device "for the next CBW" without disturbing its medium state.
    pub async fn mass_storage_reset(&mut self) -> Result<()> {
        let request = ControlOut {
            control_type: ControlType::Class,
            recipient: Recipient::Interface,
            request: REQUEST_BOMSR,
            value: 0,
            index: self.interface_number as u16,
            data: &[],
        };
        self.interface.control_out(request, CONTROL_TIMEOUT).await?;
        Ok(())
    }
}
