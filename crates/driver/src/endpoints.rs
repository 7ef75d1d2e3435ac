//! Endpoint resolution
//!
//! Finds the interrupt notification endpoint and the bulk IN/OUT data
//! endpoints of a CDC-ACM device, claiming the interfaces they live on.
//!
//! Two layouts are handled:
//! - one combined interface (common on cheap ACM devices): endpoints are
//!   classified by direction and transfer type
//! - the conventional split layout: interface 0 is the communication
//!   interface (endpoint 0 is the notification endpoint), interface 1 is the
//!   data interface (endpoint 1 reads, endpoint 0 writes)

use crate::error::{AcmError, Result};
use common::{Direction, EndpointInfo, InterfaceInfo, TransferType, UsbConnection};
use tracing::{debug, warn};

/// Minimum number of endpoints on a combined interface
const REQUIRED_ENDPOINTS: usize = 3;

/// What an endpoint is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointRole {
    Control,
    Read,
    Write,
}

impl EndpointRole {
    /// Role implied by an endpoint's (direction, transfer type) pair
    pub fn classify(endpoint: &EndpointInfo) -> Option<Self> {
        match (endpoint.direction, endpoint.transfer_type) {
            (Direction::In, TransferType::Interrupt) => Some(EndpointRole::Control),
            (Direction::In, TransferType::Bulk) => Some(EndpointRole::Read),
            (Direction::Out, TransferType::Bulk) => Some(EndpointRole::Write),
            _ => None,
        }
    }
}

/// Endpoints of a claimed CDC-ACM device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEndpoints {
    pub control: EndpointInfo,
    pub read: EndpointInfo,
    pub write: EndpointInfo,
    /// Interface number class requests are addressed to
    pub control_interface: u8,
    /// Interfaces claimed during resolution, to be released on close
    pub claimed: Vec<u8>,
}

/// Resolve and claim the three endpoints of `conn`
///
/// On failure every interface claimed so far has been released again.
pub fn resolve<C: UsbConnection>(conn: &mut C) -> Result<ResolvedEndpoints> {
    let interfaces = conn.interfaces().to_vec();

    match interfaces.len() {
        0 => Err(AcmError::EndpointsNotFound),
        1 => {
            debug!("Device might be a castrated ACM device, trying single interface logic");
            resolve_single(conn, &interfaces[0])
        }
        count => {
            debug!("Trying default interface logic, count={}", count);
            resolve_split(conn, &interfaces[0], &interfaces[1])
        }
    }
}

fn resolve_single<C: UsbConnection>(
    conn: &mut C,
    interface: &InterfaceInfo,
) -> Result<ResolvedEndpoints> {
    claim(conn, interface.number)?;

    let found = interface.endpoints.len();
    if found < REQUIRED_ENDPOINTS {
        release_all(conn, &[interface.number]);
        return Err(AcmError::InsufficientEndpoints(format!(
            "not enough endpoints - need {}, got {}",
            REQUIRED_ENDPOINTS, found
        )));
    }

    let mut control = None;
    let mut read = None;
    let mut write = None;

    for endpoint in &interface.endpoints {
        match EndpointRole::classify(endpoint) {
            Some(EndpointRole::Control) => {
                debug!("Found controlling endpoint {:#04x}", endpoint.address);
                control = Some(*endpoint);
            }
            Some(EndpointRole::Read) => {
                debug!("Found reading endpoint {:#04x}", endpoint.address);
                read = Some(*endpoint);
            }
            Some(EndpointRole::Write) => {
                debug!("Found writing endpoint {:#04x}", endpoint.address);
                write = Some(*endpoint);
            }
            None => {}
        }

        if control.is_some() && read.is_some() && write.is_some() {
            debug!("Found all endpoints");
            break;
        }
    }

    finish(conn, control, read, write, interface.number, vec![interface.number])
}

fn resolve_split<C: UsbConnection>(
    conn: &mut C,
    control_iface: &InterfaceInfo,
    data_iface: &InterfaceInfo,
) -> Result<ResolvedEndpoints> {
    claim(conn, control_iface.number)?;
    let control = control_iface.endpoints.first().copied();

    if let Err(e) = claim(conn, data_iface.number) {
        release_all(conn, &[control_iface.number]);
        return Err(e);
    }
    let read = data_iface.endpoints.get(1).copied();
    let write = data_iface.endpoints.first().copied();

    finish(
        conn,
        control,
        read,
        write,
        control_iface.number,
        vec![control_iface.number, data_iface.number],
    )
}

fn finish<C: UsbConnection>(
    conn: &mut C,
    control: Option<EndpointInfo>,
    read: Option<EndpointInfo>,
    write: Option<EndpointInfo>,
    control_interface: u8,
    claimed: Vec<u8>,
) -> Result<ResolvedEndpoints> {
    match (control, read, write) {
        (Some(control), Some(read), Some(write)) => Ok(ResolvedEndpoints {
            control,
            read,
            write,
            control_interface,
            claimed,
        }),
        _ => {
            let missing: Vec<&str> = [
                ("control", control.is_none()),
                ("read", read.is_none()),
                ("write", write.is_none()),
            ]
            .into_iter()
            .filter_map(|(name, absent)| absent.then_some(name))
            .collect();

            release_all(conn, &claimed);
            Err(AcmError::InsufficientEndpoints(format!(
                "missing {} endpoint(s)",
                missing.join(", ")
            )))
        }
    }
}

fn claim<C: UsbConnection>(conn: &mut C, interface: u8) -> Result<()> {
    conn.claim_interface(interface).map_err(|source| {
        warn!("Could not claim interface {}: {}", interface, source);
        AcmError::InterfaceClaimFailed { interface, source }
    })?;
    debug!("Claimed interface {}", interface);
    Ok(())
}

/// Release interfaces, logging rather than failing
pub(crate) fn release_all<C: UsbConnection>(conn: &mut C, interfaces: &[u8]) {
    for &interface in interfaces {
        if let Err(e) = conn.release_interface(interface) {
            warn!("Failed to release interface {}: {}", interface, e);
        }
    }
}
