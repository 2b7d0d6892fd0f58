//! Discovery of device addresses.
//!
//! The bench only needs the list of serial ports the operator can assign to
//! boards and the bath. Each entry carries a short description of the adapter so
//! the USB boards can be told apart from built-in ports.
//!
//! ```rust,ignore
//! for port in tdau_hardware::port_resolver::available_ports()? {
//!     println!("{:<16} {}", port.name, port.description);
//! }
//! ```

use serde::Serialize;
use thiserror::Error;

/// Errors that can occur during port discovery.
#[derive(Debug, Error)]
pub enum PortResolveError {
    /// The OS refused to enumerate serial ports.
    #[error("Failed to enumerate serial ports: {0}")]
    Enumeration(String),

    /// Built without the `serial` feature.
    #[error("Serial support is not compiled in")]
    Unsupported,
}

/// A serial port the bench could talk to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortInfo {
    pub name: String,
    pub description: String,
}

/// List available device addresses, sorted by name.
#[cfg(feature = "serial")]
pub fn available_ports() -> Result<Vec<PortInfo>, PortResolveError> {
    let mut ports: Vec<PortInfo> = serialport::available_ports()
        .map_err(|e| PortResolveError::Enumeration(e.to_string()))?
        .into_iter()
        .map(|p| PortInfo {
            description: describe(&p.port_type),
            name: p.port_name,
        })
        .collect();
    ports.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(ports)
}

#[cfg(not(feature = "serial"))]
pub fn available_ports() -> Result<Vec<PortInfo>, PortResolveError> {
    Err(PortResolveError::Unsupported)
}

#[cfg(feature = "serial")]
fn describe(port_type: &serialport::SerialPortType) -> String {
    use serialport::SerialPortType;
    match port_type {
        SerialPortType::UsbPort(usb) => {
            let mut text = format!("USB {:04x}:{:04x}", usb.vid, usb.pid);
            if let Some(manufacturer) = &usb.manufacturer {
                text.push(' ');
                text.push_str(manufacturer);
            }
            if let Some(product) = &usb.product {
                text.push(' ');
                text.push_str(product);
            }
            if let Some(serial) = &usb.serial_number {
                text.push_str(&format!(" (SN {})", serial));
            }
            text
        }
        SerialPortType::PciPort => "PCI".to_string(),
        SerialPortType::BluetoothPort => "Bluetooth".to_string(),
        SerialPortType::Unknown => "unknown".to_string(),
    }
}

#[cfg(all(test, feature = "serial"))]
mod tests {
    use super::*;
    use serialport::SerialPortType;

    #[test]
    fn describes_builtin_ports() {
        assert_eq!(describe(&SerialPortType::PciPort), "PCI");
        assert_eq!(describe(&SerialPortType::BluetoothPort), "Bluetooth");
        assert_eq!(describe(&SerialPortType::Unknown), "unknown");
    }

    #[test]
    fn enumeration_does_not_fail_without_ports() {
        // CI machines usually have no serial hardware; an empty list is fine.
        if let Ok(ports) = available_ports() {
            assert!(ports.windows(2).all(|w| w[0].name <= w[1].name));
        }
    }
}
