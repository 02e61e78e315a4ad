//! Line settings and error classification for the `tokio-modbus` transport.
use crate::transport::TransportError;

/// Modbus slave id of a unit with factory settings.
pub const DEFAULT_DEVICE_ADDRESS: u8 = 1;
/// Highest assignable Modbus slave id.
pub const DEVICE_ADDRESS_MAX: u8 = 247;
/// Baud rate of a unit with factory settings.
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// The parity used for serial communication.
#[cfg(feature = "tokio-rtu")]
pub const PARITY: &tokio_serial::Parity = &tokio_serial::Parity::None;
/// The number of stop bits used for serial communication.
#[cfg(feature = "tokio-rtu")]
pub const STOP_BITS: &tokio_serial::StopBits = &tokio_serial::StopBits::One;
/// The number of data bits used for serial communication.
#[cfg(feature = "tokio-rtu")]
pub const DATA_BITS: &tokio_serial::DataBits = &tokio_serial::DataBits::Eight;

/// Creates a `tokio_serial::SerialPortBuilder` with the line settings of the unit.
///
/// # Arguments
///
/// * `device` - The path to the serial port device (e.g., `/dev/ttyUSB0`).
/// * `baud_rate` - The baud rate configured on the unit.
#[cfg(feature = "tokio-rtu")]
pub fn serial_port_builder(device: &str, baud_rate: u32) -> tokio_serial::SerialPortBuilder {
    tokio_serial::new(device, baud_rate)
        .parity(*PARITY)
        .stop_bits(*STOP_BITS)
        .data_bits(*DATA_BITS)
        .flow_control(tokio_serial::FlowControl::None)
}

impl From<tokio_modbus::ExceptionCode> for TransportError {
    fn from(code: tokio_modbus::ExceptionCode) -> Self {
        TransportError::Nack(code.to_string())
    }
}

impl From<tokio_modbus::Error> for TransportError {
    fn from(err: tokio_modbus::Error) -> Self {
        TransportError::Link(err.to_string())
    }
}

/// Flattens a `tokio-modbus` result: exceptions become [`TransportError::Nack`],
/// I/O and protocol failures [`TransportError::Link`].
pub(crate) fn map_tokio_result<T>(result: tokio_modbus::Result<T>) -> Result<T, TransportError> {
    match result {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(exception)) => Err(exception.into()),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn exceptions_are_nacks() {
        let result: tokio_modbus::Result<u16> =
            Ok(Err(tokio_modbus::ExceptionCode::IllegalDataAddress));
        assert_matches!(map_tokio_result(result), Err(TransportError::Nack(_)));
    }

    #[test]
    fn io_failures_are_link_faults() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out");
        let result: tokio_modbus::Result<u16> = Err(tokio_modbus::Error::Transport(io));
        assert_matches!(
            map_tokio_result(result),
            Err(TransportError::Link(message)) if message.contains("timed out")
        );
    }

    #[test]
    fn values_pass_through() {
        let result: tokio_modbus::Result<Vec<u16>> = Ok(Ok(vec![215]));
        assert_eq!(map_tokio_result(result), Ok(vec![215]));
    }
}
