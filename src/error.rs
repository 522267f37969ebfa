/// Errors raised outside the decode path.
///
/// Data-quality problems never show up here: a malformed or missing frame
/// decodes to an absent value instead. This type covers the transport and
/// addressing faults that genuinely stop an exchange.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[cfg(feature = "transport")]
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("battery address {0} outside 1..={max}", max = crate::protocol::MAX_ADDRESS)]
    AddressOutOfRange(u8),
}
