use crate::constants::exceptions;

/// Exception codes defined in the Modbus specification.
///
/// Only the codes this server can emit are modeled explicitly; anything else
/// is carried through as [`ExceptionCode::Unknown`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ExceptionCode {
    /// The function code received in the query is not an allowable action for the server
    IllegalFunction,
    /// The data address received in the query is not an allowable address for the server
    IllegalDataAddress,
    /// A value contained in the request is not an allowable value for the server
    IllegalDataValue,
    /// An unrecoverable error occurred while the server was attempting to perform the
    /// requested action
    ServerDeviceFailure,
    /// An exception code not defined in the standard
    Unknown(u8),
}

impl From<ExceptionCode> for u8 {
    fn from(ex: ExceptionCode) -> Self {
        match ex {
            ExceptionCode::IllegalFunction => exceptions::ILLEGAL_FUNCTION,
            ExceptionCode::IllegalDataAddress => exceptions::ILLEGAL_DATA_ADDRESS,
            ExceptionCode::IllegalDataValue => exceptions::ILLEGAL_DATA_VALUE,
            ExceptionCode::ServerDeviceFailure => exceptions::SERVER_DEVICE_FAILURE,
            ExceptionCode::Unknown(value) => value,
        }
    }
}

impl From<u8> for ExceptionCode {
    fn from(value: u8) -> Self {
        match value {
            exceptions::ILLEGAL_FUNCTION => ExceptionCode::IllegalFunction,
            exceptions::ILLEGAL_DATA_ADDRESS => ExceptionCode::IllegalDataAddress,
            exceptions::ILLEGAL_DATA_VALUE => ExceptionCode::IllegalDataValue,
            exceptions::SERVER_DEVICE_FAILURE => ExceptionCode::ServerDeviceFailure,
            _ => ExceptionCode::Unknown(value),
        }
    }
}

impl std::error::Error for ExceptionCode {}

impl std::fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        match self {
            ExceptionCode::IllegalFunction => {
                f.write_str("function code is not an allowable action for the server")
            }
            ExceptionCode::IllegalDataAddress => {
                f.write_str("data address is not an allowable address for the server")
            }
            ExceptionCode::IllegalDataValue => {
                f.write_str("value in the request is not an allowable value for the server")
            }
            ExceptionCode::ServerDeviceFailure => {
                f.write_str("unrecoverable error occurred while performing the requested action")
            }
            ExceptionCode::Unknown(code) => write!(f, "non-standard exception code: {code}"),
        }
    }
}
