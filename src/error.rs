/// Top-level error for receiving and answering a single request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestError {
    /// I/O error while reading or writing the socket
    Io(std::io::ErrorKind),
    /// errors that occur while parsing a frame off the stream
    BadFrame(FrameParseError),
    /// errors that occur while parsing the PDU of a request
    BadAdu(AduParseError),
    /// request parameters are invalid
    BadRequest(InvalidRequest),
    /// errors that should never happen, e.g. running out of write buffer
    Internal(InternalError),
}

impl std::error::Error for RequestError {}

impl std::fmt::Display for RequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            RequestError::Io(kind) => write!(f, "i/o error: {kind:?}"),
            RequestError::BadFrame(err) => write!(f, "{err}"),
            RequestError::BadAdu(err) => write!(f, "{err}"),
            RequestError::BadRequest(err) => write!(f, "{err}"),
            RequestError::Internal(err) => write!(f, "{err}"),
        }
    }
}

/// errors that occur while parsing an MBAP header off the stream
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameParseError {
    /// frame with a length field of zero
    MbapLengthZero,
    /// frame with a length field that exceeds the maximum allowed (actual, maximum)
    MbapLengthTooBig(usize, usize),
    /// frame with a non-Modbus protocol id
    UnknownProtocolId(u16),
}

impl std::error::Error for FrameParseError {}

impl std::fmt::Display for FrameParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            FrameParseError::MbapLengthZero => {
                f.write_str("received frame with the length field set to zero")
            }
            FrameParseError::MbapLengthTooBig(size, max) => write!(
                f,
                "received frame with length ({size}) that exceeds the maximum allowed size ({max})"
            ),
            FrameParseError::UnknownProtocolId(id) => {
                write!(f, "received frame with non-Modbus protocol id: {id}")
            }
        }
    }
}

/// errors that occur while parsing a PDU
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AduParseError {
    /// request is too short to be valid
    InsufficientBytes,
    /// request contains extra trailing bytes
    TrailingBytes,
    /// coil write value is neither ON nor OFF
    UnknownCoilState(u16),
}

impl std::error::Error for AduParseError {}

impl std::fmt::Display for AduParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            AduParseError::InsufficientBytes => f.write_str("request is too short to be valid"),
            AduParseError::TrailingBytes => f.write_str("request contains extra trailing bytes"),
            AduParseError::UnknownCoilState(value) => {
                write!(f, "received coil state with unspecified value: {value:#06X}")
            }
        }
    }
}

/// errors that result from bad request parameters
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvalidRequest {
    /// request contains a count of zero
    CountOfZero,
    /// start and count would overflow the u16 address space (start, count)
    AddressOverflow(u16, u16),
    /// count exceeds what is allowed for the function (count, maximum)
    CountTooLargeForType(u16, u16),
}

impl std::error::Error for InvalidRequest {}

impl std::fmt::Display for InvalidRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            InvalidRequest::CountOfZero => f.write_str("request contains a count of zero"),
            InvalidRequest::AddressOverflow(start, count) => write!(
                f,
                "start ({start}) and count ({count}) would overflow the u16 address space"
            ),
            InvalidRequest::CountTooLargeForType(count, max) => write!(
                f,
                "count of {count} exceeds the maximum allowed count of {max} for this function"
            ),
        }
    }
}

/// errors that indicate a bug in this library
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InternalError {
    /// ran out of space in the reply buffer
    InsufficientWriteSpace,
    /// a formatted reply exceeded the maximum frame size
    FrameTooBig,
}

impl std::error::Error for InternalError {}

impl std::fmt::Display for InternalError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            InternalError::InsufficientWriteSpace => {
                f.write_str("ran out of space while writing a reply")
            }
            InternalError::FrameTooBig => {
                f.write_str("formatted reply exceeds the maximum frame size")
            }
        }
    }
}

impl From<std::io::Error> for RequestError {
    fn from(err: std::io::Error) -> Self {
        RequestError::Io(err.kind())
    }
}

impl From<FrameParseError> for RequestError {
    fn from(err: FrameParseError) -> Self {
        RequestError::BadFrame(err)
    }
}

impl From<AduParseError> for RequestError {
    fn from(err: AduParseError) -> Self {
        RequestError::BadAdu(err)
    }
}

impl From<InvalidRequest> for RequestError {
    fn from(err: InvalidRequest) -> Self {
        RequestError::BadRequest(err)
    }
}

impl From<InternalError> for RequestError {
    fn from(err: InternalError) -> Self {
        RequestError::Internal(err)
    }
}

impl From<scursor::ReadError> for RequestError {
    fn from(_: scursor::ReadError) -> Self {
        AduParseError::InsufficientBytes.into()
    }
}

impl From<scursor::TrailingBytes> for RequestError {
    fn from(_: scursor::TrailingBytes) -> Self {
        AduParseError::TrailingBytes.into()
    }
}

impl From<scursor::WriteError> for RequestError {
    fn from(_: scursor::WriteError) -> Self {
        InternalError::InsufficientWriteSpace.into()
    }
}
