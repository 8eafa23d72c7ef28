use std::io::Read;

use scursor::{ReadCursor, WriteCursor};

use crate::decode::{BytesDisplay, DecodeLevel};
use crate::error::{FrameParseError, InternalError, RequestError};
use crate::exception::ExceptionCode;
use crate::types::UnitId;

pub(crate) mod constants {
    /// Maximum length of the PDU (function code + data)
    pub(crate) const MAX_ADU_LENGTH: usize = 253;
    /// Size of the MBAP header
    pub(crate) const HEADER_LENGTH: usize = 7;
    /// Maximum size of a Modbus/TCP frame on the wire
    pub(crate) const MAX_FRAME_LENGTH: usize = HEADER_LENGTH + MAX_ADU_LENGTH;
    // cannot be < 1 b/c of the unit identifier
    pub(crate) const MAX_LENGTH_FIELD: usize = MAX_ADU_LENGTH + 1;
}

/// Modbus/TCP transaction identifier, echoed verbatim in the reply
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TxId {
    value: u16,
}

impl TxId {
    pub fn new(value: u16) -> Self {
        TxId { value }
    }

    pub fn to_u16(self) -> u16 {
        self.value
    }
}

/// MBAP fields a reply needs to echo
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub unit_id: UnitId,
    pub tx_id: TxId,
}

impl FrameHeader {
    pub fn new(unit_id: UnitId, tx_id: TxId) -> Self {
        FrameHeader { unit_id, tx_id }
    }
}

/// A fully received ADU: header plus the PDU bytes
pub struct Frame {
    pub header: FrameHeader,
    length: usize,
    adu: [u8; constants::MAX_ADU_LENGTH],
}

impl Frame {
    fn new(header: FrameHeader) -> Frame {
        Frame {
            header,
            length: 0,
            adu: [0; constants::MAX_ADU_LENGTH],
        }
    }

    fn set(&mut self, src: &[u8]) {
        self.adu[0..src.len()].copy_from_slice(src);
        self.length = src.len();
    }

    pub fn payload(&self) -> &[u8] {
        &self.adu[0..self.length]
    }
}

struct MbapDisplay<'a> {
    level: DecodeLevel,
    header: FrameHeader,
    len_field: u16,
    bytes: &'a [u8],
}

impl std::fmt::Display for MbapDisplay<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "tx_id: {:#06X} unit: {} len: {}",
            self.header.tx_id.to_u16(),
            self.header.unit_id,
            self.len_field
        )?;
        if self.level.payload_enabled() {
            write!(f, "{}", BytesDisplay(self.bytes))?;
        }
        Ok(())
    }
}

/// How receiving a frame ended without producing one
pub(crate) enum RecvError {
    /// clean EOF or peer reset
    Closed,
    /// framing or transport fault, fatal for this connection
    Fault(RequestError),
}

impl From<FrameParseError> for RecvError {
    fn from(err: FrameParseError) -> Self {
        RecvError::Fault(err.into())
    }
}

impl From<scursor::ReadError> for RecvError {
    fn from(err: scursor::ReadError) -> Self {
        RecvError::Fault(err.into())
    }
}

/// Reads one length-prefixed MBAP frame at a time from a blocking stream
pub(crate) struct FramedReader {
    decode: DecodeLevel,
}

impl FramedReader {
    pub(crate) fn new(decode: DecodeLevel) -> Self {
        Self { decode }
    }

    /// Read exactly one frame. Must only be called when the stream is
    /// readable; trailing bytes of a partially received frame are awaited
    /// with the socket's receive timeout.
    pub(crate) fn read_frame(&self, io: &mut impl Read) -> Result<Frame, RecvError> {
        let mut header = [0u8; constants::HEADER_LENGTH];
        read_all(io, &mut header)?;

        let (frame_header, len_field, adu_length) = parse_header(&header)?;

        let mut body = [0u8; constants::MAX_ADU_LENGTH];
        read_all(io, &mut body[..adu_length])?;

        let mut frame = Frame::new(frame_header);
        frame.set(&body[..adu_length]);

        if self.decode.enabled() {
            tracing::info!(
                "MBAP RX - {}",
                MbapDisplay {
                    level: self.decode,
                    header: frame_header,
                    len_field,
                    bytes: frame.payload(),
                }
            );
        }

        Ok(frame)
    }
}

fn parse_header(bytes: &[u8]) -> Result<(FrameHeader, u16, usize), RecvError> {
    let mut cursor = ReadCursor::new(bytes);
    let tx_id = TxId::new(cursor.read_u16_be()?);
    let protocol_id = cursor.read_u16_be()?;
    let len_field = cursor.read_u16_be()?;
    let unit_id = UnitId::new(cursor.read_u8()?);

    if protocol_id != 0 {
        return Err(FrameParseError::UnknownProtocolId(protocol_id).into());
    }

    let length = len_field as usize;
    if length > constants::MAX_LENGTH_FIELD {
        return Err(FrameParseError::MbapLengthTooBig(length, constants::MAX_LENGTH_FIELD).into());
    }

    // the length field counts the unit identifier, so it must be > 0
    let adu_length = length
        .checked_sub(1)
        .ok_or(FrameParseError::MbapLengthZero)?;

    Ok((FrameHeader::new(unit_id, tx_id), len_field, adu_length))
}

/// read_exact, but peer shutdown at any point maps to `RecvError::Closed`
fn read_all(io: &mut impl Read, buf: &mut [u8]) -> Result<(), RecvError> {
    let mut filled = 0;
    while filled < buf.len() {
        match io.read(&mut buf[filled..]) {
            Ok(0) => return Err(RecvError::Closed),
            Ok(count) => filled += count,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionAborted
                ) =>
            {
                return Err(RecvError::Closed)
            }
            Err(err) => return Err(RecvError::Fault(err.into())),
        }
    }
    Ok(())
}

/// Trait for reply bodies that know how to serialize themselves into a PDU
pub(crate) trait Serialize {
    fn serialize(&self, cursor: &mut WriteCursor) -> Result<(), RequestError>;
}

impl Serialize for ExceptionCode {
    fn serialize(&self, cursor: &mut WriteCursor) -> Result<(), RequestError> {
        cursor.write_u8((*self).into())?;
        Ok(())
    }
}

/// Formats reply frames into an internal buffer that is reused across
/// requests and connections
pub(crate) struct FrameWriter {
    buffer: [u8; constants::MAX_FRAME_LENGTH],
    length: usize,
    decode: DecodeLevel,
}

impl FrameWriter {
    pub(crate) fn new(decode: DecodeLevel) -> Self {
        Self {
            buffer: [0; constants::MAX_FRAME_LENGTH],
            length: 0,
            decode,
        }
    }

    /// The most recently formatted reply
    pub(crate) fn reply(&self) -> &[u8] {
        &self.buffer[..self.length]
    }

    pub(crate) fn format_reply(
        &mut self,
        header: FrameHeader,
        function: crate::function::FunctionCode,
        body: &dyn Serialize,
    ) -> Result<(), RequestError> {
        self.format(header, function.get_value(), body)
    }

    pub(crate) fn format_exception(
        &mut self,
        header: FrameHeader,
        raw_function: u8,
        ex: ExceptionCode,
    ) -> Result<(), RequestError> {
        self.format(header, raw_function | 0x80, &ex)
    }

    fn format(
        &mut self,
        header: FrameHeader,
        function: u8,
        body: &dyn Serialize,
    ) -> Result<(), RequestError> {
        let decode = self.decode;
        let (length, len_field) = {
            let mut cursor = WriteCursor::new(&mut self.buffer);
            cursor.write_u16_be(header.tx_id.to_u16())?;
            cursor.write_u16_be(0)?; // protocol id
            let len_pos = cursor.position();
            cursor.skip(2)?; // write the length later
            cursor.write_u8(header.unit_id.value)?;

            let start_pdu = cursor.position();
            cursor.write_u8(function)?;
            body.serialize(&mut cursor)?;
            let end_pdu = cursor.position();

            // the length field includes the unit identifier
            let len_field = (end_pdu - start_pdu + 1) as u16;
            if len_field as usize > constants::MAX_LENGTH_FIELD {
                return Err(InternalError::FrameTooBig.into());
            }
            cursor.seek_to(len_pos)?;
            cursor.write_u16_be(len_field)?;
            cursor.seek_to(end_pdu)?;

            (end_pdu, len_field)
        };
        self.length = length;

        if decode.enabled() {
            tracing::info!(
                "MBAP TX - {}",
                MbapDisplay {
                    level: decode,
                    header,
                    len_field,
                    bytes: &self.buffer[constants::HEADER_LENGTH..length],
                }
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::FunctionCode;

    //                            |   tx id  |  proto id |  length  | unit | fc | body      |
    const SIMPLE_FRAME: &[u8] = &[0x00, 0x07, 0x00, 0x00, 0x00, 0x04, 0x2A, 0x01, 0xCA, 0xFE];

    struct MockBody {
        body: &'static [u8],
    }

    impl Serialize for MockBody {
        fn serialize(&self, cursor: &mut WriteCursor) -> Result<(), RequestError> {
            for b in self.body {
                cursor.write_u8(*b)?;
            }
            Ok(())
        }
    }

    fn read_from(bytes: &[u8]) -> Result<Frame, RecvError> {
        let mut io = std::io::Cursor::new(bytes.to_vec());
        FramedReader::new(DecodeLevel::nothing()).read_frame(&mut io)
    }

    #[test]
    fn can_parse_simple_frame() {
        let frame = read_from(SIMPLE_FRAME).ok().unwrap();
        assert_eq!(frame.header.tx_id, TxId::new(0x0007));
        assert_eq!(frame.header.unit_id, UnitId::new(0x2A));
        assert_eq!(frame.payload(), &[0x01, 0xCA, 0xFE]);
    }

    #[test]
    fn can_parse_maximum_size_frame() {
        // maximum ADU length is 253, so the max length field value is 254
        let mut bytes = vec![0x00, 0x07, 0x00, 0x00, 0x00, 0xFE, 0x2A];
        bytes.extend_from_slice(&[0xCC; 253]);
        let frame = read_from(&bytes).ok().unwrap();
        assert_eq!(frame.payload(), [0xCC; 253].as_ref());
    }

    #[test]
    fn eof_mid_frame_reads_as_closed() {
        assert!(matches!(
            read_from(&SIMPLE_FRAME[..4]),
            Err(RecvError::Closed)
        ));
    }

    #[test]
    fn errors_on_bad_protocol_id() {
        let frame = &[0x00, 0x07, 0xCA, 0xFE, 0x00, 0x01, 0x2A];
        assert!(matches!(
            read_from(frame),
            Err(RecvError::Fault(RequestError::BadFrame(
                FrameParseError::UnknownProtocolId(0xCAFE)
            )))
        ));
    }

    #[test]
    fn errors_on_length_of_zero() {
        let frame = &[0x00, 0x07, 0x00, 0x00, 0x00, 0x00, 0x2A];
        assert!(matches!(
            read_from(frame),
            Err(RecvError::Fault(RequestError::BadFrame(
                FrameParseError::MbapLengthZero
            )))
        ));
    }

    #[test]
    fn errors_when_mbap_length_too_big() {
        let frame = &[0x00, 0x07, 0x00, 0x00, 0x00, 0xFF, 0x2A];
        assert!(matches!(
            read_from(frame),
            Err(RecvError::Fault(RequestError::BadFrame(
                FrameParseError::MbapLengthTooBig(0xFF, constants::MAX_LENGTH_FIELD)
            )))
        ));
    }

    #[test]
    fn correctly_formats_frame() {
        let mut writer = FrameWriter::new(DecodeLevel::nothing());
        writer
            .format_reply(
                FrameHeader::new(UnitId::new(42), TxId::new(7)),
                FunctionCode::ReadCoils,
                &MockBody {
                    body: &[0xCA, 0xFE],
                },
            )
            .unwrap();
        assert_eq!(writer.reply(), SIMPLE_FRAME);
    }

    #[test]
    fn correctly_formats_exception() {
        let mut writer = FrameWriter::new(DecodeLevel::nothing());
        writer
            .format_exception(
                FrameHeader::new(UnitId::new(1), TxId::new(2)),
                FunctionCode::ReadHoldingRegisters.get_value(),
                ExceptionCode::IllegalDataAddress,
            )
            .unwrap();
        assert_eq!(
            writer.reply(),
            &[0x00, 0x02, 0x00, 0x00, 0x00, 0x03, 0x01, 0x83, 0x02]
        );
    }
}
