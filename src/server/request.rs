use scursor::ReadCursor;

use crate::error::RequestError;
use crate::frame::{FrameHeader, FrameWriter};
use crate::function::FunctionCode;
use crate::server::handler::RequestHandler;
use crate::server::response::{BitReply, RegisterReply};
use crate::types::{
    AddressRange, BitIterator, Indexed, ReadBitsRange, ReadRegistersRange, RegisterIterator,
    WriteCoils, WriteRegisters,
};

/// A fully parsed and validated request PDU
#[derive(Debug)]
pub(crate) enum Request<'a> {
    ReadCoils(ReadBitsRange),
    ReadDiscreteInputs(ReadBitsRange),
    ReadHoldingRegisters(ReadRegistersRange),
    ReadInputRegisters(ReadRegistersRange),
    WriteSingleCoil(Indexed<bool>),
    WriteSingleRegister(Indexed<u16>),
    WriteMultipleCoils(WriteCoils<'a>),
    WriteMultipleRegisters(WriteRegisters<'a>),
    ReadWriteMultipleRegisters(ReadRegistersRange, WriteRegisters<'a>),
}

impl<'a> Request<'a> {
    pub(crate) fn get_function(&self) -> FunctionCode {
        match self {
            Request::ReadCoils(_) => FunctionCode::ReadCoils,
            Request::ReadDiscreteInputs(_) => FunctionCode::ReadDiscreteInputs,
            Request::ReadHoldingRegisters(_) => FunctionCode::ReadHoldingRegisters,
            Request::ReadInputRegisters(_) => FunctionCode::ReadInputRegisters,
            Request::WriteSingleCoil(_) => FunctionCode::WriteSingleCoil,
            Request::WriteSingleRegister(_) => FunctionCode::WriteSingleRegister,
            Request::WriteMultipleCoils(_) => FunctionCode::WriteMultipleCoils,
            Request::WriteMultipleRegisters(_) => FunctionCode::WriteMultipleRegisters,
            Request::ReadWriteMultipleRegisters(_, _) => FunctionCode::ReadWriteMultipleRegisters,
        }
    }

    pub(crate) fn parse(
        function: FunctionCode,
        cursor: &mut ReadCursor<'a>,
    ) -> Result<Self, RequestError> {
        match function {
            FunctionCode::ReadCoils => {
                let x = Request::ReadCoils(AddressRange::parse(cursor)?.of_read_bits()?);
                cursor.expect_empty()?;
                Ok(x)
            }
            FunctionCode::ReadDiscreteInputs => {
                let x = Request::ReadDiscreteInputs(AddressRange::parse(cursor)?.of_read_bits()?);
                cursor.expect_empty()?;
                Ok(x)
            }
            FunctionCode::ReadHoldingRegisters => {
                let x =
                    Request::ReadHoldingRegisters(AddressRange::parse(cursor)?.of_read_registers()?);
                cursor.expect_empty()?;
                Ok(x)
            }
            FunctionCode::ReadInputRegisters => {
                let x =
                    Request::ReadInputRegisters(AddressRange::parse(cursor)?.of_read_registers()?);
                cursor.expect_empty()?;
                Ok(x)
            }
            FunctionCode::WriteSingleCoil => {
                let x = Request::WriteSingleCoil(Indexed::<bool>::parse(cursor)?);
                cursor.expect_empty()?;
                Ok(x)
            }
            FunctionCode::WriteSingleRegister => {
                let x = Request::WriteSingleRegister(Indexed::<u16>::parse(cursor)?);
                cursor.expect_empty()?;
                Ok(x)
            }
            FunctionCode::WriteMultipleCoils => {
                let range = AddressRange::parse(cursor)?.of_write_coils()?;
                // don't care about the byte count, validated b/c all bytes are consumed
                cursor.read_u8()?;
                Ok(Request::WriteMultipleCoils(WriteCoils::new(
                    range,
                    BitIterator::parse_all(range, cursor)?,
                )))
            }
            FunctionCode::WriteMultipleRegisters => {
                let range = AddressRange::parse(cursor)?.of_write_registers()?;
                cursor.read_u8()?;
                Ok(Request::WriteMultipleRegisters(WriteRegisters::new(
                    range,
                    RegisterIterator::parse_all(range, cursor)?,
                )))
            }
            FunctionCode::ReadWriteMultipleRegisters => {
                let read = AddressRange::parse(cursor)?.of_read_write_read()?;
                let write = AddressRange::parse(cursor)?.of_read_write_write()?;
                cursor.read_u8()?;
                Ok(Request::ReadWriteMultipleRegisters(
                    read,
                    WriteRegisters::new(write, RegisterIterator::parse_all(write, cursor)?),
                ))
            }
        }
    }

    /// Execute the request against the handler and stage the reply frame.
    ///
    /// Modbus exceptions raised by the handler become exception replies here;
    /// an `Err` means the reply could not be formatted at all.
    pub(crate) fn get_reply(
        &self,
        header: FrameHeader,
        handler: &mut dyn RequestHandler,
        writer: &mut FrameWriter,
    ) -> Result<(), RequestError> {
        let function = self.get_function();
        match self {
            Request::ReadCoils(range) => match handler.read_coils(range.get()) {
                Ok(bits) => writer.format_reply(header, function, &BitReply::new(bits)),
                Err(ex) => writer.format_exception(header, function.get_value(), ex),
            },
            Request::ReadDiscreteInputs(range) => {
                match handler.read_discrete_inputs(range.get()) {
                    Ok(bits) => writer.format_reply(header, function, &BitReply::new(bits)),
                    Err(ex) => writer.format_exception(header, function.get_value(), ex),
                }
            }
            Request::ReadHoldingRegisters(range) => {
                match handler.read_holding_registers(range.get()) {
                    Ok(regs) => writer.format_reply(header, function, &RegisterReply::new(regs)),
                    Err(ex) => writer.format_exception(header, function.get_value(), ex),
                }
            }
            Request::ReadInputRegisters(range) => match handler.read_input_registers(range.get()) {
                Ok(regs) => writer.format_reply(header, function, &RegisterReply::new(regs)),
                Err(ex) => writer.format_exception(header, function.get_value(), ex),
            },
            Request::WriteSingleCoil(value) => match handler.write_single_coil(*value) {
                Ok(()) => writer.format_reply(header, function, value),
                Err(ex) => writer.format_exception(header, function.get_value(), ex),
            },
            Request::WriteSingleRegister(value) => match handler.write_single_register(*value) {
                Ok(()) => writer.format_reply(header, function, value),
                Err(ex) => writer.format_exception(header, function.get_value(), ex),
            },
            Request::WriteMultipleCoils(coils) => match handler.write_multiple_coils(*coils) {
                Ok(()) => writer.format_reply(header, function, &coils.range),
                Err(ex) => writer.format_exception(header, function.get_value(), ex),
            },
            Request::WriteMultipleRegisters(registers) => {
                match handler.write_multiple_registers(*registers) {
                    Ok(()) => writer.format_reply(header, function, &registers.range),
                    Err(ex) => writer.format_exception(header, function.get_value(), ex),
                }
            }
            Request::ReadWriteMultipleRegisters(read, write) => {
                match handler.read_write_multiple_registers(read.get(), *write) {
                    Ok(regs) => writer.format_reply(header, function, &RegisterReply::new(regs)),
                    Err(ex) => writer.format_exception(header, function.get_value(), ex),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AduParseError;

    mod coils {
        use super::*;

        #[test]
        fn fails_when_too_few_bytes_for_coil_byte_count() {
            let mut cursor = ReadCursor::new(&[0x00, 0x01, 0x00, 0x08, 0x00]);
            let err = Request::parse(FunctionCode::WriteMultipleCoils, &mut cursor)
                .err()
                .unwrap();
            assert_eq!(err, AduParseError::InsufficientBytes.into());
        }

        #[test]
        fn fails_when_too_many_bytes_present() {
            let mut cursor = ReadCursor::new(&[0x00, 0x01, 0x00, 0x08, 0x01, 0xFF, 0xFF]);
            let err = Request::parse(FunctionCode::WriteMultipleCoils, &mut cursor)
                .err()
                .unwrap();
            assert_eq!(err, AduParseError::TrailingBytes.into());
        }

        #[test]
        fn can_parse_coils() {
            let mut cursor = ReadCursor::new(&[0x00, 0x01, 0x00, 0x03, 0x01, 0x05]);
            let coils = match Request::parse(FunctionCode::WriteMultipleCoils, &mut cursor).unwrap()
            {
                Request::WriteMultipleCoils(write) => write,
                _ => panic!("bad match"),
            };

            assert_eq!(coils.range, AddressRange::try_from(1, 3).unwrap());
            assert_eq!(
                coils.iterator.collect::<Vec<Indexed<bool>>>(),
                vec![
                    Indexed::new(1, true),
                    Indexed::new(2, false),
                    Indexed::new(3, true)
                ]
            )
        }
    }

    mod registers {
        use super::*;

        #[test]
        fn fails_when_specified_byte_count_not_present() {
            let mut cursor = ReadCursor::new(&[0x00, 0x01, 0x00, 0x01, 0x02, 0xFF]);
            let err = Request::parse(FunctionCode::WriteMultipleRegisters, &mut cursor)
                .err()
                .unwrap();
            assert_eq!(err, AduParseError::InsufficientBytes.into());
        }

        #[test]
        fn can_parse_registers() {
            let mut cursor =
                ReadCursor::new(&[0x00, 0x01, 0x00, 0x02, 0x04, 0xCA, 0xFE, 0xBB, 0xDD]);
            let registers =
                match Request::parse(FunctionCode::WriteMultipleRegisters, &mut cursor).unwrap() {
                    Request::WriteMultipleRegisters(write) => write,
                    _ => panic!("bad match"),
                };

            assert_eq!(registers.range, AddressRange::try_from(1, 2).unwrap());
            assert_eq!(
                registers.iterator.collect::<Vec<Indexed<u16>>>(),
                vec![Indexed::new(1, 0xCAFE), Indexed::new(2, 0xBBDD)]
            )
        }
    }

    mod read_write {
        use super::*;
        use crate::error::InvalidRequest;

        #[test]
        fn can_parse_read_write_request() {
            // read 2 regs at 0, write 1 reg (0xBEEF) at 5
            let mut cursor = ReadCursor::new(&[
                0x00, 0x00, 0x00, 0x02, 0x00, 0x05, 0x00, 0x01, 0x02, 0xBE, 0xEF,
            ]);
            let (read, write) =
                match Request::parse(FunctionCode::ReadWriteMultipleRegisters, &mut cursor).unwrap()
                {
                    Request::ReadWriteMultipleRegisters(read, write) => (read, write),
                    _ => panic!("bad match"),
                };

            assert_eq!(read.get(), AddressRange::try_from(0, 2).unwrap());
            assert_eq!(write.range, AddressRange::try_from(5, 1).unwrap());
            assert_eq!(
                write.iterator.collect::<Vec<Indexed<u16>>>(),
                vec![Indexed::new(5, 0xBEEF)]
            );
        }

        #[test]
        fn rejects_oversized_write_count() {
            // write count of 122 exceeds the FC 23 limit of 121
            let mut bytes = vec![0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x7A, 0xF4];
            bytes.extend_from_slice(&[0u8; 244]);
            let mut cursor = ReadCursor::new(&bytes);
            let err = Request::parse(FunctionCode::ReadWriteMultipleRegisters, &mut cursor)
                .err()
                .unwrap();
            assert_eq!(err, InvalidRequest::CountTooLargeForType(122, 121).into());
        }
    }
}
