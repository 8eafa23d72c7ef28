use crate::exception::ExceptionCode;
use crate::types::{AddressRange, Indexed, WriteCoils, WriteRegisters};

/// Services validated Modbus requests against one register bank.
///
/// Coils and discrete inputs are stored one byte per point (0 = off,
/// anything else = on); holding and input registers are native-endian u16.
/// Implementations bound-check every access against their configured sizes
/// and report [`ExceptionCode::IllegalDataAddress`] for anything outside.
pub trait RequestHandler {
    /// Read a range of coils, returning the matching byte slice or an exception
    fn read_coils(&self, range: AddressRange) -> Result<&[u8], ExceptionCode>;

    /// Read a range of discrete inputs
    fn read_discrete_inputs(&self, range: AddressRange) -> Result<&[u8], ExceptionCode>;

    /// Read a range of holding registers
    fn read_holding_registers(&self, range: AddressRange) -> Result<&[u16], ExceptionCode>;

    /// Read a range of input registers
    fn read_input_registers(&self, range: AddressRange) -> Result<&[u16], ExceptionCode>;

    /// Write a single coil
    fn write_single_coil(&mut self, value: Indexed<bool>) -> Result<(), ExceptionCode>;

    /// Write a single holding register
    fn write_single_register(&mut self, value: Indexed<u16>) -> Result<(), ExceptionCode>;

    /// Write a contiguous block of coils
    fn write_multiple_coils(&mut self, values: WriteCoils) -> Result<(), ExceptionCode>;

    /// Write a contiguous block of holding registers
    fn write_multiple_registers(&mut self, values: WriteRegisters) -> Result<(), ExceptionCode>;

    /// Write a block of holding registers, then read another block.
    /// The write is performed first.
    fn read_write_multiple_registers(
        &mut self,
        read: AddressRange,
        values: WriteRegisters,
    ) -> Result<&[u16], ExceptionCode>;

    /// retrieve a sub-range of a slice or `ExceptionCode::IllegalDataAddress`
    fn get_range_of<T>(slice: &[T], range: AddressRange) -> Result<&[T], ExceptionCode>
    where
        Self: Sized,
    {
        let rng = range.to_std_range();
        if rng.start >= slice.len() || rng.end > slice.len() {
            return Err(ExceptionCode::IllegalDataAddress);
        }
        Ok(&slice[rng])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nothing;
    impl RequestHandler for Nothing {
        fn read_coils(&self, _: AddressRange) -> Result<&[u8], ExceptionCode> {
            unimplemented!()
        }
        fn read_discrete_inputs(&self, _: AddressRange) -> Result<&[u8], ExceptionCode> {
            unimplemented!()
        }
        fn read_holding_registers(&self, _: AddressRange) -> Result<&[u16], ExceptionCode> {
            unimplemented!()
        }
        fn read_input_registers(&self, _: AddressRange) -> Result<&[u16], ExceptionCode> {
            unimplemented!()
        }
        fn write_single_coil(&mut self, _: Indexed<bool>) -> Result<(), ExceptionCode> {
            unimplemented!()
        }
        fn write_single_register(&mut self, _: Indexed<u16>) -> Result<(), ExceptionCode> {
            unimplemented!()
        }
        fn write_multiple_coils(&mut self, _: WriteCoils) -> Result<(), ExceptionCode> {
            unimplemented!()
        }
        fn write_multiple_registers(&mut self, _: WriteRegisters) -> Result<(), ExceptionCode> {
            unimplemented!()
        }
        fn read_write_multiple_registers(
            &mut self,
            _: AddressRange,
            _: WriteRegisters,
        ) -> Result<&[u16], ExceptionCode> {
            unimplemented!()
        }
    }

    #[test]
    fn range_helper_checks_bounds() {
        let data = [0u16; 10];
        let ok = AddressRange::try_from(2, 8).unwrap();
        assert_eq!(Nothing::get_range_of(&data, ok).unwrap().len(), 8);

        let off_end = AddressRange::try_from(2, 9).unwrap();
        assert_eq!(
            Nothing::get_range_of(&data, off_end),
            Err(ExceptionCode::IllegalDataAddress)
        );

        let past = AddressRange::try_from(10, 1).unwrap();
        assert_eq!(
            Nothing::get_range_of(&data, past),
            Err(ExceptionCode::IllegalDataAddress)
        );
    }
}
