use scursor::WriteCursor;

use crate::error::RequestError;
use crate::frame::Serialize;
use crate::types::{coil_to_u16, num_bytes_for_bits, AddressRange, Indexed};

/// FC 01/02 reply body: byte count followed by packed bits, LSB first
pub(crate) struct BitReply<'a> {
    bits: &'a [u8],
}

impl<'a> BitReply<'a> {
    pub(crate) fn new(bits: &'a [u8]) -> Self {
        Self { bits }
    }
}

impl Serialize for BitReply<'_> {
    fn serialize(&self, cursor: &mut WriteCursor) -> Result<(), RequestError> {
        cursor.write_u8(num_bytes_for_bits(self.bits.len() as u16) as u8)?;

        let mut acc: u8 = 0;
        let mut num_bits = 0;
        for bit in self.bits {
            if *bit != 0 {
                acc |= 1 << num_bits;
            }
            num_bits += 1;
            if num_bits == 8 {
                cursor.write_u8(acc)?;
                acc = 0;
                num_bits = 0;
            }
        }
        if num_bits > 0 {
            cursor.write_u8(acc)?;
        }
        Ok(())
    }
}

/// FC 03/04/23 reply body: byte count followed by big-endian registers
pub(crate) struct RegisterReply<'a> {
    registers: &'a [u16],
}

impl<'a> RegisterReply<'a> {
    pub(crate) fn new(registers: &'a [u16]) -> Self {
        Self { registers }
    }
}

impl Serialize for RegisterReply<'_> {
    fn serialize(&self, cursor: &mut WriteCursor) -> Result<(), RequestError> {
        cursor.write_u8((self.registers.len() * 2) as u8)?;
        for register in self.registers {
            cursor.write_u16_be(*register)?;
        }
        Ok(())
    }
}

// FC 05 echoes the address and coil state of the request
impl Serialize for Indexed<bool> {
    fn serialize(&self, cursor: &mut WriteCursor) -> Result<(), RequestError> {
        cursor.write_u16_be(self.index)?;
        cursor.write_u16_be(coil_to_u16(self.value))?;
        Ok(())
    }
}

// FC 06 echoes the address and register value of the request
impl Serialize for Indexed<u16> {
    fn serialize(&self, cursor: &mut WriteCursor) -> Result<(), RequestError> {
        cursor.write_u16_be(self.index)?;
        cursor.write_u16_be(self.value)?;
        Ok(())
    }
}

// FC 15/16 reply with the start address and quantity written
impl Serialize for AddressRange {
    fn serialize(&self, cursor: &mut WriteCursor) -> Result<(), RequestError> {
        cursor.write_u16_be(self.start)?;
        cursor.write_u16_be(self.count)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serialize(body: &dyn Serialize) -> Vec<u8> {
        let mut buffer = [0u8; 64];
        let mut cursor = WriteCursor::new(&mut buffer);
        body.serialize(&mut cursor).unwrap();
        let end = cursor.position();
        buffer[..end].to_vec()
    }

    #[test]
    fn packs_bits_lsb_first() {
        let reply = serialize(&BitReply::new(&[1, 0, 1, 1, 0, 0, 0, 0, 1]));
        assert_eq!(reply, vec![0x02, 0x0D, 0x01]);
    }

    #[test]
    fn nonzero_bytes_count_as_on() {
        let reply = serialize(&BitReply::new(&[0xFF, 2, 0]));
        assert_eq!(reply, vec![0x01, 0x03]);
    }

    #[test]
    fn writes_registers_big_endian() {
        let reply = serialize(&RegisterReply::new(&[0x1234, 0x00FF]));
        assert_eq!(reply, vec![0x04, 0x12, 0x34, 0x00, 0xFF]);
    }

    #[test]
    fn echoes_coil_write() {
        let reply = serialize(&Indexed::new(0x000A, true));
        assert_eq!(reply, vec![0x00, 0x0A, 0xFF, 0x00]);
    }
}
