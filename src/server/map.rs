use thiserror::Error;

use crate::shm::SharedBank;
use crate::types::UnitId;

/// Number of possible unit ids (the unit identifier is one byte)
pub const MAX_UNIT_IDS: usize = 256;

/// Error constructing the directory
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// Some unit ids have no dedicated bank and no fallback was supplied
    #[error("unit ids without a dedicated bank require a fallback bank")]
    MissingFallback,
}

/// Maps every possible unit id to a register bank.
///
/// All 256 slots are populated at construction and never change afterwards;
/// lookups are infallible. Multiple slots may alias the same bank.
pub struct BankDirectory {
    banks: Vec<SharedBank>,
    slots: [usize; MAX_UNIT_IDS],
}

impl BankDirectory {
    /// All unit ids share one bank
    pub fn single(bank: SharedBank) -> Self {
        Self {
            banks: vec![bank],
            slots: [0; MAX_UNIT_IDS],
        }
    }

    /// Dedicated banks for the listed unit ids; every other slot aliases the
    /// fallback bank. The fallback may be omitted only when all 256 ids have
    /// a dedicated bank.
    pub fn new(
        dedicated: Vec<(u8, SharedBank)>,
        fallback: Option<SharedBank>,
    ) -> Result<Self, DirectoryError> {
        const UNASSIGNED: usize = usize::MAX;

        let mut banks = Vec::with_capacity(dedicated.len() + 1);
        let mut slots = [UNASSIGNED; MAX_UNIT_IDS];

        for (unit_id, bank) in dedicated {
            slots[unit_id as usize] = banks.len();
            banks.push(bank);
        }

        if slots.contains(&UNASSIGNED) {
            let fallback_index = banks.len();
            banks.push(fallback.ok_or(DirectoryError::MissingFallback)?);
            for slot in &mut slots {
                if *slot == UNASSIGNED {
                    *slot = fallback_index;
                }
            }
        }

        Ok(Self { banks, slots })
    }

    /// The bank that services requests for `id`
    pub fn get_mut(&mut self, id: UnitId) -> &mut SharedBank {
        &mut self.banks[self.slots[id.value as usize]]
    }

    /// Number of distinct banks
    pub fn bank_count(&self) -> usize {
        self.banks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::RequestHandler;
    use crate::shm::BankSizes;
    use crate::types::{AddressRange, Indexed};
    use nix::sys::stat::Mode;

    fn bank(tag: &str) -> SharedBank {
        let prefix = format!("shmbus_map_test_{}_{tag}_", std::process::id());
        let sizes = BankSizes {
            coils: 4,
            discrete_inputs: 4,
            holding: 4,
            input: 4,
        };
        SharedBank::create(&prefix, &sizes, false, Mode::from_bits_truncate(0o600)).unwrap()
    }

    #[test]
    fn single_mode_aliases_all_slots() {
        let mut directory = BankDirectory::single(bank("single"));
        directory
            .get_mut(UnitId::new(0x01))
            .write_single_register(Indexed::new(0, 0xABCD))
            .unwrap();

        // visible through every other unit id
        for id in 0..=u8::MAX {
            let read = directory
                .get_mut(UnitId::new(id))
                .read_holding_registers(AddressRange::try_from(0, 1).unwrap())
                .unwrap();
            assert_eq!(read, &[0xABCD]);
        }
        assert_eq!(directory.bank_count(), 1);
    }

    #[test]
    fn dedicated_slots_are_isolated_from_the_fallback() {
        let mut directory =
            BankDirectory::new(vec![(0x10, bank("ded"))], Some(bank("fb"))).unwrap();
        assert_eq!(directory.bank_count(), 2);

        directory
            .get_mut(UnitId::new(0x10))
            .write_single_register(Indexed::new(0, 0xBEEF))
            .unwrap();

        let read = directory
            .get_mut(UnitId::new(0x11))
            .read_holding_registers(AddressRange::try_from(0, 1).unwrap())
            .unwrap();
        assert_eq!(read, &[0x0000]);
    }

    #[test]
    fn missing_fallback_is_rejected() {
        assert!(matches!(
            BankDirectory::new(vec![(0, bank("nofb"))], None),
            Err(DirectoryError::MissingFallback)
        ));
    }
}
