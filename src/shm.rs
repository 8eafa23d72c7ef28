use std::marker::PhantomData;
use std::num::NonZeroUsize;
use std::os::fd::OwnedFd;
use std::ptr::NonNull;

use nix::fcntl::OFlag;
use nix::sys::mman::{self, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use thiserror::Error;

use crate::exception::ExceptionCode;
use crate::server::RequestHandler;
use crate::types::{AddressRange, Indexed, WriteCoils, WriteRegisters};

/// Errors creating or mapping a shared-memory segment
#[derive(Debug, Error)]
pub enum ShmError {
    /// The segment exists and `force` was not given
    #[error("shared memory '{name}' already exists (use --force to reuse it)")]
    AlreadyExists {
        /// segment name
        name: String,
    },

    /// Register count outside 1..=65536
    #[error("invalid register count {count} for '{name}' (allowed: 1..=65536)")]
    InvalidCount {
        /// segment name
        name: String,
        /// rejected count
        count: usize,
    },

    /// OS-level error from the shm/mmap calls
    #[error("failed to {op} shared memory '{name}': {source}")]
    Os {
        /// operation that failed
        op: &'static str,
        /// segment name
        name: String,
        /// underlying errno
        source: nix::errno::Errno,
    },
}

/// One mmap'd shared-memory array of `count` elements of `T`.
///
/// The segment is created (or, with `force`, reused) on construction and
/// unmapped, closed and unlinked on drop.
struct Segment<T: Copy> {
    name: String,
    map: NonNull<libc::c_void>,
    byte_len: usize,
    count: usize,
    _fd: OwnedFd,
    _marker: PhantomData<T>,
}

// SAFETY: the mapping is private to this process's single server thread;
// external processes synchronize through the named semaphore.
unsafe impl<T: Copy + Send> Send for Segment<T> {}

impl<T: Copy> Segment<T> {
    fn create(name: String, count: usize, force: bool, mode: Mode) -> Result<Self, ShmError> {
        if count == 0 || count > crate::constants::limits::MAX_REGISTER_COUNT {
            return Err(ShmError::InvalidCount { name, count });
        }

        let mut oflag = OFlag::O_CREAT | OFlag::O_RDWR;
        if !force {
            oflag |= OFlag::O_EXCL;
        }

        let fd = mman::shm_open(name.as_str(), oflag, mode).map_err(|errno| {
            if errno == nix::errno::Errno::EEXIST {
                ShmError::AlreadyExists { name: name.clone() }
            } else {
                ShmError::Os {
                    op: "create",
                    name: name.clone(),
                    source: errno,
                }
            }
        })?;

        let byte_len = count * std::mem::size_of::<T>();
        nix::unistd::ftruncate(&fd, byte_len as libc::off_t).map_err(|errno| ShmError::Os {
            op: "resize",
            name: name.clone(),
            source: errno,
        })?;

        let map = unsafe {
            mman::mmap(
                None,
                NonZeroUsize::new(byte_len).expect("count validated above"),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )
        }
        .map_err(|errno| ShmError::Os {
            op: "map",
            name: name.clone(),
            source: errno,
        })?;

        Ok(Self {
            name,
            map,
            byte_len,
            count,
            _fd: fd,
            _marker: PhantomData,
        })
    }

    fn slice(&self) -> &[T] {
        // SAFETY: the mapping is at least `count * size_of::<T>()` bytes and
        // lives as long as `self`
        unsafe { std::slice::from_raw_parts(self.map.as_ptr() as *const T, self.count) }
    }

    fn slice_mut(&mut self) -> &mut [T] {
        // SAFETY: as above, and `&mut self` guarantees exclusive access
        // within this process
        unsafe { std::slice::from_raw_parts_mut(self.map.as_ptr() as *mut T, self.count) }
    }
}

impl<T: Copy> Drop for Segment<T> {
    fn drop(&mut self) {
        if let Err(errno) = unsafe { mman::munmap(self.map, self.byte_len) } {
            tracing::warn!("failed to unmap shared memory '{}': {}", self.name, errno);
        }
        if let Err(errno) = mman::shm_unlink(self.name.as_str()) {
            tracing::warn!("failed to unlink shared memory '{}': {}", self.name, errno);
        }
    }
}

/// Register counts for the four arrays of a bank
#[derive(Clone, Copy, Debug)]
pub struct BankSizes {
    /// number of coils (digital outputs)
    pub coils: usize,
    /// number of discrete inputs
    pub discrete_inputs: usize,
    /// number of holding registers (analog outputs)
    pub holding: usize,
    /// number of input registers (analog inputs)
    pub input: usize,
}

/// One set of four shared-memory register arrays.
///
/// Segment names are `{prefix}DO`, `{prefix}DI`, `{prefix}AO` and
/// `{prefix}AI`. Coils and discrete inputs occupy one byte per point;
/// holding and input registers are native-endian 16-bit words.
pub struct SharedBank {
    coils: Segment<u8>,
    discrete_inputs: Segment<u8>,
    holding: Segment<u16>,
    input: Segment<u16>,
}

impl SharedBank {
    /// Create the four segments of a bank
    pub fn create(
        prefix: &str,
        sizes: &BankSizes,
        force: bool,
        mode: Mode,
    ) -> Result<Self, ShmError> {
        Ok(Self {
            coils: Segment::create(format!("{prefix}DO"), sizes.coils, force, mode)?,
            discrete_inputs: Segment::create(
                format!("{prefix}DI"),
                sizes.discrete_inputs,
                force,
                mode,
            )?,
            holding: Segment::create(format!("{prefix}AO"), sizes.holding, force, mode)?,
            input: Segment::create(format!("{prefix}AI"), sizes.input, force, mode)?,
        })
    }

    /// Name prefix of the dedicated bank for a unit id: `{prefix}{hh}_`
    pub fn unit_prefix(prefix: &str, unit_id: u8) -> String {
        format!("{prefix}{unit_id:02x}_")
    }
}

impl RequestHandler for SharedBank {
    fn read_coils(&self, range: AddressRange) -> Result<&[u8], ExceptionCode> {
        Self::get_range_of(self.coils.slice(), range)
    }

    fn read_discrete_inputs(&self, range: AddressRange) -> Result<&[u8], ExceptionCode> {
        Self::get_range_of(self.discrete_inputs.slice(), range)
    }

    fn read_holding_registers(&self, range: AddressRange) -> Result<&[u16], ExceptionCode> {
        Self::get_range_of(self.holding.slice(), range)
    }

    fn read_input_registers(&self, range: AddressRange) -> Result<&[u16], ExceptionCode> {
        Self::get_range_of(self.input.slice(), range)
    }

    fn write_single_coil(&mut self, value: Indexed<bool>) -> Result<(), ExceptionCode> {
        match self.coils.slice_mut().get_mut(value.index as usize) {
            Some(cell) => {
                *cell = value.value as u8;
                Ok(())
            }
            None => Err(ExceptionCode::IllegalDataAddress),
        }
    }

    fn write_single_register(&mut self, value: Indexed<u16>) -> Result<(), ExceptionCode> {
        match self.holding.slice_mut().get_mut(value.index as usize) {
            Some(cell) => {
                *cell = value.value;
                Ok(())
            }
            None => Err(ExceptionCode::IllegalDataAddress),
        }
    }

    fn write_multiple_coils(&mut self, values: WriteCoils) -> Result<(), ExceptionCode> {
        // validate the whole range up front so the write is all-or-nothing
        if values.range.to_std_range().end > self.coils.count {
            return Err(ExceptionCode::IllegalDataAddress);
        }
        let cells = self.coils.slice_mut();
        for bit in values.iterator {
            cells[bit.index as usize] = bit.value as u8;
        }
        Ok(())
    }

    fn write_multiple_registers(&mut self, values: WriteRegisters) -> Result<(), ExceptionCode> {
        if values.range.to_std_range().end > self.holding.count {
            return Err(ExceptionCode::IllegalDataAddress);
        }
        let cells = self.holding.slice_mut();
        for register in values.iterator {
            cells[register.index as usize] = register.value;
        }
        Ok(())
    }

    fn read_write_multiple_registers(
        &mut self,
        read: AddressRange,
        values: WriteRegisters,
    ) -> Result<&[u16], ExceptionCode> {
        if read.to_std_range().end > self.holding.count
            || values.range.to_std_range().end > self.holding.count
        {
            return Err(ExceptionCode::IllegalDataAddress);
        }

        // write before read, so overlapping ranges observe the new values
        let cells = self.holding.slice_mut();
        for register in values.iterator {
            cells[register.index as usize] = register.value;
        }

        Ok(&self.holding.slice()[read.to_std_range()])
    }
}
