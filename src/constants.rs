pub mod coil {
    /// u16 representation of COIL == ON in a write single coil request
    pub const ON: u16 = 0xFF00;
    /// u16 representation of COIL == OFF in a write single coil request
    pub const OFF: u16 = 0x0000;
}

pub mod limits {
    /// Maximum count allowed in a read coils/discrete inputs request
    pub const MAX_READ_COILS_COUNT: u16 = 0x07D0;
    /// Maximum count allowed in a read holding/input registers request
    pub const MAX_READ_REGISTERS_COUNT: u16 = 0x007D;
    /// Maximum count allowed in a write multiple coils request
    pub const MAX_WRITE_COILS_COUNT: u16 = 0x07B0;
    /// Maximum count allowed in a write multiple registers request
    pub const MAX_WRITE_REGISTERS_COUNT: u16 = 0x007B;
    /// Maximum read count allowed in a read/write multiple registers request
    pub const MAX_READ_WRITE_READ_COUNT: u16 = 0x007D;
    /// Maximum write count allowed in a read/write multiple registers request
    pub const MAX_READ_WRITE_WRITE_COUNT: u16 = 0x0079;
    /// Maximum number of registers of one type in a bank
    pub const MAX_REGISTER_COUNT: usize = 0x10000;
}

pub mod exceptions {
    pub const ILLEGAL_FUNCTION: u8 = 0x01;
    pub const ILLEGAL_DATA_ADDRESS: u8 = 0x02;
    pub const ILLEGAL_DATA_VALUE: u8 = 0x03;
    pub const SERVER_DEVICE_FAILURE: u8 = 0x04;
}

pub mod semaphore {
    /// added to the error counter when the semaphore could not be acquired
    pub const ERROR_INC: i64 = 10;
    /// subtracted from the error counter when the semaphore was acquired
    pub const ERROR_DEC: i64 = 1;
    /// counter value at which the server gives up on the semaphore
    pub const ERROR_MAX: i64 = 1000;
    /// maximum time to wait for the semaphore per request
    pub const MAX_WAIT: std::time::Duration = std::time::Duration::from_millis(100);
}
