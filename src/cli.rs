use clap::Parser;

const AFTER_HELP: &str = "\
The modbus registers are mapped to shared memory objects:
    type | name                      | mb-server-access | shm name
    -----|---------------------------|------------------|----------------
    DO   | Discrete Output Coils     | read-write       | <name-prefix>DO
    DI   | Discrete Input Coils      | read-only        | <name-prefix>DI
    AO   | Discrete Output Registers | read-write       | <name-prefix>AO
    AI   | Discrete Input Registers  | read-only        | <name-prefix>AI";

/// Modbus/TCP server that uses shared memory objects to store its register values
#[derive(Debug, Parser)]
#[command(name = "shmbus", disable_version_flag = true, after_help = AFTER_HELP)]
pub struct Cli {
    /// host to listen for incoming connections ("any" for the dual-stack wildcard)
    #[arg(short = 'i', long, default_value = "any")]
    pub host: String,

    /// service or port to listen for incoming connections
    #[arg(short = 'p', long, default_value = "502")]
    pub service: String,

    /// shared memory name prefix
    #[arg(short = 'n', long, default_value = "modbus_")]
    pub name_prefix: String,

    /// number of digital output registers (coils)
    #[arg(long, default_value_t = 65536, value_parser = parse_register_count)]
    pub do_registers: usize,

    /// number of digital input registers
    #[arg(long, default_value_t = 65536, value_parser = parse_register_count)]
    pub di_registers: usize,

    /// number of analog output registers
    #[arg(long, default_value_t = 65536, value_parser = parse_register_count)]
    pub ao_registers: usize,

    /// number of analog input registers
    #[arg(long, default_value_t = 65536, value_parser = parse_register_count)]
    pub ai_registers: usize,

    /// number of allowed simultaneous Modbus Server connections
    #[arg(short = 'c', long, default_value_t = 1, value_parser = parse_connection_count)]
    pub connections: usize,

    /// do not terminate if no Modbus Server is connected anymore
    #[arg(short = 'r', long)]
    pub reconnect: bool,

    /// output all incoming and outgoing packets
    #[arg(short = 'm', long)]
    pub monitor: bool,

    /// timeout in seconds between two consecutive bytes of the same message
    /// (fractional values are possible)
    #[arg(long)]
    pub byte_timeout: Option<f64>,

    /// timeout in seconds used to wait for a response (fractional values are
    /// possible)
    #[arg(long)]
    pub response_timeout: Option<f64>,

    /// tcp timeout in seconds. Set to 0 to use the system defaults (not
    /// recommended)
    #[arg(short = 't', long, default_value_t = 5)]
    pub tcp_timeout: u64,

    /// force the use of the shared memory even if it already exists. Only use
    /// this if the shared memory of an improperly terminated instance
    /// continues to exist as an orphan and is no longer used
    #[arg(long)]
    pub force: bool,

    /// use a separate shared memory for requests with the specified client
    /// ids. The client id (as hex value) is appended to the shared memory
    /// prefix (e.g. modbus_fc_DO). Separate multiple ids with ','
    #[arg(short = 's', long, value_delimiter = ',', value_parser = parse_unit_id)]
    pub separate: Vec<u8>,

    /// like --separate, but for all 256 client ids (creates 1028 shared
    /// memory files! check/set 'ulimit -n' before using this option)
    #[arg(long, conflicts_with = "separate")]
    pub separate_all: bool,

    /// protect the shared memory with a named semaphore against simultaneous
    /// access
    #[arg(long)]
    pub semaphore: Option<String>,

    /// force the use of the semaphore even if it already exists. Only use
    /// this if the semaphore of an improperly terminated instance continues
    /// to exist as an orphan and is no longer used
    #[arg(long)]
    pub semaphore_force: bool,

    /// permission bits that are applied when creating a shared memory
    #[arg(short = 'b', long, default_value = "0640", value_parser = parse_permissions)]
    pub permissions: u32,

    /// send SIGUSR1 to the listed processes on writing modbus commands
    #[arg(short = 'k', long, value_delimiter = ',')]
    pub signal: Vec<i32>,

    /// allow processes to register themselves for receiving SIGUSR1 on
    /// writing modbus commands by sending SIGUSR1
    #[arg(long)]
    pub signal_register: bool,

    /// print version and exit
    #[arg(long)]
    pub version: bool,

    /// print version (including system info) and exit
    #[arg(long)]
    pub longversion: bool,

    /// print version (only version string) and exit
    #[arg(long)]
    pub shortversion: bool,

    /// print git hash and exit
    #[arg(long)]
    pub git_hash: bool,

    /// show licenses (short)
    #[arg(long)]
    pub license: bool,

    /// show licenses (full license text)
    #[arg(long)]
    pub license_full: bool,
}

impl Cli {
    /// Number of file descriptors the current settings can require at once:
    /// stdio + termination fd + listening socket, one per client connection
    /// and four per register bank.
    pub fn required_files(&self, dedicated_banks: usize) -> u64 {
        const INTERNAL_FILES: u64 = 5;
        let banks = if self.separate_all {
            crate::server::MAX_UNIT_IDS as u64
        } else if dedicated_banks > 0 {
            dedicated_banks as u64
        } else {
            1
        };
        self.connections as u64 + INTERNAL_FILES + 4 * banks
    }
}

fn parse_register_count(value: &str) -> Result<usize, String> {
    let count: usize = value
        .parse()
        .map_err(|_| format!("'{value}' is not a number"))?;
    if count == 0 || count > crate::constants::limits::MAX_REGISTER_COUNT {
        return Err(format!(
            "register count must be in 1..={}",
            crate::constants::limits::MAX_REGISTER_COUNT
        ));
    }
    Ok(count)
}

fn parse_connection_count(value: &str) -> Result<usize, String> {
    let count: usize = value
        .parse()
        .map_err(|_| format!("'{value}' is not a number"))?;
    if count == 0 {
        return Err("the number of connections must not be 0".to_string());
    }
    Ok(count)
}

fn parse_unit_id(value: &str) -> Result<u8, String> {
    let value = value.trim();
    let parsed = if let Some(hex) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        u8::from_str_radix(hex, 16)
    } else {
        value.parse()
    };
    parsed.map_err(|_| format!("'{value}' is not a valid client id (0..=255)"))
}

fn parse_permissions(value: &str) -> Result<u32, String> {
    let trimmed = value.trim();
    let parsed = if let Some(hex) = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        u32::from_str_radix(hex, 16)
    } else if let Some(octal) = trimmed.strip_prefix('0').filter(|rest| !rest.is_empty()) {
        u32::from_str_radix(octal, 8)
    } else {
        trimmed.parse()
    };

    let mode = parsed.map_err(|_| format!("invalid file permissions \"{value}\""))?;
    if mode & !0o777 != 0 {
        return Err(format!("invalid file permissions \"{value}\""));
    }
    Ok(mode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_unit_ids_in_hex_and_decimal() {
        assert_eq!(parse_unit_id("0x10"), Ok(0x10));
        assert_eq!(parse_unit_id("255"), Ok(255));
        assert_eq!(parse_unit_id("0XaB"), Ok(0xAB));
        assert!(parse_unit_id("256").is_err());
        assert!(parse_unit_id("0xZZ").is_err());
    }

    #[test]
    fn parses_permissions_like_strtoul_base_zero() {
        assert_eq!(parse_permissions("0640"), Ok(0o640));
        assert_eq!(parse_permissions("0x1FF"), Ok(0o777));
        assert_eq!(parse_permissions("511"), Ok(0o777));
        assert_eq!(parse_permissions("0"), Ok(0));
        assert!(parse_permissions("01777").is_err());
        assert!(parse_permissions("rwx").is_err());
    }

    #[test]
    fn register_count_limits_are_enforced() {
        assert!(parse_register_count("0").is_err());
        assert_eq!(parse_register_count("65536"), Ok(65536));
        assert!(parse_register_count("65537").is_err());
    }

    #[test]
    fn separate_and_separate_all_conflict() {
        let result = Cli::try_parse_from(["shmbus", "--separate", "1", "--separate-all"]);
        assert!(result.is_err());
    }

    #[test]
    fn required_files_counts_banks_and_connections() {
        let cli = Cli::try_parse_from(["shmbus"]).unwrap();
        // 1 connection + 5 internal + 4 fds for the fallback bank
        assert_eq!(cli.required_files(0), 10);

        let cli = Cli::try_parse_from(["shmbus", "-c", "3", "--separate", "1,2"]).unwrap();
        assert_eq!(cli.required_files(2), 3 + 5 + 4 * 2);

        let cli = Cli::try_parse_from(["shmbus", "--separate-all"]).unwrap();
        assert_eq!(cli.required_files(256), 1 + 5 + 4 * 256);
    }
}
