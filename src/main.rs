use std::collections::BTreeSet;
use std::time::Duration;

use clap::Parser;
use nix::poll::PollTimeout;
use nix::sys::resource::{getrlimit, Resource};
use nix::sys::stat::Mode;
use nix::unistd::Pid;

use shmbus::cli::Cli;
use shmbus::decode::DecodeLevel;
use shmbus::net;
use shmbus::notify::Notifier;
use shmbus::sem::{AccessSemaphore, NamedSemaphore};
use shmbus::server::{BankDirectory, RunOutcome, ServerError, ServerLoop, ServerSettings};
use shmbus::shm::{BankSizes, SharedBank};
use shmbus::signal::TermFd;
use shmbus::{logging, server};

// exit codes per sysexits(3)
const EX_OK: i32 = 0;
const EX_USAGE: i32 = 64;
const EX_SOFTWARE: i32 = 70;
const EX_OSERR: i32 = 71;

// the codec's default byte/response timeout
const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            use clap::error::ErrorKind;
            let _ = err.print();
            return match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => EX_OK,
                _ => EX_USAGE,
            };
        }
    };

    if let Some(code) = print_diagnostics(&cli) {
        return code;
    }

    logging::init();

    if nix::unistd::geteuid().is_root() {
        tracing::warn!("!!!! You should not execute this program with root privileges !!!!");
    }

    // route the termination signals to a pollable fd before anything else
    // happens; this must precede any thread creation
    let term = match TermFd::install() {
        Ok(term) => term,
        Err(errno) => {
            tracing::error!("failed to create signal fd: {errno}");
            return EX_OSERR;
        }
    };

    let separate_ids: BTreeSet<u8> = cli.separate.iter().copied().collect();

    match getrlimit(Resource::RLIMIT_NOFILE) {
        Ok((soft, _)) => {
            let required = cli.required_files(separate_ids.len());
            if soft < required {
                tracing::warn!(
                    "limit of open simultaneous files ({soft}) is below the possible maximum \
                     that is required for the current settings ({required})"
                );
            }
        }
        Err(errno) => {
            tracing::error!("getrlimit: {errno}");
            return EX_OSERR;
        }
    }

    let byte_timeout = match checked_timeout(cli.byte_timeout) {
        Ok(timeout) => timeout,
        Err(()) => {
            tracing::error!("invalid byte timeout");
            return EX_USAGE;
        }
    };
    let response_timeout = match checked_timeout(cli.response_timeout) {
        Ok(timeout) => timeout,
        Err(()) => {
            tracing::error!("invalid response timeout");
            return EX_USAGE;
        }
    };

    let directory = match build_directory(&cli, &separate_ids) {
        Ok(directory) => directory,
        Err(err) => {
            tracing::error!("{err}");
            return EX_OSERR;
        }
    };

    let mut notifier = Notifier::new();
    for pid in &cli.signal {
        if let Err(err) = notifier.add(Pid::from_raw(*pid)) {
            tracing::error!("cannot register process {pid} for write notifications: {err}");
            return EX_USAGE;
        }
    }

    let listener = match net::listen(&cli.host, &cli.service, cli.tcp_timeout) {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!("failed to create tcp socket: {err}");
            return EX_SOFTWARE;
        }
    };

    let settings = ServerSettings {
        max_clients: cli.connections,
        reconnect: cli.reconnect,
        tcp_timeout: cli.tcp_timeout,
        byte_timeout,
        response_timeout,
        decode: if cli.monitor {
            DecodeLevel::monitor()
        } else {
            DecodeLevel::nothing()
        },
        allow_register: cli.signal_register,
    };

    let mut server = ServerLoop::new(listener, term, directory, notifier, settings);

    if let Some(name) = &cli.semaphore {
        match NamedSemaphore::create(name, cli.semaphore_force) {
            Ok(semaphore) => server.set_semaphore(AccessSemaphore::new(semaphore)),
            Err(err) => {
                tracing::error!("{err}");
                return EX_SOFTWARE;
            }
        }
    }

    let code = match server.listen_addr() {
        Ok(addr) => {
            tracing::info!("Listening on {addr} for connections.");
            serve(&mut server)
        }
        Err(errno) => {
            tracing::error!("getsockname: {errno}");
            EX_OSERR
        }
    };

    tracing::info!("Terminating...");
    code
}

fn serve(server: &mut ServerLoop) -> i32 {
    loop {
        match server.run_cycle(PollTimeout::NONE) {
            Ok(RunOutcome::Ok | RunOutcome::Timeout | RunOutcome::Interrupted) => continue,
            Ok(RunOutcome::TermSignal | RunOutcome::SemaphoreFailure) => return EX_OK,
            Ok(RunOutcome::NoConnections) => {
                tracing::info!("No more active connections.");
                return EX_OK;
            }
            Err(err @ (ServerError::Os { .. } | ServerError::Notify(_))) => {
                tracing::error!("{err}");
                return EX_OSERR;
            }
            Err(err) => {
                tracing::error!("{err}");
                return EX_SOFTWARE;
            }
        }
    }
}

fn build_directory(
    cli: &Cli,
    separate_ids: &BTreeSet<u8>,
) -> Result<BankDirectory, Box<dyn std::error::Error>> {
    let sizes = BankSizes {
        coils: cli.do_registers,
        discrete_inputs: cli.di_registers,
        holding: cli.ao_registers,
        input: cli.ai_registers,
    };
    let mode = Mode::from_bits_truncate(cli.permissions);

    if cli.separate_all {
        let mut dedicated = Vec::with_capacity(server::MAX_UNIT_IDS);
        for unit_id in 0..=u8::MAX {
            let prefix = SharedBank::unit_prefix(&cli.name_prefix, unit_id);
            dedicated.push((
                unit_id,
                SharedBank::create(&prefix, &sizes, cli.force, mode)?,
            ));
        }
        return Ok(BankDirectory::new(dedicated, None)?);
    }

    let fallback = SharedBank::create(&cli.name_prefix, &sizes, cli.force, mode)?;
    if separate_ids.is_empty() {
        return Ok(BankDirectory::single(fallback));
    }

    let mut dedicated = Vec::with_capacity(separate_ids.len());
    for unit_id in separate_ids {
        let prefix = SharedBank::unit_prefix(&cli.name_prefix, *unit_id);
        dedicated.push((
            *unit_id,
            SharedBank::create(&prefix, &sizes, cli.force, mode)?,
        ));
    }
    Ok(BankDirectory::new(dedicated, Some(fallback))?)
}

fn checked_timeout(seconds: Option<f64>) -> Result<Duration, ()> {
    match seconds {
        None => Ok(DEFAULT_TIMEOUT),
        Some(seconds) if seconds.is_finite() && seconds >= 0.0 => {
            Ok(Duration::from_secs_f64(seconds))
        }
        Some(_) => Err(()),
    }
}

fn print_diagnostics(cli: &Cli) -> Option<i32> {
    if cli.shortversion {
        println!("{}", env!("CARGO_PKG_VERSION"));
        return Some(EX_OK);
    }
    if cli.version {
        println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        return Some(EX_OK);
    }
    if cli.longversion {
        println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        println!("   on system {}-{}", std::env::consts::OS, std::env::consts::ARCH);
        println!("   from git commit {}", git_hash());
        return Some(EX_OK);
    }
    if cli.git_hash {
        println!("{}", git_hash());
        return Some(EX_OK);
    }
    if cli.license {
        print_licenses(false);
        return Some(EX_OK);
    }
    if cli.license_full {
        print_licenses(true);
        return Some(EX_OK);
    }
    None
}

fn git_hash() -> &'static str {
    option_env!("SHMBUS_GIT_HASH").unwrap_or("unknown")
}

fn print_licenses(full: bool) {
    println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    println!("License: GPL-3.0-only");
    println!();
    println!("This application uses the following libraries:");
    println!("  - chrono (MIT OR Apache-2.0)");
    println!("  - clap (MIT OR Apache-2.0)");
    println!("  - libc (MIT OR Apache-2.0)");
    println!("  - nix (MIT)");
    println!("  - scursor (MIT OR Apache-2.0)");
    println!("  - thiserror (MIT OR Apache-2.0)");
    println!("  - tracing, tracing-subscriber (MIT)");

    if full {
        println!();
        println!(
            "This program is free software: you can redistribute it and/or modify it \
             under the terms of the GNU General Public License version 3 as published \
             by the Free Software Foundation."
        );
        println!();
        println!(
            "This program is distributed in the hope that it will be useful, but \
             WITHOUT ANY WARRANTY; without even the implied warranty of \
             MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU \
             General Public License for more details: <https://www.gnu.org/licenses/>."
        );
    }
}
