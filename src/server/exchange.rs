use std::io::Read;

use scursor::ReadCursor;

use crate::error::{AduParseError, RequestError};
use crate::exception::ExceptionCode;
use crate::frame::{Frame, FramedReader, FrameWriter, RecvError};
use crate::function::FunctionCode;
use crate::sem::{AccessSemaphore, Acquire};
use crate::server::map::BankDirectory;
use crate::server::request::Request;

/// Result of one request/response round on a readable socket
pub(crate) enum Exchange {
    /// A reply frame is staged in the writer. `function` is the decoded
    /// function code; `None` if the code was unknown (the staged reply is
    /// then an IllegalFunction exception).
    Progress { function: Option<FunctionCode> },
    /// clean EOF or peer reset
    Closed,
    /// fatal for this connection
    Faulted(RequestError),
    /// the cross-process semaphore is persistently unavailable
    SemaphoreExhausted,
}

/// Perform exactly one request/response round.
///
/// Reads one ADU, selects the bank by unit id, executes under the optional
/// cross-process semaphore and stages the reply in `writer`. The caller
/// writes the staged bytes to the socket after dispatching notifications.
pub(crate) fn run(
    io: &mut impl Read,
    directory: &mut BankDirectory,
    mut semaphore: Option<&mut AccessSemaphore>,
    reader: &FramedReader,
    writer: &mut FrameWriter,
) -> Exchange {
    let frame = match reader.read_frame(io) {
        Ok(frame) => frame,
        Err(RecvError::Closed) => return Exchange::Closed,
        Err(RecvError::Fault(err)) => return Exchange::Faulted(err),
    };

    if let Some(sem) = semaphore.as_mut() {
        if sem.acquire() == Acquire::Exhausted {
            return Exchange::SemaphoreExhausted;
        }
    }

    let outcome = respond(&frame, directory, writer);

    // no-op unless the acquisition above actually succeeded
    if let Some(sem) = semaphore {
        sem.release();
    }

    outcome
}

fn respond(frame: &Frame, directory: &mut BankDirectory, writer: &mut FrameWriter) -> Exchange {
    let header = frame.header;
    let bank = directory.get_mut(header.unit_id);

    let mut cursor = ReadCursor::new(frame.payload());
    let function_byte = match cursor.read_u8() {
        Ok(value) => value,
        Err(_) => return Exchange::Faulted(AduParseError::InsufficientBytes.into()),
    };

    match FunctionCode::get(function_byte) {
        None => {
            tracing::warn!("received unknown function code: {function_byte}");
            finish(
                writer.format_exception(header, function_byte, ExceptionCode::IllegalFunction),
                None,
            )
        }
        Some(function) => match Request::parse(function, &mut cursor) {
            Err(err) => {
                tracing::warn!("error parsing {function} request: {err}");
                finish(
                    writer.format_exception(
                        header,
                        function.get_value(),
                        ExceptionCode::IllegalDataValue,
                    ),
                    Some(function),
                )
            }
            Ok(request) => finish(request.get_reply(header, bank, writer), Some(function)),
        },
    }
}

fn finish(staged: Result<(), RequestError>, function: Option<FunctionCode>) -> Exchange {
    match staged {
        Ok(()) => Exchange::Progress { function },
        Err(err) => Exchange::Faulted(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::DecodeLevel;
    use crate::shm::{BankSizes, SharedBank};
    use nix::sys::stat::Mode;

    fn directory(tag: &str, holding: usize) -> BankDirectory {
        let prefix = format!("shmbus_ae_test_{}_{tag}_", std::process::id());
        let sizes = BankSizes {
            coils: 16,
            discrete_inputs: 16,
            holding,
            input: 16,
        };
        BankDirectory::single(
            SharedBank::create(&prefix, &sizes, false, Mode::from_bits_truncate(0o600)).unwrap(),
        )
    }

    fn one_round(directory: &mut BankDirectory, request: &[u8]) -> (Vec<u8>, Option<FunctionCode>) {
        let reader = FramedReader::new(DecodeLevel::nothing());
        let mut writer = FrameWriter::new(DecodeLevel::nothing());
        let mut io = std::io::Cursor::new(request.to_vec());
        match run(&mut io, directory, None, &reader, &mut writer) {
            Exchange::Progress { function } => (writer.reply().to_vec(), function),
            _ => panic!("expected progress"),
        }
    }

    #[test]
    fn write_then_read_round_trip() {
        let mut directory = directory("roundtrip", 65536);

        // FC 06: unit 1, register 10 := 0x1234; the reply echoes the request
        let write = [
            0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x06, 0x00, 0x0A, 0x12, 0x34,
        ];
        let (reply, function) = one_round(&mut directory, &write);
        assert_eq!(reply, write);
        assert_eq!(function, Some(FunctionCode::WriteSingleRegister));

        // FC 03: read it back
        let read = [
            0x00, 0x02, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x0A, 0x00, 0x01,
        ];
        let (reply, function) = one_round(&mut directory, &read);
        assert_eq!(
            reply,
            [0x00, 0x02, 0x00, 0x00, 0x00, 0x05, 0x01, 0x03, 0x02, 0x12, 0x34]
        );
        assert_eq!(function, Some(FunctionCode::ReadHoldingRegisters));
    }

    #[test]
    fn out_of_range_read_yields_illegal_address_exception() {
        let mut directory = directory("exception", 10);

        // FC 03 at address 100 with only 10 holding registers configured
        let read = [
            0x00, 0x07, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x64, 0x00, 0x01,
        ];
        let (reply, _) = one_round(&mut directory, &read);
        assert_eq!(reply, [0x00, 0x07, 0x00, 0x00, 0x00, 0x03, 0x01, 0x83, 0x02]);
    }

    #[test]
    fn unknown_function_yields_illegal_function_exception() {
        let mut directory = directory("unknown", 10);

        let request = [0x00, 0x01, 0x00, 0x00, 0x00, 0x02, 0x01, 0x2B];
        let (reply, function) = one_round(&mut directory, &request);
        assert_eq!(function, None);
        assert_eq!(reply, [0x00, 0x01, 0x00, 0x00, 0x00, 0x03, 0x01, 0xAB, 0x01]);
    }

    #[test]
    fn malformed_pdu_yields_illegal_value_exception() {
        let mut directory = directory("badpdu", 10);

        // FC 03 with a truncated PDU
        let request = [0x00, 0x01, 0x00, 0x00, 0x00, 0x04, 0x01, 0x03, 0x00, 0x00];
        let (reply, function) = one_round(&mut directory, &request);
        assert_eq!(function, Some(FunctionCode::ReadHoldingRegisters));
        assert_eq!(reply, [0x00, 0x01, 0x00, 0x00, 0x00, 0x03, 0x01, 0x83, 0x03]);
    }

    #[test]
    fn peer_eof_reads_as_closed() {
        let mut directory = directory("eof", 10);
        let reader = FramedReader::new(DecodeLevel::nothing());
        let mut writer = FrameWriter::new(DecodeLevel::nothing());
        let mut io = std::io::Cursor::new(Vec::new());
        assert!(matches!(
            run(&mut io, &mut directory, None, &reader, &mut writer),
            Exchange::Closed
        ));
    }
}
