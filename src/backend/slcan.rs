//! Serial-line CAN backend (Lawicel SLCAN ASCII protocol)
//!
//! USB-to-CAN adapters such as the CANable or the USBtin expose the bus as a
//! serial port speaking a line based protocol:
//!
//! ```text
//! S8\r            select 1 Mbit/s
//! O\r             open the channel
//! t0038AABB...\r  standard frame: 3 hex digits id, 1 digit dlc, 2 digits per byte
//! T12345678...\r  extended frame: 8 hex digits id
//! C\r             close the channel
//! ```
//!
//! The adapter answers `\r` for OK and `\x07` (BEL) for an error, and may
//! acknowledge transmissions with `z\r` / `Z\r`.

use std::io::{ErrorKind, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, info, trace, warn};
use serialport::{ClearBuffer, SerialPort};

use super::run_blocking;
use crate::error::TransportError;
use crate::packets::{CanFrame, MAX_FRAME_DATA};
use crate::transport::Transport;

/// Default serial speed of the adapter's virtual COM port
pub const DEFAULT_SERIAL_BAUD: u32 = 115_200;

const CR: u8 = b'\r';
const BELL: u8 = 0x07;
const COMMAND_TIMEOUT: Duration = Duration::from_millis(500);

// Serial line under the adapter
trait Line: Read + Write + Send {
    fn set_read_timeout(&mut self, timeout: Duration) -> Result<(), TransportError>;
    fn clear_input(&mut self) -> Result<(), TransportError>;
}

impl Line for Box<dyn SerialPort> {
    fn set_read_timeout(&mut self, timeout: Duration) -> Result<(), TransportError> {
        Ok(self.set_timeout(timeout)?)
    }

    fn clear_input(&mut self) -> Result<(), TransportError> {
        Ok(self.clear(ClearBuffer::Input)?)
    }
}

// One line received from the adapter
#[derive(Debug, PartialEq, Eq)]
enum Record {
    // CR terminated, without the CR
    Line(Vec<u8>),
    // BEL: the adapter rejected the last command
    Error,
}

struct Port<L = Box<dyn SerialPort>> {
    serial: L,
    // Bytes read from the adapter that do not yet form a complete record
    pending: Vec<u8>,
}

/// Transport over a serial-line CAN adapter
pub struct SlcanTransport {
    path: String,
    port: Option<Arc<Mutex<Port>>>,
}

impl SlcanTransport {
    /// Open the adapter on serial port `path` and start the CAN channel at `bit_rate`
    ///
    /// Fails if the adapter rejects or does not answer the bit rate or open
    /// command.
    pub fn open(path: &str, bit_rate: u32, serial_baud: u32) -> Result<Self, TransportError> {
        let code = bit_rate_code(bit_rate).ok_or(TransportError::UnsupportedBitRate(bit_rate))?;

        let serial = serialport::new(path, serial_baud).timeout(COMMAND_TIMEOUT).open()?;
        let mut port = Port::new(serial);
        port.start_channel(code)?;

        info!("Opened SLCAN adapter on {path} at {bit_rate} bit/s");
        Ok(SlcanTransport {
            path: path.to_string(),
            port: Some(Arc::new(Mutex::new(port))),
        })
    }

    fn port(&self) -> Result<Arc<Mutex<Port>>, TransportError> {
        self.port.clone().ok_or(TransportError::Closed)
    }
}

impl<L: Line> Port<L> {
    fn new(serial: L) -> Self {
        Port {
            serial,
            pending: Vec::new(),
        }
    }

    // C, S<code>, O with the adapter's answer checked for the last two
    fn start_channel(&mut self, code: u8) -> Result<(), TransportError> {
        self.serial.clear_input()?;

        // A channel left open by a previous run has to be closed first. An
        // already closed channel answers BEL, so the answer is not checked.
        self.command("C")?;
        let _ = self.read_record(COMMAND_TIMEOUT)?;

        self.checked_command(&format!("S{code}"))?;
        self.checked_command("O")?;
        Ok(())
    }

    fn command(&mut self, command: &str) -> Result<(), TransportError> {
        trace!("SLCAN > {command}");
        self.serial.write_all(command.as_bytes())?;
        self.serial.write_all(&[CR])?;
        self.serial.flush()?;
        Ok(())
    }

    fn checked_command(&mut self, command: &str) -> Result<(), TransportError> {
        self.command(command)?;
        match self.read_record(COMMAND_TIMEOUT)? {
            Some(Record::Line(_)) => Ok(()),
            Some(Record::Error) => Err(TransportError::AdapterRejected(command.to_string())),
            None => Err(TransportError::AdapterSilent(command.to_string())),
        }
    }

    // Next complete record from the adapter
    fn read_record(&mut self, timeout: Duration) -> Result<Option<Record>, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; 64];

        loop {
            if let Some(end) = self.pending.iter().position(|&b| b == CR || b == BELL) {
                let terminator = self.pending[end];
                let line: Vec<u8> = self.pending.drain(..=end).take(end).collect();
                if terminator == BELL {
                    return Ok(Some(Record::Error));
                }
                return Ok(Some(Record::Line(line)));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            self.serial.set_read_timeout(deadline - now)?;
            match self.serial.read(&mut buf) {
                Ok(0) => continue,
                Ok(n) => self.pending.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::TimedOut => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// SLCAN bit rate command digit for `bit_rate`
fn bit_rate_code(bit_rate: u32) -> Option<u8> {
    let code = match bit_rate {
        10_000 => 0,
        20_000 => 1,
        50_000 => 2,
        100_000 => 3,
        125_000 => 4,
        250_000 => 5,
        500_000 => 6,
        800_000 => 7,
        1_000_000 => 8,
        _ => return None,
    };
    Some(code)
}

/// SLCAN transmit record for `frame`, without the terminating CR
fn encode_frame(frame: &CanFrame) -> String {
    let mut record = if frame.id() <= 0x7FF {
        format!("t{:03X}", frame.id())
    } else {
        format!("T{:08X}", frame.id())
    };
    record.push_str(&format!("{:X}", frame.data().len()));
    for byte in frame.data() {
        record.push_str(&format!("{byte:02X}"));
    }
    record
}

/// Frame carried by a received record, `None` for anything else
fn parse_record(record: &[u8]) -> Option<CanFrame> {
    let text = std::str::from_utf8(record).ok()?;
    let (id_len, remote) = match text.as_bytes().first()? {
        b't' => (3, false),
        b'T' => (8, false),
        b'r' => (3, true),
        b'R' => (8, true),
        _ => return None,
    };

    let id = u32::from_str_radix(text.get(1..1 + id_len)?, 16).ok()?;
    let dlc = usize::from_str_radix(text.get(1 + id_len..2 + id_len)?, 16).ok()?;
    if dlc > MAX_FRAME_DATA {
        return None;
    }
    if remote {
        return CanFrame::new(id, &[]);
    }

    let hex = text.get(2 + id_len..2 + id_len + 2 * dlc)?;
    if !hex.is_ascii() {
        return None;
    }
    let data = (0..dlc)
        .map(|i| u8::from_str_radix(&hex[2 * i..2 * i + 2], 16).ok())
        .collect::<Option<Vec<u8>>>()?;
    CanFrame::new(id, &data)
}

#[async_trait]
impl Transport for SlcanTransport {
    async fn send(&mut self, frame: &CanFrame) -> Result<(), TransportError> {
        let port = self.port()?;
        let record = encode_frame(frame);
        run_blocking(move || {
            let mut port = port.lock().map_err(|_| TransportError::Closed)?;
            port.command(&record)
        })
        .await
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Option<CanFrame>, TransportError> {
        let port = self.port()?;
        run_blocking(move || {
            let mut port = port.lock().map_err(|_| TransportError::Closed)?;
            let deadline = Instant::now() + timeout;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match port.read_record(remaining)? {
                    None => return Ok(None),
                    Some(Record::Error) => warn!("SLCAN adapter reported an error"),
                    Some(Record::Line(record)) => {
                        trace!("SLCAN < {}", String::from_utf8_lossy(&record));
                        // Empty records and z/Z are command or transmit acknowledgments
                        if let Some(frame) = parse_record(&record) {
                            return Ok(Some(frame));
                        }
                    }
                }
            }
        })
        .await
    }

    async fn flush(&mut self) -> Result<(), TransportError> {
        let port = self.port()?;
        run_blocking(move || {
            let mut port = port.lock().map_err(|_| TransportError::Closed)?;
            port.pending.clear();
            port.serial.clear_input()
        })
        .await
    }

    fn close(&mut self) -> Result<(), TransportError> {
        let Some(port) = self.port.take() else {
            return Ok(());
        };
        let mut port = port.lock().map_err(|_| TransportError::Closed)?;
        port.command("C")?;
        debug!("SLCAN channel closed");
        info!("Closed SLCAN adapter on {}", self.path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::io;

    use super::*;

    // Adapter answering each CR terminated command with `answer(command)`
    struct FakeAdapter {
        answer: fn(&str) -> &'static [u8],
        commands: Vec<String>,
        line: Vec<u8>,
        output: VecDeque<u8>,
    }

    impl FakeAdapter {
        fn new(answer: fn(&str) -> &'static [u8]) -> Self {
            FakeAdapter {
                answer,
                commands: Vec::new(),
                line: Vec::new(),
                output: VecDeque::new(),
            }
        }
    }

    impl Read for FakeAdapter {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.output.is_empty() {
                return Err(io::Error::from(ErrorKind::TimedOut));
            }
            let n = buf.len().min(self.output.len());
            for (slot, byte) in buf.iter_mut().zip(self.output.drain(..n)) {
                *slot = byte;
            }
            Ok(n)
        }
    }

    impl Write for FakeAdapter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            for &byte in buf {
                if byte == CR {
                    let command = String::from_utf8_lossy(&self.line).into_owned();
                    self.output.extend((self.answer)(&command));
                    self.commands.push(command);
                    self.line.clear();
                } else {
                    self.line.push(byte);
                }
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Line for FakeAdapter {
        fn set_read_timeout(&mut self, _timeout: Duration) -> Result<(), TransportError> {
            Ok(())
        }

        fn clear_input(&mut self) -> Result<(), TransportError> {
            self.output.clear();
            Ok(())
        }
    }

    #[test]
    fn channel_starts_when_adapter_accepts() {
        let mut port = Port::new(FakeAdapter::new(|_| &b"\r"[..]));
        port.start_channel(8).unwrap();
        assert_eq!(port.serial.commands, ["C", "S8", "O"]);
    }

    #[test]
    fn bell_to_close_is_ignored() {
        let mut port = Port::new(FakeAdapter::new(|c| if c == "C" { &b"\x07"[..] } else { &b"\r"[..] }));
        port.start_channel(6).unwrap();
        assert_eq!(port.serial.commands, ["C", "S6", "O"]);
    }

    #[test]
    fn rejected_open_fails() {
        let mut port = Port::new(FakeAdapter::new(|c| if c == "O" { &b"\x07"[..] } else { &b"\r"[..] }));
        let err = port.start_channel(8).unwrap_err();
        assert!(matches!(err, TransportError::AdapterRejected(ref c) if c == "O"), "{err:?}");
    }

    #[test]
    fn rejected_bit_rate_stops_before_open() {
        let mut port = Port::new(FakeAdapter::new(|c| if c.starts_with('S') { &b"\x07"[..] } else { &b"\r"[..] }));
        let err = port.start_channel(8).unwrap_err();
        assert!(matches!(err, TransportError::AdapterRejected(ref c) if c == "S8"), "{err:?}");
        assert_eq!(port.serial.commands, ["C", "S8"]);
    }

    #[test]
    fn silent_adapter_fails() {
        let mut port = Port::new(FakeAdapter::new(|_| &b""[..]));
        let err = port.start_channel(8).unwrap_err();
        assert!(matches!(err, TransportError::AdapterSilent(ref c) if c == "S8"), "{err:?}");
    }

    #[test]
    fn records_split_on_cr_and_bell() {
        let mut port = Port::new(FakeAdapter::new(|_| &b""[..]));
        port.serial.output.extend(b"t7FE0\r\x07z\r");
        assert_eq!(port.read_record(COMMAND_TIMEOUT).unwrap(), Some(Record::Line(b"t7FE0".to_vec())));
        assert_eq!(port.read_record(COMMAND_TIMEOUT).unwrap(), Some(Record::Error));
        assert_eq!(port.read_record(COMMAND_TIMEOUT).unwrap(), Some(Record::Line(b"z".to_vec())));
        assert_eq!(port.read_record(COMMAND_TIMEOUT).unwrap(), None);
    }

    #[test]
    fn encodes_standard_frames() {
        let frame = CanFrame::new(0x03, &[0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x01, 0x02, 0xFF]).unwrap();
        assert_eq!(encode_frame(&frame), "t0038DEADBEEF000102FF");

        let frame = CanFrame::new(0x02, &[0x00]).unwrap();
        assert_eq!(encode_frame(&frame), "t002100");
    }

    #[test]
    fn encodes_extended_frames() {
        let frame = CanFrame::new(0x1234_5678, &[]).unwrap();
        assert_eq!(encode_frame(&frame), "T123456780");
    }

    #[test]
    fn parses_response_records() {
        assert_eq!(parse_record(b"t7FE0"), CanFrame::new(0x7FE, &[]));
        assert_eq!(parse_record(b"t7D0201FF"), CanFrame::new(0x7D0, &[0x01, 0xFF]));
        assert_eq!(parse_record(b"T0000002781AB"), CanFrame::new(0x27, &[0xAB]));
        assert_eq!(parse_record(b"r7FF2"), CanFrame::new(0x7FF, &[]));
    }

    #[test]
    fn ignores_acknowledgments_and_garbage() {
        assert_eq!(parse_record(b""), None);
        assert_eq!(parse_record(b"z"), None);
        assert_eq!(parse_record(b"Z"), None);
        assert_eq!(parse_record(b"t7FE"), None);
        assert_eq!(parse_record(b"t7FE9"), None);
        assert_eq!(parse_record(b"t7FE2AB"), None);
        assert_eq!(parse_record(b"t7FE1GG"), None);
    }

    #[test]
    fn known_bit_rates() {
        assert_eq!(bit_rate_code(1_000_000), Some(8));
        assert_eq!(bit_rate_code(500_000), Some(6));
        assert_eq!(bit_rate_code(125_000), Some(4));
        assert_eq!(bit_rate_code(1_234), None);
    }
}
