//! Microcontroller link.
//!
//! The MCU drives camera triggers and lights from the uploaded schedule and
//! reports input-pin state changes back over the same serial line. All I/O
//! here is blocking with a 100 ms port timeout and belongs on a dedicated
//! thread.
//!
//! Wire protocol (newline-terminated ASCII unless noted):
//! - Handshake: the MCU announces `READY` while idle.
//! - Upload: an STX-delimited packet of newline-separated fields — cycle
//!   count, cycle duration, input pins, random-output pins, cycles per
//!   random bit flip, then the event times/pins/states arrays — closed with
//!   ETX. The MCU acknowledges with `RECEIVED`.
//! - While acquiring: `F` marks completion; an STX byte prefixes a 12-byte
//!   little-endian input record `(u16 pin, u8 state, u32 micros, u32 cycle)`
//!   plus a trailing newline. Anything else is a protocol error.
//! - Interrupt: host sends `I`, MCU answers `INTERRUPTED`.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serialport::{ClearBuffer, SerialPort};

use crate::error::{AcqError, AppResult};
use crate::schedule::Schedule;

pub const STX: u8 = 0x02;
pub const ETX: u8 = 0x03;

/// Port read timeout; response waits poll in units of this.
const PORT_READ_TIMEOUT: Duration = Duration::from_millis(100);
/// 5 s worth of 100 ms polls when waiting for a handshake token.
const RESPONSE_POLLS: u32 = 50;
/// Bytes in an input-pin record after the STX, including the newline.
const INPUT_RECORD_LEN: usize = 12;

/// Append-only log of MCU-reported input events.
pub struct TriggerLog {
    writer: csv::Writer<File>,
}

impl TriggerLog {
    pub fn create(path: &Path) -> AppResult<Self> {
        let mut writer = csv::Writer::from_writer(File::create(path)?);
        writer.write_record(["time", "pin", "state"])?;
        writer.flush()?;
        Ok(Self { writer })
    }

    fn append(&mut self, time_us: u64, pin: u16, state: u8) -> AppResult<()> {
        self.writer.write_record([
            time_us.to_string(),
            pin.to_string(),
            state.to_string(),
        ])?;
        Ok(())
    }

    fn flush(&mut self) -> AppResult<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// One input-pin state change reported by the MCU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InputEvent {
    pub pin: u16,
    pub state: u8,
    pub micros_within_cycle: u32,
    pub cycle_index: u32,
}

impl InputEvent {
    /// Decode the 11 payload bytes of an input record (newline excluded).
    pub fn parse(data: &[u8; 11]) -> Self {
        Self {
            pin: u16::from_le_bytes([data[0], data[1]]),
            state: data[2],
            micros_within_cycle: u32::from_le_bytes([data[3], data[4], data[5], data[6]]),
            cycle_index: u32::from_le_bytes([data[7], data[8], data[9], data[10]]),
        }
    }

    /// Time since acquisition start in microseconds.
    pub fn absolute_time_us(&self, cycle_duration_us: u32) -> u64 {
        u64::from(self.cycle_index) * u64::from(cycle_duration_us)
            + u64::from(self.micros_within_cycle)
    }
}

/// Why the acquisition loop returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// The MCU finished all requested cycles (`F`).
    Finished,
    /// The wall-clock deadline passed; the MCU was interrupted.
    DeadlineReached,
    /// The stop flag was raised; the MCU was interrupted.
    Interrupted,
}

/// List candidate serial ports on this host.
pub fn find_serial_ports() -> Vec<String> {
    serialport::available_ports()
        .map(|ports| ports.into_iter().map(|p| p.port_name).collect())
        .unwrap_or_default()
}

/// Build the newline-separated upload packet for a schedule.
///
/// Returned as one buffer per line, newline excluded.
pub fn upload_lines(schedule: &Schedule, num_cycles: u32) -> Vec<Vec<u8>> {
    fn join<T: ToString>(values: impl IntoIterator<Item = T>) -> Vec<u8> {
        values
            .into_iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(",")
            .into_bytes()
    }

    vec![
        vec![STX],
        num_cycles.to_string().into_bytes(),
        schedule.cycle_duration_us.to_string().into_bytes(),
        join(schedule.input_pins.iter()),
        join(schedule.random_output_pins.iter()),
        schedule.cycles_per_random_bit_flip.to_string().into_bytes(),
        join(schedule.events.iter().map(|e| e.time_us)),
        join(schedule.events.iter().map(|e| e.pin)),
        join(schedule.events.iter().map(|e| e.state)),
        vec![ETX],
    ]
}

/// Read one line from the port, giving up at the port's read timeout.
fn read_line(port: &mut dyn SerialPort) -> String {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match port.read(&mut byte) {
            Ok(1) if byte[0] == b'\n' => break,
            Ok(1) => line.push(byte[0]),
            _ => break,
        }
    }
    String::from_utf8_lossy(&line).trim().to_string()
}

/// Poll for an expected token, up to ~5 seconds.
fn check_for_response(port: &mut dyn SerialPort, expected: &str, context: &str) -> bool {
    for _ in 0..RESPONSE_POLLS {
        let line = read_line(port);
        if !line.is_empty() {
            debug!("[mcu] {context}: received '{line}', expected '{expected}'");
        }
        if line == expected {
            return true;
        }
    }
    false
}

pub struct Microcontroller {
    port: Box<dyn SerialPort>,
    schedule: Schedule,
    trigger_log: Option<TriggerLog>,
    events_logged: u64,
}

impl std::fmt::Debug for Microcontroller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Microcontroller")
            .field("port", &self.port.name())
            .field("schedule", &self.schedule)
            .field("trigger_log", &self.trigger_log.is_some())
            .field("events_logged", &self.events_logged)
            .finish()
    }
}

impl Microcontroller {
    /// Open the serial link and wait for the MCU to announce `READY`.
    ///
    /// With a configured port only that port is tried; otherwise every port
    /// on the host is probed and the first ready MCU wins.
    pub fn open(
        configured_port: Option<&str>,
        baud_rate: u32,
        schedule: Schedule,
        trigger_log: Option<TriggerLog>,
    ) -> AppResult<Self> {
        let candidates: Vec<String> = match configured_port {
            Some(port) => vec![port.to_string()],
            None => find_serial_ports(),
        };
        if candidates.is_empty() {
            return Err(AcqError::McuHandshake(
                "no serial ports available (close other serial connections?)".into(),
            ));
        }

        for name in &candidates {
            let mut port = match serialport::new(name.as_str(), baud_rate)
                .timeout(PORT_READ_TIMEOUT)
                .open()
            {
                Ok(port) => port,
                Err(err) => {
                    debug!("[mcu] could not open {name}: {err}");
                    continue;
                }
            };
            if check_for_response(port.as_mut(), "READY", name) {
                info!("Found ready microcontroller on port {name}");
                return Ok(Self {
                    port,
                    schedule,
                    trigger_log,
                    events_logged: 0,
                });
            }
        }
        Err(AcqError::McuHandshake(format!(
            "no microcontroller reported READY on {} port(s); try restarting it",
            candidates.len()
        )))
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    /// Upload the schedule and start cyclic acquisition.
    pub fn start_acquisition(&mut self, duration: Duration) -> AppResult<()> {
        let num_cycles = self.schedule.num_cycles(duration);
        info!(
            "Starting acquisition: {num_cycles} cycles of {} us",
            self.schedule.cycle_duration_us
        );
        for line in upload_lines(&self.schedule, num_cycles) {
            self.port.write_all(&line)?;
            self.port.write_all(b"\n")?;
        }
        self.port.flush()?;
        // Discard READY announcements queued while we were uploading.
        self.port.clear(ClearBuffer::Input)?;

        if !check_for_response(self.port.as_mut(), "RECEIVED", "start") {
            return Err(AcqError::McuHandshake(
                "microcontroller did not acknowledge the schedule with RECEIVED".into(),
            ));
        }
        Ok(())
    }

    /// Check once for input from the MCU.
    ///
    /// Returns `Ok(true)` when the MCU reports the acquisition finished.
    /// Input-pin records are appended to the trigger log as
    /// `absolute_time,pin,state`.
    pub fn check_for_input(&mut self) -> AppResult<bool> {
        if self.port.bytes_to_read()? == 0 {
            return Ok(false);
        }
        let mut byte = [0u8; 1];
        self.port.read_exact(&mut byte)?;
        match byte[0] {
            b'F' => {
                // Consume the trailing newline if it is already here.
                let _ = self.port.read(&mut byte);
                Ok(true)
            }
            STX => {
                let mut record = [0u8; INPUT_RECORD_LEN];
                self.port.read_exact(&mut record)?;
                let mut payload = [0u8; 11];
                payload.copy_from_slice(&record[..11]);
                let event = InputEvent::parse(&payload);
                let time = event.absolute_time_us(self.schedule.cycle_duration_us);
                if let Some(log) = self.trigger_log.as_mut() {
                    log.append(time, event.pin, event.state)?;
                }
                self.events_logged += 1;
                Ok(false)
            }
            other => Err(AcqError::McuProtocol(format!(
                "unexpected byte 0x{other:02x} from microcontroller"
            ))),
        }
    }

    /// Interrupt a running acquisition.
    pub fn interrupt_acquisition(&mut self) -> AppResult<()> {
        self.port.clear(ClearBuffer::Input)?;
        self.port.write_all(b"I")?;
        self.port.flush()?;
        if !check_for_response(self.port.as_mut(), "INTERRUPTED", "interrupt") {
            return Err(AcqError::McuHandshake(
                "microcontroller did not acknowledge the interrupt".into(),
            ));
        }
        info!("Microcontroller acquisition loop interrupted");
        Ok(())
    }

    /// Poll the input stream until the MCU finishes, the deadline passes,
    /// or the stop flag is raised. Runs on a dedicated thread.
    pub fn run_to_completion(
        &mut self,
        deadline: Instant,
        stop: &AtomicBool,
    ) -> AppResult<RunOutcome> {
        loop {
            if self.check_for_input()? {
                return Ok(RunOutcome::Finished);
            }
            if stop.load(Ordering::SeqCst) {
                self.interrupt_acquisition()?;
                return Ok(RunOutcome::Interrupted);
            }
            if Instant::now() >= deadline {
                warn!("Recording deadline passed before the MCU finished");
                self.interrupt_acquisition()?;
                return Ok(RunOutcome::DeadlineReached);
            }
            // check_for_input returns immediately when the line is idle.
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Flush the trigger log and release the port.
    pub fn close(mut self) -> AppResult<()> {
        if let Some(log) = self.trigger_log.as_mut() {
            log.flush()?;
        }
        info!(
            "Microcontroller link closed ({} input events logged)",
            self.events_logged
        );
        Ok(())
    }
}

/// Drive the MCU schedule with no cameras attached.
///
/// Emulates a full acquisition for rig bring-up: upload, run with progress
/// reports, interrupt on the stop flag. No trigger-data file is written.
pub fn run_standalone(
    config: &crate::config::RecordingConfig,
    duration: Duration,
    stop: Arc<AtomicBool>,
) -> AppResult<()> {
    let schedule = crate::schedule::plan(
        &config.microcontroller,
        config.n_depth(),
        config.globals.fps,
        config.max_machine_vision_exposure_us(),
    )?;
    let mut mcu = Microcontroller::open(
        config.microcontroller.port.as_deref(),
        config.microcontroller.baud_rate,
        schedule,
        None,
    )?;
    mcu.start_acquisition(duration)?;

    let started = Instant::now();
    let deadline = started + duration + Duration::from_secs(5);
    let mut last_report = started;
    let outcome = loop {
        if mcu.check_for_input()? {
            break RunOutcome::Finished;
        }
        if stop.load(Ordering::SeqCst) {
            mcu.interrupt_acquisition()?;
            break RunOutcome::Interrupted;
        }
        if Instant::now() >= deadline {
            mcu.interrupt_acquisition()?;
            break RunOutcome::DeadlineReached;
        }
        if last_report.elapsed() >= Duration::from_secs(1) {
            let total = started.elapsed().as_secs();
            let pct = 100.0 * total as f64 / duration.as_secs_f64().max(1.0);
            info!("Recording progress: {pct:.1}% ({total} / {} s)", duration.as_secs());
            last_report = Instant::now();
        }
        std::thread::sleep(Duration::from_millis(1));
    };
    info!("Standalone run ended: {outcome:?}");
    mcu.close()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::ScheduleEvent;

    fn schedule() -> Schedule {
        Schedule {
            cycle_duration_us: 33_333,
            events: vec![
                ScheduleEvent {
                    time_us: 0,
                    pin: 1,
                    state: 1,
                },
                ScheduleEvent {
                    time_us: 100,
                    pin: 1,
                    state: 0,
                },
                ScheduleEvent {
                    time_us: 4725,
                    pin: 0,
                    state: 1,
                },
            ],
            input_pins: vec![10, 12],
            random_output_pins: vec![],
            cycles_per_random_bit_flip: 1,
        }
    }

    #[test]
    fn test_upload_packet_layout() {
        let lines = upload_lines(&schedule(), 1800);
        assert_eq!(lines.len(), 10);
        assert_eq!(lines[0], vec![STX]);
        assert_eq!(lines[1], b"1800".to_vec());
        assert_eq!(lines[2], b"33333".to_vec());
        assert_eq!(lines[3], b"10,12".to_vec());
        assert_eq!(lines[4], b"".to_vec()); // no random-output pins
        assert_eq!(lines[5], b"1".to_vec());
        assert_eq!(lines[6], b"0,100,4725".to_vec());
        assert_eq!(lines[7], b"1,1,0".to_vec());
        assert_eq!(lines[8], b"1,0,1".to_vec());
        assert_eq!(lines[9], vec![ETX]);
    }

    #[test]
    fn test_input_event_decoding() {
        // pin=7, state=1, micros=5000, cycle=3
        let mut data = [0u8; 11];
        data[..2].copy_from_slice(&7u16.to_le_bytes());
        data[2] = 1;
        data[3..7].copy_from_slice(&5000u32.to_le_bytes());
        data[7..11].copy_from_slice(&3u32.to_le_bytes());

        let event = InputEvent::parse(&data);
        assert_eq!(
            event,
            InputEvent {
                pin: 7,
                state: 1,
                micros_within_cycle: 5000,
                cycle_index: 3
            }
        );
        assert_eq!(event.absolute_time_us(33_333), 3 * 33_333 + 5000);
    }

    #[test]
    fn test_absolute_time_does_not_overflow_long_runs() {
        let event = InputEvent {
            pin: 0,
            state: 1,
            micros_within_cycle: 33_000,
            cycle_index: u32::MAX,
        };
        // Around 39.7 hours of cycles; must not wrap.
        assert_eq!(
            event.absolute_time_us(33_333),
            u64::from(u32::MAX) * 33_333 + 33_000
        );
    }

    #[test]
    fn test_trigger_log_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.triggerdata.csv");
        let mut log = TriggerLog::create(&path).unwrap();
        log.append(104_999, 10, 1).unwrap();
        log.append(105_999, 10, 0).unwrap();
        log.flush().unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines, vec!["time,pin,state", "104999,10,1", "105999,10,0"]);
    }

    #[test]
    fn test_open_fails_fast_with_no_candidate_ports() {
        // A nonexistent path fails to open, leaving zero READY candidates.
        let err = Microcontroller::open(
            Some("/dev/does-not-exist-multicam"),
            115_200,
            schedule(),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, AcqError::McuHandshake(_)));
        assert_eq!(err.exit_code(), 2);
    }
}
