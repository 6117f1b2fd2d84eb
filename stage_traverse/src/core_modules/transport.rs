// THEORY:
// The `transport` module is the seam between the stage worker and the physical
// byte stream. The worker only ever sees the `Transport` trait, so the real serial
// driver lives outside this crate and the in-memory `SimulatedStage` can stand in
// for it in tests and dry runs.
//
// The trait is blocking. Exactly one thread, the stage worker, ever owns a
// transport.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::core_modules::stage_protocol::{
    POLL_COMMAND, format_position_reply, parse_move_command,
};
use crate::error::TransportError;

/// Parity bit for the serial line. The bench controller runs without one; the
/// other settings exist for drivers talking to differently wired controllers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Parity {
    None,
    Odd,
    Even,
}

/// Line settings applied to the port after every open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: Parity,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
            read_timeout_ms: 2000,
            write_timeout_ms: 2000,
        }
    }
}

/// A byte stream to the stage controller.
///
/// The hardware serial driver is supplied by the host application. Drivers report
/// `TransportError::Open`, `Configure`, `Write` and `Read` from the matching calls;
/// a read that simply times out returns `Ok(0)` rather than an error.
pub trait Transport: Send + 'static {
    fn open(&mut self, port: &str) -> Result<(), TransportError>;

    fn configure(&mut self, settings: &SerialSettings) -> Result<(), TransportError>;

    fn write(&mut self, bytes: &[u8]) -> Result<usize, TransportError>;

    /// Reads whatever is available into `buf`. Returns 0 when nothing arrived
    /// within the port's own read timeout.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    fn close(&mut self);
}

/// Timing for collecting a controller reply.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResponseTiming {
    /// Pause before the first read, giving the controller time to answer.
    pub initial_delay: Duration,
    /// Pause between empty reads.
    pub poll_interval: Duration,
    /// Total budget; the number of read attempts is `max_wait / poll_interval`.
    pub max_wait: Duration,
}

/// Reads until a CR or LF shows up or the attempt budget runs out.
///
/// Returns whatever text was collected, which may be empty.
pub fn read_response<T: Transport + ?Sized>(
    transport: &mut T,
    timing: &ResponseTiming,
) -> Result<String, TransportError> {
    let mut response = String::new();
    let mut buffer = [0u8; 512];

    std::thread::sleep(timing.initial_delay);

    let interval = timing.poll_interval.max(Duration::from_millis(1));
    let attempts = (timing.max_wait.as_millis() / interval.as_millis()).max(1);

    for _ in 0..attempts {
        let n = transport.read(&mut buffer)?;
        if n > 0 {
            response.push_str(&String::from_utf8_lossy(&buffer[..n]));
            if response.contains(['\r', '\n']) {
                break;
            }
        }
        if response.is_empty() {
            std::thread::sleep(interval);
        }
    }

    Ok(response)
}

/// Observable state of a `SimulatedStage`.
#[derive(Debug, Clone, Default)]
pub struct SimulatorState {
    /// Absolute position in controller units.
    pub units: [i64; 3],
    /// Every line written to the port, poll commands included.
    pub written: Vec<String>,
    pub opens: usize,
    pub closes: usize,
    /// Next `open` calls that should fail.
    pub fail_opens: usize,
    /// Answer polls with a line that has no position delimiter.
    pub garble_replies: bool,
    /// Fail every `read` as a broken line would.
    pub fail_reads: bool,
    is_open: bool,
    pending_reply: Vec<u8>,
}

/// In-memory stand-in for the stage controller.
///
/// Clones share state, so a test can keep one clone as a probe while the stage
/// worker owns the other.
#[derive(Debug, Clone, Default)]
pub struct SimulatedStage {
    state: Arc<Mutex<SimulatorState>>,
}

impl SimulatedStage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts the simulated stage at `units` (controller units).
    pub fn at_units(units: [i64; 3]) -> Self {
        let sim = Self::default();
        sim.lock().units = units;
        sim
    }

    fn lock(&self) -> MutexGuard<'_, SimulatorState> {
        // A poisoned simulator only means a test thread panicked mid-write; the
        // data is still the best record we have.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> SimulatorState {
        self.lock().clone()
    }

    pub fn units(&self) -> [i64; 3] {
        self.lock().units
    }

    /// Move lines written so far, polls excluded.
    pub fn move_commands(&self) -> Vec<String> {
        self.lock()
            .written
            .iter()
            .filter(|l| l.as_str() != POLL_COMMAND)
            .cloned()
            .collect()
    }

    pub fn fail_next_opens(&self, count: usize) {
        self.lock().fail_opens = count;
    }

    pub fn set_garble_replies(&self, garble: bool) {
        self.lock().garble_replies = garble;
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.lock().fail_reads = fail;
    }
}

impl Transport for SimulatedStage {
    fn open(&mut self, port: &str) -> Result<(), TransportError> {
        let mut s = self.lock();
        if s.fail_opens > 0 {
            s.fail_opens -= 1;
            return Err(TransportError::Open {
                port: port.to_string(),
                reason: "simulated open failure".to_string(),
            });
        }
        s.opens += 1;
        s.is_open = true;
        Ok(())
    }

    fn configure(&mut self, _settings: &SerialSettings) -> Result<(), TransportError> {
        if self.lock().is_open {
            Ok(())
        } else {
            Err(TransportError::NotOpen)
        }
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize, TransportError> {
        let mut s = self.lock();
        if !s.is_open {
            return Err(TransportError::NotOpen);
        }
        let line = String::from_utf8_lossy(bytes).into_owned();

        if line == POLL_COMMAND {
            let reply = if s.garble_replies {
                "/0?garbled\r\n".to_string()
            } else {
                format_position_reply(s.units)
            };
            s.pending_reply.extend_from_slice(reply.as_bytes());
        } else {
            match parse_move_command(&line) {
                Ok(Some(parsed)) => {
                    let sign = parsed.direction.sign();
                    for (axis, step) in s.units.iter_mut().zip(parsed.displacement_units) {
                        *axis += sign * step;
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::warn!("simulator ignoring unrecognised line: {e}"),
            }
        }

        s.written.push(line);
        Ok(bytes.len())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let mut s = self.lock();
        if !s.is_open {
            return Err(TransportError::NotOpen);
        }
        if s.fail_reads {
            return Err(TransportError::Read("simulated line fault".to_string()));
        }
        let n = s.pending_reply.len().min(buf.len());
        buf[..n].copy_from_slice(&s.pending_reply[..n]);
        s.pending_reply.drain(..n);
        Ok(n)
    }

    fn close(&mut self) {
        let mut s = self.lock();
        if s.is_open {
            s.closes += 1;
        }
        s.is_open = false;
        s.pending_reply.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn timed<R>(f: impl FnOnce() -> R) -> (R, Duration) {
        let start = Instant::now();
        let r = f();
        (r, start.elapsed())
    }

    fn fast_timing() -> ResponseTiming {
        ResponseTiming {
            initial_delay: Duration::ZERO,
            poll_interval: Duration::from_millis(1),
            max_wait: Duration::from_millis(20),
        }
    }

    #[test]
    fn simulator_answers_polls_with_its_position() {
        let mut sim = SimulatedStage::at_units([10, -20, 30]);
        sim.open("SIM").unwrap();
        sim.write(POLL_COMMAND.as_bytes()).unwrap();
        let reply = read_response(&mut sim, &fast_timing()).unwrap();
        assert_eq!(reply, "/0`10,-20,30\r\n");
    }

    #[test]
    fn simulator_integrates_moves() {
        let mut sim = SimulatedStage::new();
        sim.open("SIM").unwrap();
        sim.write(b"/1V880,880P88,44R\r\n").unwrap();
        sim.write(b"/1V,,100D,,5R\r\n").unwrap();
        sim.write(b"0").unwrap();
        assert_eq!(sim.units(), [88, 44, -5]);
        assert_eq!(sim.move_commands().len(), 3);
    }

    #[test]
    fn closed_simulator_rejects_io() {
        let mut sim = SimulatedStage::new();
        assert!(matches!(sim.write(b"0"), Err(TransportError::NotOpen)));
        sim.fail_next_opens(1);
        assert!(sim.open("SIM").is_err());
        assert!(sim.open("SIM").is_ok());
        sim.close();
        assert_eq!(sim.snapshot().closes, 1);
    }

    #[test]
    fn read_faults_surface_from_read_response() {
        let mut sim = SimulatedStage::new();
        sim.open("SIM").unwrap();
        sim.set_fail_reads(true);
        sim.write(POLL_COMMAND.as_bytes()).unwrap();
        assert!(matches!(
            read_response(&mut sim, &fast_timing()),
            Err(TransportError::Read(_))
        ));
    }

    #[test]
    fn empty_reply_times_out_to_empty_string() {
        let mut sim = SimulatedStage::new();
        sim.open("SIM").unwrap();
        let (reply, elapsed) = timed(|| read_response(&mut sim, &fast_timing()));
        assert_eq!(reply.unwrap(), "");
        assert!(elapsed >= Duration::from_millis(20));
    }
}
