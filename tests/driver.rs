// Control loop scenarios against a simulated board and bus

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use amc_zenoh_driver::amc::protocol::{encode_set, AmcError, Channel, Crc8};
use amc_zenoh_driver::amc::{AmcDriver, AmcParser, Bus, DriverOutcome, DriverState, Transport};
use amc_zenoh_driver::config::{DriverConfig, Timing};
use amc_zenoh_driver::messages::{
    ActuationRequest, HealthReport, HealthState, RestartRequest, RpmSample,
};

const CRC: Crc8 = Crc8::new(0x07);
const SETTLE: Duration = Duration::from_millis(5);

/// Simulated AMC board: records writes and answers read commands
struct MockBoard {
    inbound: VecDeque<u8>,
    writes: Vec<(Instant, Vec<u8>)>,
    fail_reads: bool,
    fail_writes: bool,
    fail_polls: bool,
    poll_calls: usize,
    faulted: Vec<u8>,
    rpm: [i32; 4],
}

impl MockBoard {
    fn new() -> Self {
        Self {
            inbound: VecDeque::new(),
            writes: Vec::new(),
            fail_reads: false,
            fail_writes: false,
            fail_polls: false,
            poll_calls: 0,
            faulted: Vec::new(),
            rpm: [100, -200, 300, -400],
        }
    }

    fn reply(&mut self, body: String) {
        let mut bytes = body.into_bytes();
        bytes.push(CRC.checksum(&bytes[..bytes.len() - 1]));
        self.inbound.extend(bytes);
    }

    /// ASCII bodies of every write, checksum stripped
    fn bodies(&self) -> Vec<String> {
        self.writes
            .iter()
            .map(|(_, w)| String::from_utf8_lossy(&w[..w.len() - 1]).into_owned())
            .collect()
    }
}

impl Transport for MockBoard {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        if self.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "port gone"));
        }
        self.writes.push((Instant::now(), bytes.to_vec()));

        let body = String::from_utf8_lossy(&bytes[..bytes.len() - 1]).into_owned();
        let parts: Vec<&str> = body.split(',').collect();
        if let ["@R", ch, field, "*"] = parts.as_slice() {
            let ch: u8 = ch.parse().unwrap();
            match *field {
                "sta" => {
                    let ok = if self.faulted.contains(&ch) { 0 } else { 1 };
                    self.reply(format!("@sta,{},{},*", ch, ok));
                }
                "rpm" => {
                    let rpm = self.rpm[ch as usize];
                    self.reply(format!("@rpm,{},{},*", ch, rpm));
                }
                _ => {}
            }
        }
        Ok(bytes.len())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.fail_reads {
            return Err(io::Error::new(io::ErrorKind::Other, "line noise"));
        }
        match self.inbound.pop_front() {
            Some(b) => {
                buf[0] = b;
                Ok(1)
            }
            None => Ok(0),
        }
    }

    fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool> {
        self.poll_calls += 1;
        if self.fail_polls {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "device unplugged"));
        }
        if self.fail_reads || !self.inbound.is_empty() {
            return Ok(true);
        }
        std::thread::sleep(timeout);
        Ok(false)
    }
}

/// Bus that records everything and raises stop after enough samples
struct MockBus {
    stop: Arc<AtomicBool>,
    stop_after: usize,
    samples: Vec<RpmSample>,
    health: Vec<HealthReport>,
    restarts: Vec<RestartRequest>,
    actuations: VecDeque<ActuationRequest>,
}

impl MockBus {
    fn new(stop: Arc<AtomicBool>, stop_after: usize) -> Self {
        Self {
            stop,
            stop_after,
            samples: Vec::new(),
            health: Vec::new(),
            restarts: Vec::new(),
            actuations: VecDeque::new(),
        }
    }
}

impl Bus for MockBus {
    fn publish_rpm(&mut self, sample: &RpmSample) -> Result<(), AmcError> {
        self.samples.push(sample.clone());
        if self.samples.len() >= self.stop_after {
            self.stop.store(true, Ordering::Relaxed);
        }
        Ok(())
    }

    fn report_health(&mut self, report: &HealthReport) -> Result<(), AmcError> {
        self.health.push(report.clone());
        Ok(())
    }

    fn request_restart(&mut self, request: &RestartRequest) -> Result<(), AmcError> {
        self.restarts.push(request.clone());
        Ok(())
    }

    fn next_actuation(&mut self, timeout: Duration) -> Option<ActuationRequest> {
        let next = self.actuations.pop_front();
        if next.is_none() {
            std::thread::sleep(timeout);
        }
        next
    }
}

fn test_config() -> DriverConfig {
    DriverConfig {
        labels: [
            "Port Motor".to_string(),
            "Starboard Motor".to_string(),
            String::new(),
            String::new(),
        ],
        crc_poly: 0x07,
        timing: Timing {
            settle: SETTLE,
            response_wait: Duration::from_millis(5),
            poll_wait: Duration::from_millis(1),
            bus_wait: Duration::from_millis(1),
            watchdog: Duration::from_secs(10),
            restart_backoff: Duration::from_secs(2),
        },
        ..DriverConfig::default()
    }
}

fn driver_with(
    board: MockBoard,
    bus: MockBus,
    config: &DriverConfig,
) -> AmcDriver<MockBoard, AmcParser, MockBus> {
    AmcDriver::new(board, AmcParser::new(Crc8::new(config.crc_poly)), bus, config)
}

fn set_frame(ch: u8, value: i32) -> Vec<u8> {
    encode_set(&CRC, Channel::try_from(ch).unwrap(), value)
        .unwrap()
        .as_bytes()
        .to_vec()
}

fn stop_bodies() -> Vec<String> {
    (0..4).map(|ch| format!("@S,{},0,*", ch)).collect()
}

#[test]
fn test_round_robin_polling() {
    let stop = Arc::new(AtomicBool::new(false));
    let config = test_config();
    let mut driver = driver_with(MockBoard::new(), MockBus::new(stop.clone(), 8), &config);

    assert_eq!(driver.run(&stop), DriverOutcome::Stopped);

    let polled: Vec<String> = driver
        .transport()
        .bodies()
        .into_iter()
        .filter(|b| b.ends_with(",rpm,*"))
        .collect();
    let expected: Vec<String> = [0, 1, 2, 3, 0, 1, 2, 3]
        .iter()
        .map(|ch| format!("@R,{},rpm,*", ch))
        .collect();
    assert_eq!(polled, expected);

    let bus = driver.bus();
    let labels: Vec<&str> = bus.samples.iter().map(|s| s.label.as_str()).collect();
    assert_eq!(
        labels[..4],
        ["Port Motor", "Starboard Motor", "motor2", "motor3"]
    );

    // First round publishes before any reply was decoded
    let values: Vec<i32> = bus.samples.iter().map(|s| s.value).collect();
    assert_eq!(values, vec![0, 0, 0, 0, 100, -200, 300, -400]);
    assert_eq!(driver.motors()[3].measured_rpm, -400);
}

#[test]
fn test_actuation_drives_channel_pair() {
    let stop = Arc::new(AtomicBool::new(false));
    let config = test_config();
    let mut bus = MockBus::new(stop.clone(), 1);
    bus.actuations.push_back(ActuationRequest { id: 0, value: 1200.0 });
    let mut driver = driver_with(MockBoard::new(), bus, &config);

    assert_eq!(driver.run(&stop), DriverOutcome::Stopped);

    let writes = &driver.transport().writes;
    let first = writes
        .iter()
        .position(|(_, w)| *w == set_frame(0, 1200))
        .expect("channel 0 command");
    assert_eq!(writes[first + 1].1, set_frame(1, 1200));
    assert!(writes[first + 1].0 - writes[first].0 >= SETTLE);

    // Followed only by the drain sequence
    assert_eq!(writes.len(), first + 2 + 4);
}

#[test]
fn test_unknown_ids_and_bad_values_are_not_sent() {
    let stop = Arc::new(AtomicBool::new(false));
    let config = test_config();
    let mut bus = MockBus::new(stop.clone(), 1);
    bus.actuations.push_back(ActuationRequest { id: 2, value: 100.0 });
    bus.actuations.push_back(ActuationRequest { id: 1, value: f64::NAN });
    bus.actuations.push_back(ActuationRequest { id: 1, value: 1e10 });
    let mut driver = driver_with(MockBoard::new(), bus, &config);

    driver.run(&stop);

    // 4 state reads, 4 stops, 1 rpm read, 4 stops
    let bodies = driver.transport().bodies();
    assert_eq!(bodies.len(), 13);
    assert!(bodies.iter().all(|b| b.starts_with("@R,") || b.ends_with(",0,*")));
    assert!(driver.motors().iter().all(|m| m.target_rpm == 0));
}

#[test]
fn test_startup_fault_degrades_health() {
    let stop = Arc::new(AtomicBool::new(true));
    let config = test_config();
    let mut board = MockBoard::new();
    board.faulted.push(2);
    let mut driver = driver_with(board, MockBus::new(stop.clone(), usize::MAX), &config);

    assert_eq!(driver.run(&stop), DriverOutcome::Stopped);

    let health = &driver.bus().health;
    let errors: Vec<&HealthReport> = health
        .iter()
        .filter(|h| h.state == HealthState::Error)
        .collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].message, "1 motor(s) in fault");
    assert!(!driver.motors()[2].healthy);
    assert!(driver.motors()[0].healthy);

    // Stop sequence still runs at startup, then again when draining
    let bodies = driver.transport().bodies();
    let reads: Vec<String> = (0..4).map(|ch| format!("@R,{},sta,*", ch)).collect();
    assert_eq!(bodies[..4], reads[..]);
    assert_eq!(bodies[4..8], stop_bodies()[..]);
    assert_eq!(bodies[8..], stop_bodies()[..]);
}

#[test]
fn test_drain_always_sends_four_stops() {
    let stop = Arc::new(AtomicBool::new(true));
    let config = test_config();
    let mut driver = driver_with(MockBoard::new(), MockBus::new(stop.clone(), usize::MAX), &config);

    assert_eq!(driver.run(&stop), DriverOutcome::Stopped);
    assert_eq!(driver.state(), DriverState::Draining);

    let writes = &driver.transport().writes;
    let drain = &writes[writes.len() - 4..];
    for (ch, (_, frame)) in drain.iter().enumerate() {
        assert_eq!(*frame, set_frame(ch as u8, 0));
    }
    for pair in drain.windows(2) {
        assert!(pair[1].0 - pair[0].0 >= SETTLE);
    }

    let health = &driver.bus().health;
    assert_eq!(health.last(), Some(&HealthReport::normal("active")));
}

#[test]
fn test_watchdog_overflow_requests_one_restart() {
    let stop = Arc::new(AtomicBool::new(false));
    let mut config = test_config();
    config.timing.watchdog = Duration::from_millis(40);
    let mut board = MockBoard::new();
    board.fail_reads = true;
    let mut driver = driver_with(board, MockBus::new(stop.clone(), usize::MAX), &config);

    let outcome = driver.run(&stop);

    let bus = driver.bus();
    assert_eq!(bus.restarts.len(), 1);
    assert_eq!(
        outcome,
        DriverOutcome::Restart(RestartRequest {
            reason: "watchdog overflow".to_string(),
            backoff_secs: 2.0,
            permanent: false,
        })
    );
    assert_eq!(driver.state(), DriverState::Failed);
    assert_eq!(bus.health.last(), Some(&HealthReport::error("watchdog overflow")));

    // No drain after a failure: only the startup reads and stops
    assert_eq!(driver.transport().writes.len(), 8);
}

#[test]
fn test_quiet_line_polling_keeps_watchdog_alive() {
    let stop = Arc::new(AtomicBool::new(false));
    let mut config = test_config();
    config.timing.watchdog = Duration::from_millis(40);
    let mut driver = driver_with(MockBoard::new(), MockBus::new(stop.clone(), 12), &config);

    assert_eq!(driver.run(&stop), DriverOutcome::Stopped);
    assert!(driver.bus().restarts.is_empty());
}

#[test]
fn test_frame_overflow_is_not_transmitted() {
    let stop = Arc::new(AtomicBool::new(false));
    let config = test_config();
    let mut bus = MockBus::new(stop.clone(), 1);
    // Fits an i32 but "@S,2,1000000000,*" is 17 bytes
    bus.actuations.push_back(ActuationRequest { id: 1, value: 1_000_000_000.0 });
    let mut driver = driver_with(MockBoard::new(), bus, &config);

    assert_eq!(driver.run(&stop), DriverOutcome::Stopped);

    let bodies = driver.transport().bodies();
    assert!(bodies.iter().all(|b| !b.contains("1000000000")));
    assert_eq!(bodies.len(), 13);
    assert_eq!(driver.motors()[2].target_rpm, 0);
    assert_eq!(driver.motors()[3].target_rpm, 0);
}

#[test]
fn test_fractional_values_truncate_toward_zero() {
    let stop = Arc::new(AtomicBool::new(false));
    let config = test_config();
    let mut bus = MockBus::new(stop.clone(), 1);
    bus.actuations.push_back(ActuationRequest { id: 0, value: 0.7 });
    bus.actuations.push_back(ActuationRequest { id: 1, value: -1200.6 });
    let mut driver = driver_with(MockBoard::new(), bus, &config);

    driver.run(&stop);

    let bodies = driver.transport().bodies();
    let sets: Vec<&str> = bodies[9..13].iter().map(String::as_str).collect();
    assert_eq!(sets, ["@S,0,0,*", "@S,1,0,*", "@S,2,-1200,*", "@S,3,-1200,*"]);
}

#[test]
fn test_failed_poll_writes_escalate_to_restart() {
    let stop = Arc::new(AtomicBool::new(false));
    let mut config = test_config();
    config.timing.watchdog = Duration::from_millis(40);
    let mut board = MockBoard::new();
    board.fail_writes = true;
    let mut driver = driver_with(board, MockBus::new(stop.clone(), usize::MAX), &config);

    let outcome = driver.run(&stop);

    assert!(matches!(outcome, DriverOutcome::Restart(_)));
    assert_eq!(driver.state(), DriverState::Failed);
    let bus = driver.bus();
    assert_eq!(bus.restarts.len(), 1);
    // Nothing reached the board, so nothing stale is published
    assert!(bus.samples.is_empty());
}

#[test]
fn test_poll_errors_keep_ticks_bounded() {
    let stop = Arc::new(AtomicBool::new(false));
    let mut config = test_config();
    config.timing.poll_wait = Duration::from_millis(10);
    config.timing.watchdog = Duration::from_millis(50);
    let mut board = MockBoard::new();
    board.fail_polls = true;
    let mut driver = driver_with(board, MockBus::new(stop.clone(), usize::MAX), &config);

    let started = Instant::now();
    let outcome = driver.run(&stop);

    assert!(matches!(outcome, DriverOutcome::Restart(_)));
    // 4 startup waits plus roughly one per 10ms tick over the 50ms ceiling
    assert!(driver.transport().poll_calls <= 4 + 8);
    assert!(started.elapsed() >= Duration::from_millis(50));
}
