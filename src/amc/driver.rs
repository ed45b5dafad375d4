// Control loop for the AMC board
//
// One blocking loop owns the transport: it waits for inbound bytes, and when
// the line is quiet it polls the next channel's rpm, publishes it and services
// actuation requests. A watchdog forces a supervised restart when that stalls.
//
// Note: the board has no flow control, so every write is followed by a settle
// delay and writes are never interleaved.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::parser::InboundDecoder;
use super::protocol::{
    encode_read, encode_set, AmcError, Channel, CommandFrame, Crc8, Field, Result, MOTOR_COUNT,
};
use super::transport::Transport;
use crate::config::{DriverConfig, Timing};
use crate::messages::{ActuationRequest, HealthReport, RestartRequest, RpmSample};

/// Message bus seen by the driver
pub trait Bus {
    fn publish_rpm(&mut self, sample: &RpmSample) -> Result<()>;
    fn report_health(&mut self, report: &HealthReport) -> Result<()>;
    fn request_restart(&mut self, request: &RestartRequest) -> Result<()>;

    /// Next pending actuation request, waiting at most `timeout`
    fn next_actuation(&mut self, timeout: Duration) -> Option<ActuationRequest>;
}

/// Driver-side view of one motor channel
#[derive(Debug, Clone, PartialEq)]
pub struct MotorChannel {
    pub channel: Channel,
    /// Last commanded speed
    pub target_rpm: i32,
    /// Last decoded speed
    pub measured_rpm: i32,
    pub healthy: bool,
    pub conversion: f64,
    pub label: String,
}

impl MotorChannel {
    fn new(channel: Channel, label: &str, conversion: f64) -> Self {
        let label = if label.is_empty() {
            format!("motor{}", channel)
        } else {
            label.to_string()
        };
        Self {
            channel,
            target_rpm: 0,
            measured_rpm: 0,
            healthy: true,
            conversion,
            label,
        }
    }

    /// Measured speed scaled by the channel conversion factor
    pub fn scaled_rpm(&self) -> f64 {
        self.measured_rpm as f64 * self.conversion
    }
}

/// Round-robin index of the next channel to poll
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollCursor(usize);

impl PollCursor {
    pub fn current(&self) -> Channel {
        Channel::ALL[self.0]
    }

    pub fn advance(&mut self) {
        self.0 = (self.0 + 1) % MOTOR_COUNT;
    }
}

/// Time-based watchdog: overflows when not reset within `top`
#[derive(Debug, Clone, Copy)]
pub struct Watchdog {
    top: Duration,
    last_reset: Instant,
}

impl Watchdog {
    pub fn new(top: Duration) -> Self {
        Self {
            top,
            last_reset: Instant::now(),
        }
    }

    pub fn reset(&mut self) {
        self.last_reset = Instant::now();
    }

    pub fn remaining(&self) -> Duration {
        self.top.saturating_sub(self.last_reset.elapsed())
    }

    pub fn overflow(&self) -> bool {
        self.last_reset.elapsed() >= self.top
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Startup,
    Running,
    Draining,
    Failed,
}

/// How a driver run ended
#[derive(Debug, Clone, PartialEq)]
pub enum DriverOutcome {
    /// Stop signal honored, all channels commanded to zero
    Stopped,
    /// Watchdog overflow, the supervisor should restart the driver
    Restart(RestartRequest),
}

/// Driver for the AMC four-channel motor controller
pub struct AmcDriver<T, D, B> {
    transport: T,
    decoder: D,
    bus: B,
    crc: Crc8,
    timing: Timing,
    motors: [MotorChannel; MOTOR_COUNT],
    cursor: PollCursor,
    watchdog: Watchdog,
    state: DriverState,
    faults: usize,
}

impl<T: Transport, D: InboundDecoder, B: Bus> AmcDriver<T, D, B> {
    pub fn new(transport: T, decoder: D, bus: B, config: &DriverConfig) -> Self {
        let motors = Channel::ALL
            .map(|ch| MotorChannel::new(ch, &config.labels[ch.index()], config.conversion[ch.index()]));

        Self {
            transport,
            decoder,
            bus,
            crc: Crc8::new(config.crc_poly),
            timing: config.timing,
            motors,
            cursor: PollCursor::default(),
            watchdog: Watchdog::new(config.timing.watchdog),
            state: DriverState::Startup,
            faults: 0,
        }
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn motors(&self) -> &[MotorChannel; MOTOR_COUNT] {
        &self.motors
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    /// Give back the bus so a supervisor can reuse it across restarts
    pub fn into_bus(self) -> B {
        self.bus
    }

    /// Run the full lifecycle until `stop` is set or the watchdog overflows
    pub fn run(&mut self, stop: &AtomicBool) -> DriverOutcome {
        self.startup();

        self.state = DriverState::Running;
        if self.faults == 0 {
            self.report_health(HealthReport::normal("active"));
        }
        self.watchdog.reset();
        info!(
            "AMC driver running: {}ms poll wait, {}ms watchdog",
            self.timing.poll_wait.as_millis(),
            self.timing.watchdog.as_millis()
        );

        while !stop.load(Ordering::Relaxed) {
            self.tick();

            if self.watchdog.overflow() {
                return self.fail();
            }
        }

        self.drain();
        DriverOutcome::Stopped
    }

    /// Query every channel's state, then zero all speeds
    fn startup(&mut self) {
        self.state = DriverState::Startup;
        self.report_health(HealthReport::normal("idle"));

        for channel in Channel::ALL {
            self.send_read(channel, Field::State);
            std::thread::sleep(self.timing.settle);
            if self.collect_reply(self.timing.response_wait) == 0 {
                debug!("No state reply from channel {}", channel);
            }
        }

        self.faults = 0;
        for motor in self.motors.iter_mut() {
            motor.healthy = self.decoder.channel_state(motor.channel).healthy;
            if !motor.healthy {
                warn!("AMC motor {} - ERROR", motor.channel);
                self.faults += 1;
            }
        }
        if self.faults > 0 {
            let report = HealthReport::error(format!("{} motor(s) in fault", self.faults));
            self.report_health(report);
        }

        self.stop_all();
    }

    /// One RUNNING iteration
    fn tick(&mut self) {
        let started = Instant::now();
        match self.transport.wait_readable(self.timing.poll_wait) {
            Ok(true) => {
                if self.read_byte() {
                    self.watchdog.reset();
                }
            }
            Ok(false) => {
                if self.poll_next() {
                    self.service_bus();
                    self.watchdog.reset();
                }
            }
            Err(e) => {
                error!("Poll error: {}", e);
                // Keep the tick bounded by the poll wait
                std::thread::sleep(self.timing.poll_wait.saturating_sub(started.elapsed()));
            }
        }
    }

    /// Feed bytes to the decoder until the line is quiet or `window` ends
    fn collect_reply(&mut self, window: Duration) -> usize {
        let deadline = Instant::now() + window;
        let mut count = 0;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.transport.wait_readable(remaining) {
                Ok(true) if self.read_byte() => count += 1,
                Ok(_) => break,
                Err(e) => {
                    error!("Poll error: {}", e);
                    break;
                }
            }
            if remaining.is_zero() {
                break;
            }
        }
        count
    }

    /// Read one byte and feed it to the decoder, false on failure
    fn read_byte(&mut self) -> bool {
        let mut buf = [0u8; 1];
        match self.transport.read(&mut buf) {
            Ok(n) if n > 0 => {
                self.decoder.feed(buf[0]);
                true
            }
            Ok(_) => {
                error!("Unknown read error: no bytes read");
                false
            }
            Err(e) => {
                error!("Read error: {}", e);
                false
            }
        }
    }

    /// Request rpm from the channel under the cursor and publish the last value,
    /// false if the read command could not be sent
    fn poll_next(&mut self) -> bool {
        let channel = self.cursor.current();
        let sent = self.send_read(channel, Field::Rpm);
        std::thread::sleep(self.timing.settle);
        if !sent {
            return false;
        }

        let motor = &mut self.motors[channel.index()];
        motor.measured_rpm = self.decoder.channel_state(channel).rpm;
        let sample = RpmSample {
            label: motor.label.clone(),
            value: motor.measured_rpm,
        };
        if let Err(e) = self.bus.publish_rpm(&sample) {
            warn!("Failed to publish rpm for channel {}: {}", channel, e);
        }

        self.cursor.advance();
        true
    }

    /// Handle actuation requests until the bus goes quiet
    fn service_bus(&mut self) {
        let mut timeout = self.timing.bus_wait;
        while let Some(request) = self.bus.next_actuation(timeout) {
            self.on_actuation(request);
            timeout = Duration::ZERO;
        }
    }

    /// Map a logical actuator onto its channel pair
    fn on_actuation(&mut self, request: ActuationRequest) {
        let pair = match request.id {
            0 => [Channel::ALL[0], Channel::ALL[1]],
            1 => [Channel::ALL[2], Channel::ALL[3]],
            other => {
                debug!("Ignoring actuation for unknown id {}", other);
                return;
            }
        };

        let value = match speed_from(request.value) {
            Ok(value) => value,
            Err(e) => {
                warn!("Rejected actuation {:?}: {}", request, e);
                return;
            }
        };

        info!("Actuation {}: channels {} and {} -> {}", request.id, pair[0], pair[1], value);
        for channel in pair {
            self.set_rpm(channel, value);
        }
    }

    /// Command zero speed on every channel, in order
    fn stop_all(&mut self) {
        info!("Stopping all motors");
        for channel in Channel::ALL {
            self.set_rpm(channel, 0);
        }
    }

    fn drain(&mut self) {
        self.state = DriverState::Draining;
        info!("Stop requested, draining");
        self.stop_all();
    }

    fn fail(&mut self) -> DriverOutcome {
        self.state = DriverState::Failed;
        error!("Watchdog overflow");
        self.report_health(HealthReport::error("watchdog overflow"));

        let request = RestartRequest {
            reason: "watchdog overflow".to_string(),
            backoff_secs: self.timing.restart_backoff.as_secs_f64(),
            permanent: false,
        };
        if let Err(e) = self.bus.request_restart(&request) {
            warn!("Failed to publish restart request: {}", e);
        }
        DriverOutcome::Restart(request)
    }

    /// Send a set command and wait the settle delay
    fn set_rpm(&mut self, channel: Channel, value: i32) {
        match encode_set(&self.crc, channel, value) {
            Ok(frame) => {
                if self.send_frame(&frame) {
                    self.motors[channel.index()].target_rpm = value;
                }
                std::thread::sleep(self.timing.settle);
            }
            Err(e) => warn!("Rejected set command for channel {}: {}", channel, e),
        }
    }

    fn send_read(&mut self, channel: Channel, field: Field) -> bool {
        match encode_read(&self.crc, channel, field) {
            Ok(frame) => self.send_frame(&frame),
            Err(e) => {
                warn!("Rejected read command for channel {}: {}", channel, e);
                false
            }
        }
    }

    fn send_frame(&mut self, frame: &CommandFrame) -> bool {
        debug!("SEND {:?}", frame);
        let result = self.transport.write(frame.as_bytes()).map_err(AmcError::from).and_then(|n| {
            if n == frame.len() {
                Ok(())
            } else {
                Err(AmcError::ShortWrite {
                    written: n,
                    expected: frame.len(),
                })
            }
        });

        match result {
            Ok(()) => true,
            Err(e) => {
                error!("Write error: {}", e);
                false
            }
        }
    }

    fn report_health(&mut self, report: HealthReport) {
        if let Err(e) = self.bus.report_health(&report) {
            warn!("Failed to report health {:?}: {}", report, e);
        }
    }
}

/// Convert a bus command value to an integer speed, truncating toward zero
fn speed_from(value: f64) -> Result<i32> {
    let whole = value.trunc();
    if whole.is_finite() && whole >= i32::MIN as f64 && whole <= i32::MAX as f64 {
        Ok(whole as i32)
    } else {
        Err(AmcError::InvalidValue(value))
    }
}
