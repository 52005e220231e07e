//! Remote proxy backend.
//!
//! A remote peer publishes each MCA as a record of named fields
//! (`<record>.busy`, `<record>.channel_array`, ...). The proxy reads and
//! writes those fields through a [`RemoteFieldTransport`]. Transfers of the
//! spectrum and statistics arrays are skipped when the peer reports nothing
//! new since the last fetch.
//!
//! The TCP transport speaks one JSON object per line:
//!
//! ```text
//! -> {"op":"get","field":"mca1.busy"}
//! <- {"ok":true,"value":false}
//! -> {"op":"put","field":"mca1.stop","value":1}
//! <- {"ok":false,"code":-7,"message":"run already active"}
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::runtime::Runtime;
use tracing::{debug, info, trace, warn};

use super::simulator::{error_text, SimulatedHardware, SIM_BAD_VALUE, SIM_UNKNOWN_PARAMETER};
use super::{registers, BackendCapabilities, ChannelAddress, McaBackend, SpectrumRead};
use crate::error::{McaError, Result};
use crate::preset::{PresetKind, PresetSpec};
use crate::statistics::RunStatistics;
use crate::timing::ClockTickModel;

const BACKEND: &str = "remote";

/// Default field server port
pub const DEFAULT_PORT: u16 = 9727;

/// Default exchange timeout in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 2000;

/// Status code the peer reports for a start on an active channel
pub const RUN_ACTIVE_CODE: i32 = -7;

/// Status code for a field the peer does not publish
pub const UNKNOWN_FIELD_CODE: i32 = -20;

/// Field names published by the peer for each record.
pub mod fields {
    /// Counting flag
    pub const BUSY: &str = "busy";
    /// Spectrum bins
    pub const CHANNEL_ARRAY: &str = "channel_array";
    /// Eight-value statistics array, times in seconds
    pub const STATISTICS: &str = "statistics";
    /// Start with a preset applied by the peer
    pub const START_WITH_PRESET: &str = "start_with_preset";
    /// Start with the preset already programmed
    pub const START: &str = "start";
    /// Stop the run
    pub const STOP: &str = "stop";
    /// Zero spectrum and counters
    pub const CLEAR: &str = "clear";
    /// Spectrum changed since the last `channel_array` fetch
    pub const NEW_DATA_AVAILABLE: &str = "new_data_available";
    /// Statistics changed since the last `statistics` fetch
    pub const NEW_STATISTICS_AVAILABLE: &str = "new_statistics_available";
    /// Bins currently in use
    pub const CURRENT_NUM_CHANNELS: &str = "current_num_channels";
    /// Register selected for `parameter_value`
    pub const PARAMETER_NAME: &str = "parameter_name";
    /// Value of the selected register on this channel
    pub const PARAMETER_VALUE: &str = "parameter_value";
    /// Write the selected register on every channel of the module
    pub const PARAM_VALUE_TO_ALL_CHANNELS: &str = "param_value_to_all_channels";
    /// Runtime tick length in seconds
    pub const RUNTIME_CLOCK_TICK: &str = "runtime_clock_tick";
    /// Preset tick length in seconds
    pub const PRESET_CLOCK_TICK: &str = "preset_clock_tick";
}

/// Named-field access to a remote peer.
pub trait RemoteFieldTransport: Send {
    /// Read a field.
    fn get(&mut self, field: &str) -> Result<Value>;

    /// Write a field.
    fn put(&mut self, field: &str, value: Value) -> Result<()>;

    /// Peer description for logs.
    fn peer(&self) -> String;
}

/// One request line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum FieldRequest {
    /// Read a field
    Get {
        /// `<record>.<field>`
        field: String,
    },
    /// Write a field
    Put {
        /// `<record>.<field>`
        field: String,
        /// New value
        value: Value,
    },
}

/// One response line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldResponse {
    /// True on success
    pub ok: bool,
    /// Field value for a successful get
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub value: Value,
    /// Native status code on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
    /// Peer's error text on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl FieldResponse {
    /// Answer `request` from `transport`, for peers serving the line protocol.
    pub fn answer(transport: &mut dyn RemoteFieldTransport, request: FieldRequest) -> Self {
        let result = match request {
            FieldRequest::Get { field } => transport.get(&field),
            FieldRequest::Put { field, value } => transport.put(&field, value).map(|()| Value::Null),
        };
        match result {
            Ok(value) => Self {
                ok: true,
                value,
                code: None,
                message: None,
            },
            Err(err) => Self {
                ok: false,
                value: Value::Null,
                code: Some(err.device_io_code().unwrap_or(UNKNOWN_FIELD_CODE)),
                message: Some(err.to_string()),
            },
        }
    }

    fn into_result(self) -> Result<Value> {
        if self.ok {
            Ok(self.value)
        } else {
            Err(McaError::device_io(
                BACKEND,
                self.code.unwrap_or(UNKNOWN_FIELD_CODE),
                self.message.unwrap_or_default(),
            ))
        }
    }
}

/// Line-protocol client over TCP.
///
/// Owns a current-thread tokio runtime so the blocking backend API can
/// drive the async socket. A connection that timed out or failed mid-exchange
/// is dropped and re-established on the next request, so a late reply can
/// never be read as the answer to a later request.
pub struct TcpFieldClient {
    runtime: Runtime,
    stream: Option<BufReader<TcpStream>>,
    timeout: Duration,
    peer: String,
}

impl TcpFieldClient {
    /// Connect with the default timeout.
    pub fn connect(host: &str, port: u16) -> Result<Self> {
        Self::connect_with_timeout(host, port, Duration::from_millis(DEFAULT_TIMEOUT_MS))
    }

    /// Connect, applying `timeout` to the connect and to every exchange.
    pub fn connect_with_timeout(host: &str, port: u16, timeout: Duration) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let mut client = Self {
            runtime,
            stream: None,
            timeout,
            peer: format!("{}:{}", host, port),
        };
        client.reconnect()?;
        info!(peer = %client.peer, "Connected to remote MCA peer");
        Ok(client)
    }

    /// Set the exchange timeout.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Whether a connection is currently open.
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn reconnect(&mut self) -> Result<()> {
        self.stream = None;
        let timeout = self.timeout;
        let peer = self.peer.as_str();
        let connected = self
            .runtime
            .block_on(async { tokio::time::timeout(timeout, TcpStream::connect(peer)).await });

        let stream = match connected {
            Ok(stream) => stream?,
            Err(_) => {
                return Err(McaError::TimedOut {
                    operation: format!("connect to {}", self.peer),
                    seconds: timeout.as_secs_f64(),
                })
            }
        };

        // Disable Nagle's algorithm for low latency
        stream.set_nodelay(true)?;
        self.stream = Some(BufReader::new(stream));
        Ok(())
    }

    fn exchange(&mut self, request: &FieldRequest) -> Result<Value> {
        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        trace!(peer = %self.peer, request = %line.trim(), "Remote request");

        if self.stream.is_none() {
            debug!(peer = %self.peer, "Reconnecting to remote MCA peer");
            self.reconnect()?;
        }

        let timeout = self.timeout;
        let Some(stream) = self.stream.as_mut() else {
            return Err(McaError::unbound("remote connection"));
        };
        let outcome = self.runtime.block_on(async {
            tokio::time::timeout(timeout, async {
                stream.get_mut().write_all(line.as_bytes()).await?;
                stream.get_mut().flush().await?;
                let mut reply = String::new();
                let read = stream.read_line(&mut reply).await?;
                Ok::<_, std::io::Error>((read, reply))
            })
            .await
        });

        let (read, reply) = match outcome {
            Ok(Ok(exchanged)) => exchanged,
            Ok(Err(e)) => {
                self.stream = None;
                return Err(e.into());
            }
            Err(_) => {
                // a late reply would answer the next request
                warn!(peer = %self.peer, "Remote exchange timed out, dropping connection");
                self.stream = None;
                return Err(McaError::TimedOut {
                    operation: format!("exchange with {}", self.peer),
                    seconds: timeout.as_secs_f64(),
                });
            }
        };
        if read == 0 {
            self.stream = None;
            return Err(McaError::Transport {
                message: format!("Connection closed by {}", self.peer),
            });
        }

        let response: FieldResponse = serde_json::from_str(reply.trim())?;
        response.into_result()
    }
}

impl RemoteFieldTransport for TcpFieldClient {
    fn get(&mut self, field: &str) -> Result<Value> {
        self.exchange(&FieldRequest::Get {
            field: field.to_string(),
        })
    }

    fn put(&mut self, field: &str, value: Value) -> Result<()> {
        self.exchange(&FieldRequest::Put {
            field: field.to_string(),
            value,
        })
        .map(|_| ())
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}

/// Peer's change flags as of the last check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FreshnessRecord {
    /// Spectrum changed since the last fetch
    pub new_data_available: bool,
    /// Statistics changed since the last fetch
    pub new_statistics_available: bool,
}

/// [`McaBackend`] that forwards to a record on a remote peer.
pub struct RemoteProxyBackend {
    transport: Option<Box<dyn RemoteFieldTransport>>,
    record: String,
    address: ChannelAddress,
    run_active_code: i32,
    freshness: FreshnessRecord,
    spectrum: Option<Vec<u32>>,
    statistics: Option<RunStatistics>,
    spectrum_fetches: u64,
    statistics_fetches: u64,
}

impl RemoteProxyBackend {
    /// Proxy `record` over `transport`.
    pub fn new(transport: Box<dyn RemoteFieldTransport>, record: impl Into<String>) -> Self {
        Self {
            transport: Some(transport),
            ..Self::unbound(record)
        }
    }

    /// Proxy without a transport; every operation fails with `NullOrUnbound`.
    pub fn unbound(record: impl Into<String>) -> Self {
        let record = record.into();
        Self {
            transport: None,
            address: ChannelAddress::Remote {
                record: record.clone(),
            },
            record,
            run_active_code: RUN_ACTIVE_CODE,
            freshness: FreshnessRecord::default(),
            spectrum: None,
            statistics: None,
            spectrum_fetches: 0,
            statistics_fetches: 0,
        }
    }

    /// Override the peer's "run already active" status code.
    pub fn with_run_active_code(mut self, code: i32) -> Self {
        self.run_active_code = code;
        self
    }

    /// Flags seen at the last freshness check.
    pub fn freshness(&self) -> FreshnessRecord {
        self.freshness
    }

    /// Number of `channel_array` transfers so far.
    pub fn spectrum_fetches(&self) -> u64 {
        self.spectrum_fetches
    }

    /// Number of `statistics` transfers so far.
    pub fn statistics_fetches(&self) -> u64 {
        self.statistics_fetches
    }

    fn field(&self, name: &str) -> String {
        format!("{}.{}", self.record, name)
    }

    fn transport(&mut self) -> Result<&mut (dyn RemoteFieldTransport + 'static)> {
        self.transport
            .as_deref_mut()
            .ok_or_else(|| McaError::unbound("remote transport"))
    }

    fn get(&mut self, name: &str) -> Result<Value> {
        let field = self.field(name);
        self.transport()?.get(&field)
    }

    fn put(&mut self, name: &str, value: Value) -> Result<()> {
        let field = self.field(name);
        self.transport()?.put(&field, value)
    }

    fn select_parameter(&mut self, name: &str) -> Result<()> {
        self.put(fields::PARAMETER_NAME, json!(name))
    }

    /// Spectrum refetch needed; refreshes the freshness record.
    fn spectrum_is_stale(&mut self) -> Result<bool> {
        let flag = as_bool(&self.get(fields::NEW_DATA_AVAILABLE)?, fields::NEW_DATA_AVAILABLE)?;
        self.freshness.new_data_available = flag;
        Ok(flag || self.spectrum.is_none())
    }

    /// Statistics refetch needed; refreshes the freshness record.
    fn statistics_are_stale(&mut self) -> Result<bool> {
        let flag = as_bool(
            &self.get(fields::NEW_STATISTICS_AVAILABLE)?,
            fields::NEW_STATISTICS_AVAILABLE,
        )?;
        self.freshness.new_statistics_available = flag;
        Ok(flag || self.statistics.is_none())
    }
}

impl McaBackend for RemoteProxyBackend {
    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    fn address(&self) -> &ChannelAddress {
        &self.address
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            remote_presets: true,
            statistics_in_seconds: true,
            ..Default::default()
        }
    }

    fn run_active_code(&self) -> Option<i32> {
        Some(self.run_active_code)
    }

    fn is_busy(&mut self) -> Result<bool> {
        as_bool(&self.get(fields::BUSY)?, fields::BUSY)
    }

    fn read_parameter(&mut self, name: &str) -> Result<u32> {
        self.select_parameter(name)?;
        as_u32(&self.get(fields::PARAMETER_VALUE)?, fields::PARAMETER_VALUE)
    }

    fn write_parameter(&mut self, name: &str, value: u32) -> Result<()> {
        self.select_parameter(name)?;
        self.put(fields::PARAMETER_VALUE, json!(value))
    }

    fn write_parameter_to_all_channels(&mut self, name: &str, value: u32) -> Result<()> {
        self.select_parameter(name)?;
        self.put(fields::PARAM_VALUE_TO_ALL_CHANNELS, json!(value))
    }

    fn start_run(&mut self, clear: bool) -> Result<()> {
        if clear {
            self.put(fields::CLEAR, json!(1))?;
        }
        self.put(fields::START, json!(1))
    }

    fn stop_run(&mut self) -> Result<()> {
        self.put(fields::STOP, json!(1))
    }

    fn start_with_preset(&mut self, preset: &PresetSpec, clear: bool) -> Result<()> {
        if clear {
            self.put(fields::CLEAR, json!(1))?;
        }
        self.put(
            fields::START_WITH_PRESET,
            json!([preset.kind.register_value(), preset.value]),
        )
    }

    fn read_spectrum(&mut self, buffer: &mut [u32]) -> Result<SpectrumRead> {
        if self.is_busy()? {
            return Ok(SpectrumRead::SkippedBusy);
        }

        if self.spectrum_is_stale()? {
            let value = self.get(fields::CHANNEL_ARRAY)?;
            self.spectrum = Some(as_u32_vec(&value, fields::CHANNEL_ARRAY)?);
            self.spectrum_fetches += 1;
        } else {
            debug!(record = %self.record, "Spectrum unchanged on peer, using local copy");
        }

        let spectrum = self.spectrum.as_deref().unwrap_or_default();
        let bins = spectrum.len().min(buffer.len());
        buffer[..bins].copy_from_slice(&spectrum[..bins]);
        Ok(SpectrumRead::Complete { bins })
    }

    fn read_statistics(&mut self) -> Result<RunStatistics> {
        if self.statistics_are_stale()? {
            let value = self.get(fields::STATISTICS)?;
            let values = as_f64_vec(&value, fields::STATISTICS)?;
            self.statistics = Some(RunStatistics::from_slice(&values)?);
            self.statistics_fetches += 1;
        } else {
            debug!(record = %self.record, "Statistics unchanged on peer, using local copy");
        }
        self.statistics.ok_or_else(|| McaError::Transport {
            message: "peer sent no statistics".to_string(),
        })
    }

    fn clock_ticks(&mut self) -> Result<Option<ClockTickModel>> {
        let runtime = as_f64(
            &self.get(fields::RUNTIME_CLOCK_TICK)?,
            fields::RUNTIME_CLOCK_TICK,
        )?;
        let preset = as_f64(
            &self.get(fields::PRESET_CLOCK_TICK)?,
            fields::PRESET_CLOCK_TICK,
        )?;
        ClockTickModel::new(runtime, preset).map(Some)
    }
}

fn bad_value(field: &str, value: &Value) -> McaError {
    McaError::Transport {
        message: format!("Field '{}' has unexpected value {}", field, value),
    }
}

fn as_bool(value: &Value, field: &str) -> Result<bool> {
    match value {
        Value::Bool(flag) => Ok(*flag),
        Value::Number(n) => Ok(n.as_f64().map(|v| v != 0.0).unwrap_or(false)),
        other => Err(bad_value(field, other)),
    }
}

fn as_f64(value: &Value, field: &str) -> Result<f64> {
    value.as_f64().ok_or_else(|| bad_value(field, value))
}

fn as_u32(value: &Value, field: &str) -> Result<u32> {
    value
        .as_u64()
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| bad_value(field, value))
}

fn as_u32_vec(value: &Value, field: &str) -> Result<Vec<u32>> {
    value
        .as_array()
        .ok_or_else(|| bad_value(field, value))?
        .iter()
        .map(|v| as_u32(v, field))
        .collect()
}

fn as_f64_vec(value: &Value, field: &str) -> Result<Vec<f64>> {
    value
        .as_array()
        .ok_or_else(|| bad_value(field, value))?
        .iter()
        .map(|v| as_f64(v, field))
        .collect()
}

/// In-process peer that publishes one simulated channel as a record.
///
/// Used for mock remote channels and for serving the line protocol in tests.
pub struct SimulatedRemotePeer {
    record: String,
    hardware: Arc<Mutex<SimulatedHardware>>,
    channel: usize,
    clock: ClockTickModel,
    selected_parameter: Option<String>,
    data_changed: bool,
    statistics_changed: bool,
    reads: Arc<Mutex<HashMap<String, u64>>>,
}

impl SimulatedRemotePeer {
    /// Publish `channel` of `hardware` as `record`.
    pub fn new(
        record: impl Into<String>,
        hardware: Arc<Mutex<SimulatedHardware>>,
        channel: usize,
    ) -> Result<Self> {
        let clock = {
            let hw = hardware.lock();
            ClockTickModel::new(
                hw.settings().runtime_tick_seconds,
                hw.settings().preset_tick_seconds,
            )?
        };
        Ok(Self {
            record: record.into(),
            hardware,
            channel,
            clock,
            selected_parameter: None,
            data_changed: true,
            statistics_changed: true,
            reads: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Shared counter of field reads, keyed by field name.
    pub fn read_counter(&self) -> Arc<Mutex<HashMap<String, u64>>> {
        Arc::clone(&self.reads)
    }

    fn split<'a>(&self, field: &'a str) -> Result<&'a str> {
        match field.split_once('.') {
            Some((record, name)) if record == self.record => Ok(name),
            _ => Err(unknown_field(field)),
        }
    }

    fn native<T>(&self, result: std::result::Result<T, i32>) -> Result<T> {
        result.map_err(|code| McaError::device_io(BACKEND, code, error_text(code)))
    }

    fn mark_changed(&mut self) {
        self.data_changed = true;
        self.statistics_changed = true;
    }

    fn counting(&self) -> Result<bool> {
        self.native(self.hardware.lock().is_busy(self.channel))
    }

    fn selected(&self) -> Result<String> {
        self.selected_parameter
            .clone()
            .ok_or_else(|| McaError::device_io(BACKEND, SIM_UNKNOWN_PARAMETER, "no parameter selected"))
    }

    fn statistics_in_seconds(&self) -> Result<Vec<f64>> {
        let native = self.native(self.hardware.lock().read_statistics(self.channel))?;
        let mut stats = native.into_run_statistics(BACKEND);
        stats.real_time = self.clock.runtime_ticks_to_seconds(stats.real_time);
        stats.live_time = self.clock.runtime_ticks_to_seconds(stats.live_time);
        Ok(stats.to_array().to_vec())
    }

    fn program_and_start(&mut self, preset: &PresetSpec) -> Result<()> {
        let encoded = preset.encode(&self.clock)?;
        let mut hw = self.hardware.lock();
        let module = hw.module_of(self.channel);
        let channels = self.native(hw.module_channels(module))?;
        for channel in channels {
            self.native(hw.write_param(channel, registers::PRESET_KIND, encoded.kind.register_value()))?;
        }
        self.native(hw.write_param(
            self.channel,
            registers::PRESET_HIGH,
            u32::from(encoded.registers.high),
        ))?;
        self.native(hw.write_param(
            self.channel,
            registers::PRESET_LOW,
            u32::from(encoded.registers.low),
        ))?;
        self.native(hw.start_run(self.channel, false))
    }
}

/// Decode `[kind, value]` as sent in `start_with_preset`.
fn parse_preset_pair(value: &Value) -> Result<PresetSpec> {
    let bad = || McaError::device_io(BACKEND, SIM_BAD_VALUE, format!("bad preset {}", value));
    match value.as_array().map(Vec::as_slice) {
        Some([kind, amount]) => {
            let kind = kind
                .as_u64()
                .and_then(|k| u32::try_from(k).ok())
                .and_then(PresetKind::from_register)
                .ok_or_else(bad)?;
            let value = amount.as_f64().ok_or_else(bad)?;
            Ok(PresetSpec { kind, value })
        }
        _ => Err(bad()),
    }
}

fn unknown_field(field: &str) -> McaError {
    McaError::device_io(BACKEND, UNKNOWN_FIELD_CODE, format!("unknown field '{}'", field))
}

impl RemoteFieldTransport for SimulatedRemotePeer {
    fn get(&mut self, field: &str) -> Result<Value> {
        let name = self.split(field)?;
        *self.reads.lock().entry(name.to_string()).or_insert(0) += 1;

        match name {
            fields::BUSY => Ok(json!(self.counting()?)),
            fields::NEW_DATA_AVAILABLE => Ok(json!(self.data_changed || self.counting()?)),
            fields::NEW_STATISTICS_AVAILABLE => {
                Ok(json!(self.statistics_changed || self.counting()?))
            }
            fields::CHANNEL_ARRAY => {
                let hw = self.hardware.lock();
                let bins = self.native(hw.read_param(self.channel, registers::MCA_BINS))?;
                let mut buffer = vec![0u32; bins as usize];
                let read = self.native(hw.read_spectrum(self.channel, &mut buffer))?;
                drop(hw);
                buffer.truncate(read);
                self.data_changed = false;
                Ok(json!(buffer))
            }
            fields::STATISTICS => {
                let values = self.statistics_in_seconds()?;
                self.statistics_changed = false;
                Ok(json!(values))
            }
            fields::CURRENT_NUM_CHANNELS => {
                let bins = self.native(self.hardware.lock().read_param(self.channel, registers::MCA_BINS))?;
                Ok(json!(bins))
            }
            fields::PARAMETER_NAME => Ok(json!(self.selected_parameter)),
            fields::PARAMETER_VALUE => {
                let name = self.selected()?;
                let value = self.native(self.hardware.lock().read_param(self.channel, &name))?;
                Ok(json!(value))
            }
            fields::RUNTIME_CLOCK_TICK => Ok(json!(self.clock.runtime_tick_seconds())),
            fields::PRESET_CLOCK_TICK => Ok(json!(self.clock.preset_tick_seconds())),
            _ => Err(unknown_field(field)),
        }
    }

    fn put(&mut self, field: &str, value: Value) -> Result<()> {
        let name = self.split(field)?;
        match name {
            fields::PARAMETER_NAME => {
                let selected = value
                    .as_str()
                    .ok_or_else(|| McaError::device_io(BACKEND, SIM_BAD_VALUE, "parameter name must be a string"))?;
                self.selected_parameter = Some(selected.to_string());
                Ok(())
            }
            fields::PARAMETER_VALUE | fields::PARAM_VALUE_TO_ALL_CHANNELS => {
                let parameter = self.selected()?;
                let value = as_u32(&value, name)
                    .map_err(|_| McaError::device_io(BACKEND, SIM_BAD_VALUE, "value must fit 32 bits"))?;
                let mut hw = self.hardware.lock();
                let channels = if name == fields::PARAMETER_VALUE {
                    vec![self.channel]
                } else {
                    let module = hw.module_of(self.channel);
                    self.native(hw.module_channels(module))?
                };
                for channel in channels {
                    self.native(hw.write_param(channel, &parameter, value))?;
                }
                Ok(())
            }
            fields::START_WITH_PRESET => {
                let preset = parse_preset_pair(&value)?;
                self.program_and_start(&preset)?;
                self.mark_changed();
                Ok(())
            }
            fields::START => {
                self.native(self.hardware.lock().start_run(self.channel, false))?;
                self.mark_changed();
                Ok(())
            }
            fields::STOP => {
                self.native(self.hardware.lock().stop_run(self.channel))?;
                self.mark_changed();
                Ok(())
            }
            fields::CLEAR => {
                self.native(self.hardware.lock().clear(self.channel))?;
                self.mark_changed();
                Ok(())
            }
            _ => Err(unknown_field(field)),
        }
    }

    fn peer(&self) -> String {
        format!("simulated peer '{}'", self.record)
    }
}
