//! UPS-MIB snapshot and its SNMP bindings.
//!
//! [`UpsData`] mirrors the UPS-MIB object groups; [`FIELDS`] is the static
//! binding table — symbol, value kind, writability and accessor per scalar,
//! in MIB declaration order. Registration walks that table against the
//! profile's enable mask; everything the agent serves resolves through
//! [`UpsState`], which also owns the alarm registry and the binding sets.

use tokio::sync::mpsc::UnboundedSender;

use crate::alarm::AlarmTable;
use crate::device::{Profile, ProfileData};
use crate::error::ResolveError;
use crate::mib::Mib;
use crate::snmp::agent::{Binding, BindingSet, CommunityRole, ValueStore};
use crate::snmp::{ErrorStatus, Oid, Value};

/// upsIdent group.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdentData {
    pub manufacturer: String,
    pub model: String,
    pub ups_software_version: String,
    pub agent_software_version: String,
    pub name: String,
    pub attached_devices: String,
}

/// upsBattery group. Voltage in tenths of a volt, current in tenths of an
/// amp, per UPS-MIB units.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BatteryData {
    /// 1 unknown, 2 batteryNormal, 3 batteryLow, 4 batteryDepleted
    pub status: i32,
    pub seconds_on_battery: i32,
    pub minutes_remaining: i32,
    pub charge_remaining: i32,
    pub voltage: i32,
    pub current: i32,
    pub temperature: i32,
}

/// upsInput group scalars.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct InputData {
    pub line_bads: i32,
    pub num_lines: i32,
}

/// upsOutput group scalars.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OutputData {
    /// 1 other, 2 none, 3 normal, 4 bypass, 5 battery, 6 booster, 7 reducer
    pub source: i32,
    /// tenths of a hertz
    pub frequency: i32,
    pub num_lines: i32,
}

/// upsBypass group scalars.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BypassData {
    pub frequency: i32,
    pub num_lines: i32,
}

/// upsAlarm group scalar; the table itself lives in [`AlarmTable`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AlarmData {
    pub present: i32,
}

/// upsTest group.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TestData {
    pub id: String,
    pub spin_lock: i32,
    /// 1 donePass .. 6 noTestsInitiated
    pub results_summary: i32,
    pub results_detail: String,
    pub start_time: u32,
    pub elapsed_time: i32,
}

/// upsControl group.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ControlData {
    pub shutdown_type: i32,
    pub shutdown_after_delay: i32,
    pub startup_after_delay: i32,
    pub reboot_with_duration: i32,
    pub auto_restart: i32,
}

/// upsConfig group.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ConfigData {
    pub input_voltage: i32,
    pub input_freq: i32,
    pub output_voltage: i32,
    pub output_freq: i32,
    pub output_va: i32,
    pub output_power: i32,
    pub low_battery_time: i32,
    /// 1 disabled, 2 enabled, 3 muted
    pub audible_status: i32,
    pub low_voltage_transfer_point: i32,
    pub high_voltage_transfer_point: i32,
}

/// The live mirror of every UPS-MIB group this agent publishes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpsData {
    pub ident: IdentData,
    pub battery: BatteryData,
    pub input: InputData,
    pub output: OutputData,
    pub bypass: BypassData,
    pub alarm: AlarmData,
    pub test: TestData,
    pub control: ControlData,
    pub config: ConfigData,
}

/// A scalar's value in the snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Str(String),
    Int(i32),
    /// TimeTicks, centiseconds
    Ticks(u32),
}

/// Wire type a field maps to: string → OCTET STRING, int → INTEGER,
/// ticks → TimeTicks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Str,
    Int,
    Ticks,
}

/// Compile-time binding metadata for one scalar.
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub writable: bool,
    pub get: fn(&UpsData) -> FieldValue,
    pub set: fn(&mut UpsData, FieldValue),
}

macro_rules! str_field {
    ($name:literal, $writable:expr, $($path:ident).+) => {
        FieldSpec {
            name: $name,
            kind: FieldKind::Str,
            writable: $writable,
            get: |d| FieldValue::Str(d.$($path).+.clone()),
            set: |d, v| {
                if let FieldValue::Str(s) = v {
                    d.$($path).+ = s;
                }
            },
        }
    };
}

macro_rules! int_field {
    ($name:literal, $writable:expr, $($path:ident).+) => {
        FieldSpec {
            name: $name,
            kind: FieldKind::Int,
            writable: $writable,
            get: |d| FieldValue::Int(d.$($path).+),
            set: |d, v| {
                if let FieldValue::Int(x) = v {
                    d.$($path).+ = x;
                }
            },
        }
    };
}

macro_rules! ticks_field {
    ($name:literal, $writable:expr, $($path:ident).+) => {
        FieldSpec {
            name: $name,
            kind: FieldKind::Ticks,
            writable: $writable,
            get: |d| FieldValue::Ticks(d.$($path).+),
            set: |d, v| {
                if let FieldValue::Ticks(t) = v {
                    d.$($path).+ = t;
                }
            },
        }
    };
}

const RO: bool = false;
const RW: bool = true;

/// Every scalar the agent can publish, in MIB declaration order.
pub static FIELDS: &[FieldSpec] = &[
    // upsIdent
    str_field!("upsIdentManufacturer", RO, ident.manufacturer),
    str_field!("upsIdentModel", RO, ident.model),
    str_field!("upsIdentUPSSoftwareVersion", RO, ident.ups_software_version),
    str_field!("upsIdentAgentSoftwareVersion", RO, ident.agent_software_version),
    str_field!("upsIdentName", RW, ident.name),
    str_field!("upsIdentAttachedDevices", RW, ident.attached_devices),
    // upsBattery
    int_field!("upsBatteryStatus", RO, battery.status),
    int_field!("upsSecondsOnBattery", RO, battery.seconds_on_battery),
    int_field!("upsEstimatedMinutesRemaining", RO, battery.minutes_remaining),
    int_field!("upsEstimatedChargeRemaining", RO, battery.charge_remaining),
    int_field!("upsBatteryVoltage", RO, battery.voltage),
    int_field!("upsBatteryCurrent", RO, battery.current),
    int_field!("upsBatteryTemperature", RO, battery.temperature),
    // upsInput
    int_field!("upsInputLineBads", RO, input.line_bads),
    int_field!("upsInputNumLines", RO, input.num_lines),
    // upsOutput
    int_field!("upsOutputSource", RO, output.source),
    int_field!("upsOutputFrequency", RO, output.frequency),
    int_field!("upsOutputNumLines", RO, output.num_lines),
    // upsBypass
    int_field!("upsBypassFrequency", RO, bypass.frequency),
    int_field!("upsBypassNumLines", RO, bypass.num_lines),
    // upsAlarm
    int_field!("upsAlarmsPresent", RO, alarm.present),
    // upsTest
    str_field!("upsTestId", RW, test.id),
    int_field!("upsTestSpinLock", RW, test.spin_lock),
    int_field!("upsTestResultsSummary", RO, test.results_summary),
    str_field!("upsTestResultsDetail", RO, test.results_detail),
    ticks_field!("upsTestStartTime", RO, test.start_time),
    int_field!("upsTestElapsedTime", RO, test.elapsed_time),
    // upsControl
    int_field!("upsShutdownType", RW, control.shutdown_type),
    int_field!("upsShutdownAfterDelay", RW, control.shutdown_after_delay),
    int_field!("upsStartupAfterDelay", RW, control.startup_after_delay),
    int_field!("upsRebootWithDuration", RW, control.reboot_with_duration),
    int_field!("upsAutoRestart", RW, control.auto_restart),
    // upsConfig
    int_field!("upsConfigInputVoltage", RW, config.input_voltage),
    int_field!("upsConfigInputFreq", RW, config.input_freq),
    int_field!("upsConfigOutputVoltage", RW, config.output_voltage),
    int_field!("upsConfigOutputFreq", RW, config.output_freq),
    int_field!("upsConfigOutputVA", RO, config.output_va),
    int_field!("upsConfigOutputPower", RO, config.output_power),
    int_field!("upsConfigLowBattTime", RW, config.low_battery_time),
    int_field!("upsConfigAudibleStatus", RW, config.audible_status),
    int_field!("upsConfigLowVoltageTransferPoint", RW, config.low_voltage_transfer_point),
    int_field!("upsConfigHighVoltageTransferPoint", RW, config.high_voltage_transfer_point),
];

/// A non-zero / non-empty entry in the profile's enable mask switches the
/// corresponding binding on.
pub fn mask_enabled(spec: &FieldSpec, mask: &UpsData) -> bool {
    match (spec.get)(mask) {
        FieldValue::Str(s) => !s.is_empty(),
        FieldValue::Int(x) => x != 0,
        FieldValue::Ticks(t) => t != 0,
    }
}

/// Dynamic-table columns the agent can serve; each row binding stores
/// (column, row) and resolves through flat state at Get time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableColumn {
    InputLineIndex,
    InputFrequency,
    InputVoltage,
    InputCurrent,
    InputTruePower,
    OutputLineIndex,
    OutputVoltage,
    OutputCurrent,
    OutputPower,
    OutputPercentLoad,
    AlarmId,
    AlarmDescr,
    AlarmTime,
}

/// What a bound OID reads: a snapshot scalar or a table cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Field(usize),
    Table(TableColumn, u32),
}

fn round(f: f32) -> i32 {
    f.round() as i32
}

/// The aggregate behind the agent's state mutex: snapshot, profile user
/// block, alarm registry and the community-scoped binding sets.
pub struct UpsState {
    pub data: UpsData,
    pub user: ProfileData,
    pub alarms: AlarmTable,
    pub profile: &'static Profile,
    pub disable_buzz: bool,
    public: BindingSet<ValueSource>,
    private: BindingSet<ValueSource>,
    collapsed: bool,
    serial_tx: UnboundedSender<String>,
}

impl UpsState {
    pub fn new(
        profile: &'static Profile,
        collapsed: bool,
        disable_buzz: bool,
        serial_tx: UnboundedSender<String>,
    ) -> Self {
        Self {
            data: UpsData::default(),
            user: ProfileData::default(),
            alarms: AlarmTable::new(),
            profile,
            disable_buzz,
            public: BindingSet::new(),
            private: BindingSet::new(),
            collapsed,
            serial_tx,
        }
    }

    /// Queue a command for the serial writer. Empty commands are dropped at
    /// the line layer too, this just saves the channel hop.
    pub fn send_command(&self, command: &str) {
        if command.is_empty() {
            return;
        }
        if self.serial_tx.send(command.to_string()).is_err() {
            tracing::warn!(target: "app::model", command, "serial writer gone, command dropped");
        }
    }

    pub fn public_bindings(&self) -> &BindingSet<ValueSource> {
        &self.public
    }

    pub fn private_bindings(&self) -> &BindingSet<ValueSource> {
        &self.private
    }

    /// Walk [`FIELDS`], skip everything the enable mask leaves at zero and
    /// install `oid.0` scalar bindings. Read bindings land in the public
    /// set; write bindings in the private set, or alongside the read binding
    /// when the communities collapse.
    pub fn register_scalars(&mut self, mib: &Mib, mask: &UpsData) -> Result<(), ResolveError> {
        for (index, spec) in FIELDS.iter().enumerate() {
            let oid = mib.resolve(spec.name)?;
            if !mask_enabled(spec, mask) {
                tracing::debug!(target: "app::model", symbol = spec.name, oid = %oid,
                    "scalar disabled by profile mask");
                continue;
            }
            let scalar = oid.child(0);
            tracing::debug!(target: "app::model", symbol = spec.name, oid = %scalar,
                writable = spec.writable, "scalar registered");

            self.public.insert(
                scalar.clone(),
                Binding {
                    source: ValueSource::Field(index),
                    readable: true,
                    writable: spec.writable && self.collapsed,
                },
            );
            if spec.writable && !self.collapsed {
                self.private.insert(
                    scalar,
                    Binding {
                        source: ValueSource::Field(index),
                        readable: false,
                        writable: true,
                    },
                );
            }
        }
        Ok(())
    }

    /// Register `rows` rows of one table column under its resolved base OID;
    /// rows are 1-indexed on the wire.
    pub fn register_table(
        &mut self,
        mib: &Mib,
        symbol: &str,
        column: TableColumn,
        rows: u32,
    ) -> Result<(), ResolveError> {
        let base = mib.resolve(symbol)?;
        for row in 1..=rows {
            self.public.insert(
                base.child(row),
                Binding {
                    source: ValueSource::Table(column, row),
                    readable: true,
                    writable: false,
                },
            );
        }
        Ok(())
    }

    /// Drop every row binding under the column's base OID.
    pub fn remove_table(&mut self, mib: &Mib, symbol: &str) -> Result<(), ResolveError> {
        let base = mib.resolve(symbol)?;
        self.public.remove_prefix(&base);
        Ok(())
    }

    /// Reconcile the alarm registry with the published tables: tear down the
    /// three alarm columns, publish `upsAlarmsPresent`, register fresh rows
    /// and hand the queued edge traps to the caller for dispatch after the
    /// state lock is released.
    pub fn apply_alarms(&mut self, mib: &Mib) -> Vec<crate::alarm::PendingTrap> {
        if !self.alarms.is_dirty() {
            return Vec::new();
        }
        self.alarms.clear_dirty();

        for symbol in ["upsAlarmId", "upsAlarmDescr", "upsAlarmTime"] {
            self.remove_table(mib, symbol)
                .unwrap_or_else(|e| panic!("alarm table OID lookup failed: {}", e));
        }

        let size = self.alarms.len() as u32;
        self.data.alarm.present = size as i32;

        if size > 0 {
            for (symbol, column) in [
                ("upsAlarmId", TableColumn::AlarmId),
                ("upsAlarmDescr", TableColumn::AlarmDescr),
                ("upsAlarmTime", TableColumn::AlarmTime),
            ] {
                self.register_table(mib, symbol, column, size)
                    .unwrap_or_else(|e| panic!("alarm table OID lookup failed: {}", e));
            }
        }

        self.alarms.take_pending()
    }

    fn table_value(&self, column: TableColumn, row: u32) -> Option<Value> {
        use TableColumn::*;

        let alarm = |row: u32| self.alarms.entry(row as usize - 1);
        match column {
            AlarmId => alarm(row).map(|e| Value::Integer(e.index)),
            AlarmDescr => alarm(row).map(|e| Value::ObjectIdentifier(e.oid.clone())),
            AlarmTime => alarm(row).map(|e| Value::TimeTicks(e.time)),
            InputLineIndex | OutputLineIndex => Some(Value::Integer(row as i32)),
            InputFrequency => Some(Value::Integer(round(self.user.input.frequency * 10.0))),
            InputVoltage => Some(Value::Integer(round(self.user.input.voltage))),
            InputCurrent => Some(Value::Integer(round(self.user.input.current * 10.0))),
            InputTruePower => Some(Value::Integer(round(self.user.input.power))),
            OutputVoltage => Some(Value::Integer(round(self.user.output.voltage))),
            OutputCurrent => Some(Value::Integer(round(self.user.output.current * 10.0))),
            OutputPower => Some(Value::Integer(round(self.user.output.power))),
            OutputPercentLoad => Some(Value::Integer(self.user.output.load)),
        }
    }

    fn field_value(&self, index: usize) -> Option<Value> {
        let spec = FIELDS.get(index)?;
        Some(match (spec.get)(&self.data) {
            FieldValue::Str(s) => Value::string(&s),
            FieldValue::Int(x) => Value::Integer(x),
            FieldValue::Ticks(t) => Value::TimeTicks(t),
        })
    }
}

impl ValueStore for UpsState {
    type Source = ValueSource;

    fn bindings(&self, role: CommunityRole) -> &BindingSet<ValueSource> {
        match role {
            CommunityRole::Public => &self.public,
            CommunityRole::Private => &self.private,
        }
    }

    fn load(&self, source: &ValueSource) -> Option<Value> {
        match source {
            ValueSource::Field(index) => self.field_value(*index),
            ValueSource::Table(column, row) => self.table_value(*column, *row),
        }
    }

    fn store(&mut self, source: &ValueSource, value: &Value) -> Result<(), ErrorStatus> {
        let ValueSource::Field(index) = source else {
            return Err(ErrorStatus::NotWritable);
        };
        let spec = FIELDS.get(*index).ok_or(ErrorStatus::GenErr)?;

        let converted = match (spec.kind, value) {
            (FieldKind::Str, Value::OctetString(bytes)) => {
                FieldValue::Str(String::from_utf8_lossy(bytes).into_owned())
            }
            (FieldKind::Int, Value::Integer(x)) => FieldValue::Int(*x),
            (FieldKind::Ticks, Value::TimeTicks(t)) => FieldValue::Ticks(*t),
            _ => return Err(ErrorStatus::WrongType),
        };

        let prior = (spec.get)(&self.data);
        (spec.set)(&mut self.data, converted.clone());
        tracing::debug!(target: "app::model", symbol = spec.name, value = %ValueDisplay(&converted),
            "scalar written via SNMP");

        let hook = self.profile.on_set;
        hook(self, spec.name, &prior, &converted);
        Ok(())
    }
}

struct ValueDisplay<'a>(&'a FieldValue);

impl std::fmt::Display for ValueDisplay<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            FieldValue::Str(s) => write!(f, "{}", s),
            FieldValue::Int(x) => write!(f, "{}", x),
            FieldValue::Ticks(t) => write!(f, "{}t", t),
        }
    }
}

/// The base OID every published object sits under (UPS-MIB).
pub fn ups_mib_root() -> Oid {
    crate::oid!(1, 3, 6, 1, 2, 1, 33)
}
