//! Device profiles: model-specific command strings, enable mask and the
//! receive/set hooks that translate decoded frames into snapshot state and
//! alarm edges.
//!
//! Hooks are plain `fn` items taking the state, the resolver and the clock
//! as parameters, so no profile captures the agent and no reference cycles
//! form between the profile, the registry and the bindings.

use crate::alarm::PendingTrap;
use crate::error::ResolveError;
use crate::mib::Mib;
use crate::model::{FieldValue, TableColumn, UpsData, UpsState};
use crate::proto::{self, Frame, QueryResult, RatingInfo};

/// The command strings a profile issues over the wire; empty commands are
/// never sent.
#[derive(Debug, Clone, Copy)]
pub struct CommandSet {
    /// status query (`Q1`)
    pub get_info: &'static str,
    /// rating query (`F`)
    pub get_rated: &'static str,
    /// manufacturer query (`I`)
    pub get_manufacturer: &'static str,
    /// 10-second self test (`T`)
    pub test: &'static str,
    /// test until battery low (`TL`)
    pub test_to_battery_low: &'static str,
    /// timed test (`T<n>`)
    pub test_with_minimum: &'static str,
    /// shutdown (`S<n>`)
    pub poweroff: &'static str,
    /// shutdown then restore (`S<n>R<m>`)
    pub poweroff_and_start: &'static str,
    /// toggle the buzzer (`Q`)
    pub switch_buzz: &'static str,
    /// cancel shutdown (`C`)
    pub cancel_all_poweroff: &'static str,
    /// cancel test (`CT`)
    pub cancel_all_test: &'static str,
    /// three-phase status (`G1`)
    pub extra_get_info: &'static str,
    /// three-phase fault status (`G2`)
    pub extra_get_error: &'static str,
    /// three-phase line detail (`G3`)
    pub extra_get_tp_info: &'static str,
    /// three-phase rating (`GF`)
    pub extra_get_rated: &'static str,
}

impl CommandSet {
    /// The poll-loop cadence, in issue order.
    pub fn poll_sequence(&self) -> [&'static str; 7] {
        [
            self.get_info,
            self.get_rated,
            self.get_manufacturer,
            self.extra_get_info,
            self.extra_get_error,
            self.extra_get_tp_info,
            self.extra_get_rated,
        ]
    }
}

/// Live line readings kept outside the MIB snapshot, backing the
/// input/output table rows.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LineInfo {
    pub voltage: f32,
    pub current: f32,
    pub frequency: f32,
    pub power: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OutputInfo {
    pub voltage: f32,
    pub current: f32,
    pub power: f32,
    pub load: i32,
}

/// Per-profile working data: cached rating plus live line info.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProfileData {
    pub rating: RatingInfo,
    pub input: LineInfo,
    pub output: OutputInfo,
}

/// One UPS model's behaviour.
pub struct Profile {
    pub name: &'static str,
    pub commands: CommandSet,
    /// Snapshot whose non-zero fields switch the matching bindings on.
    pub enable_mask: fn() -> UpsData,
    /// Populate identity fields and register the profile's dynamic tables.
    pub init: fn(&mut UpsState, &Mib) -> Result<(), ResolveError>,
    /// Handle one raw serial line; returns the alarm edges to announce.
    pub on_receive: fn(&mut UpsState, &Mib, u32, &str) -> Vec<PendingTrap>,
    /// Runs after an SNMP Set wrote a field; `prior` is the value before
    /// the write.
    pub on_set: fn(&mut UpsState, &str, &FieldValue, &FieldValue),
}

fn round(f: f32) -> i32 {
    f.round() as i32
}

// ---- MT1000-Pro ----

/// Battery voltage (total, Vdc) the charge interpolation treats as empty.
const MT1000_BATTERY_EMPTY_V: f32 = 21.6;
/// Battery voltage treated as fully charged.
const MT1000_BATTERY_FULL_V: f32 = 27.4;

static MT1000_PRO: Profile = Profile {
    name: "MT1000-Pro",
    commands: CommandSet {
        get_info: "Q1",
        get_rated: "F",
        get_manufacturer: "",
        test: "T",
        test_to_battery_low: "",
        test_with_minimum: "",
        poweroff: "",
        poweroff_and_start: "",
        switch_buzz: "Q",
        cancel_all_poweroff: "",
        cancel_all_test: "",
        extra_get_info: "",
        extra_get_error: "",
        extra_get_tp_info: "",
        extra_get_rated: "",
    },
    enable_mask: mt1000_enable_mask,
    init: mt1000_init,
    on_receive: mt1000_on_receive,
    on_set: mt1000_on_set,
};

/// The MT1000-Pro reference profile.
pub fn mt1000_pro() -> &'static Profile {
    &MT1000_PRO
}

fn mt1000_enable_mask() -> UpsData {
    let mut mask = UpsData::default();
    mask.ident.manufacturer = "1".into();
    mask.ident.model = "1".into();
    mask.ident.ups_software_version = "1".into();
    mask.ident.agent_software_version = "1".into();

    mask.battery.status = 1;
    mask.battery.seconds_on_battery = 1;
    mask.battery.minutes_remaining = 1;
    mask.battery.charge_remaining = 1;
    mask.battery.voltage = 1;
    mask.battery.current = 1;
    mask.battery.temperature = 1;

    mask.input.line_bads = 1;
    mask.input.num_lines = 1;

    mask.output.source = 1;
    mask.output.frequency = 1;
    mask.output.num_lines = 1;

    mask.alarm.present = 1;

    mask.config.audible_status = 1;
    mask
}

fn mt1000_init(state: &mut UpsState, mib: &Mib) -> Result<(), ResolveError> {
    state.data.ident.manufacturer = "Eaton".into();
    state.data.ident.model = "MT1000-Pro".into();
    state.data.ident.ups_software_version = "1.0.0".into();
    state.data.ident.agent_software_version = env!("CARGO_PKG_VERSION").into();

    state.data.input.num_lines = 1;
    state.data.output.num_lines = 1;

    for (symbol, column) in [
        ("upsInputLineIndex", TableColumn::InputLineIndex),
        ("upsInputFrequency", TableColumn::InputFrequency),
        ("upsInputVoltage", TableColumn::InputVoltage),
        ("upsInputCurrent", TableColumn::InputCurrent),
        ("upsInputTruePower", TableColumn::InputTruePower),
        ("upsOutputLineIndex", TableColumn::OutputLineIndex),
        ("upsOutputVoltage", TableColumn::OutputVoltage),
        ("upsOutputCurrent", TableColumn::OutputCurrent),
        ("upsOutputPower", TableColumn::OutputPower),
        ("upsOutputPercentLoad", TableColumn::OutputPercentLoad),
    ] {
        state.register_table(mib, symbol, column, 1)?;
    }

    Ok(())
}

fn mt1000_on_receive(
    state: &mut UpsState,
    mib: &Mib,
    now_ticks: u32,
    line: &str,
) -> Vec<PendingTrap> {
    match proto::parse(line) {
        Frame::Query(query) => mt1000_on_query(state, mib, now_ticks, &query),
        Frame::Rating(rating) => {
            tracing::debug!(target: "app::device", ?rating, "rating cached");
            state.user.rating = rating;
            Vec::new()
        }
        frame => {
            tracing::debug!(target: "app::device", ?frame, "unhandled frame dropped");
            Vec::new()
        }
    }
}

fn mt1000_on_query(
    state: &mut UpsState,
    mib: &Mib,
    now_ticks: u32,
    query: &QueryResult,
) -> Vec<PendingTrap> {
    tracing::debug!(target: "app::device", ?query, "status frame");
    let status = query.status;
    let rating = state.user.rating;

    // Battery group. Charge interpolates over the usable voltage window and
    // clamps at 100; readings below the empty point go negative as-is.
    state.data.battery.voltage = round(query.battery_voltage * 10.0);
    let charge = (query.battery_voltage - MT1000_BATTERY_EMPTY_V)
        / (MT1000_BATTERY_FULL_V - MT1000_BATTERY_EMPTY_V)
        * 100.0;
    state.data.battery.charge_remaining = round(charge).min(100);
    state.data.battery.temperature = round(query.temperature);
    state.data.battery.status = if status.battery_low { 3 } else { 2 };

    // AC-side current from the rated maximum; battery-side current scales it
    // by the voltage ratio and only flows while on battery.
    let ac_current = rating.current as f32 * query.load_percent as f32 / 100.0;
    state.data.battery.current = if status.utility_fail {
        let battery_current = ac_current * query.output_voltage / query.battery_voltage;
        round(battery_current * 10.0)
    } else {
        0
    };

    // Runtime estimate: linear between (50 %, 10 min) and (100 %, 3.5 min),
    // extrapolated beyond both anchors.
    let minutes = 10.0 + (3.5 - 10.0) / (100.0 - 50.0) * (query.load_percent as f32 - 50.0);
    state.data.battery.minutes_remaining = round(minutes);

    // Output, bypass, input groups
    state.data.output.frequency = round(query.input_freq * 10.0);
    state.data.bypass.frequency = round(query.input_freq * 10.0);
    if status.utility_fail {
        state.data.output.source = 5; // battery
        state.data.input.line_bads = 1;
        state.data.battery.seconds_on_battery += 1;
    } else {
        state.data.output.source = 3; // normal
        state.data.input.line_bads = 0;
        state.data.battery.seconds_on_battery = 0;
    }

    state.user.output = OutputInfo {
        voltage: query.output_voltage,
        current: ac_current,
        power: query.output_voltage * ac_current,
        load: query.load_percent,
    };
    state.user.input = LineInfo {
        voltage: query.input_voltage,
        current: ac_current,
        frequency: query.input_freq,
        power: query.output_voltage * ac_current,
    };

    // Config group
    state.data.config.audible_status = if status.buzzer_active { 2 } else { 3 };

    // Alarm reconciliation: membership mirrors the condition, traps fire
    // only on edges.
    let conditions = [
        (status.battery_low, "upsAlarmLowBattery"),
        (status.utility_fail, "upsAlarmInputBad"),
        (status.shutdown_active, "upsAlarmUpsSystemOff"),
        (status.ups_failed, "upsAlarmGeneralFault"),
        (query.load_percent > 120, "upsAlarmOutputOverload"),
    ];
    for (condition, name) in conditions {
        if condition {
            if !state.alarms.exists(mib, name) {
                state.alarms.add(mib, name, now_ticks);
            }
        } else {
            state.alarms.remove_by_desc(mib, name);
        }
    }

    if status.buzzer_active && state.disable_buzz {
        state.send_command(state.profile.commands.switch_buzz);
    }

    state.apply_alarms(mib)
}

fn mt1000_on_set(state: &mut UpsState, name: &str, prior: &FieldValue, value: &FieldValue) {
    if name != "upsConfigAudibleStatus" {
        return;
    }
    let (FieldValue::Int(prior), FieldValue::Int(value)) = (prior, value) else {
        return;
    };
    // enabled(2) flips to muted/disabled or back: one toggle command
    if (*value == 2) != (*prior == 2) {
        state.send_command(state.profile.commands.switch_buzz);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::TrapKind;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn mib() -> Mib {
        Mib::load_dir(concat!(env!("CARGO_MANIFEST_DIR"), "/mibs")).unwrap()
    }

    fn state(disable_buzz: bool) -> (UpsState, UnboundedReceiver<String>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let mut state = UpsState::new(mt1000_pro(), false, disable_buzz, tx);
        state.user.rating = RatingInfo {
            voltage: 220.0,
            current: 7,
            battery_voltage: 24.0,
            frequency: 50.0,
        };
        (state, rx)
    }

    fn receive(state: &mut UpsState, mib: &Mib, line: &str) -> Vec<PendingTrap> {
        let hook = state.profile.on_receive;
        hook(state, mib, 1000, line)
    }

    #[test]
    fn query_mains_ok() {
        let mib = mib();
        let (mut state, mut rx) = state(false);

        let traps = receive(&mut state, &mib, "(228.0 228.0 228.4 006 50.2 27.4 25.0 00001000");

        assert_eq!(state.data.output.source, 3);
        assert_eq!(state.data.input.line_bads, 0);
        assert_eq!(state.data.battery.status, 2);
        assert_eq!(state.data.battery.charge_remaining, 100);
        assert_eq!(state.data.battery.voltage, 274);
        assert_eq!(state.data.battery.current, 0);
        assert_eq!(state.data.battery.temperature, 25);
        assert_eq!(state.data.output.frequency, 502);
        assert_eq!(state.data.config.audible_status, 3);
        assert!(traps.is_empty());
        assert!(state.alarms.is_empty());
        assert!(rx.try_recv().is_err(), "no serial command expected");
    }

    #[test]
    fn query_mains_fail_battery_low() {
        let mib = mib();
        let (mut state, _rx) = state(false);

        let traps = receive(&mut state, &mib, "(228.0 228.0 228.4 017 50.0 21.6 25.0 11000001");

        assert_eq!(state.data.output.source, 5);
        assert_eq!(state.data.input.line_bads, 1);
        assert_eq!(state.data.battery.status, 3);
        assert_eq!(state.data.battery.charge_remaining, 0);
        assert_eq!(state.data.config.audible_status, 2);
        assert_eq!(state.data.battery.seconds_on_battery, 1);

        let expected: Vec<_> = ["upsAlarmLowBattery", "upsAlarmInputBad"]
            .iter()
            .map(|name| mib.resolve(name).unwrap())
            .collect();
        let present: Vec<_> = state.alarms.entries().iter().map(|e| e.oid.clone()).collect();
        assert_eq!(present, expected);
        assert_eq!(state.data.alarm.present, 2);

        assert_eq!(traps.len(), 2);
        assert!(traps.iter().all(|t| t.kind == TrapKind::Added));
    }

    #[test]
    fn overload_recovery_emits_one_removed_trap() {
        let mib = mib();
        let (mut state, _rx) = state(false);

        let traps = receive(&mut state, &mib, "(228.0 228.0 228.4 150 50.0 27.4 25.0 00000000");
        assert!(state.alarms.exists(&mib, "upsAlarmOutputOverload"));
        assert_eq!(traps.len(), 1);
        assert_eq!(traps[0].kind, TrapKind::Added);

        let traps = receive(&mut state, &mib, "(228.0 228.0 228.4 100 50.0 27.4 25.0 00000000");
        assert!(!state.alarms.exists(&mib, "upsAlarmOutputOverload"));
        assert_eq!(traps.len(), 1);
        assert_eq!(traps[0].kind, TrapKind::Removed);
        assert_eq!(state.data.alarm.present, 0);
    }

    #[test]
    fn steady_alarm_fires_no_repeat_traps() {
        let mib = mib();
        let (mut state, _rx) = state(false);

        let line = "(228.0 228.0 228.4 017 50.0 27.4 25.0 10000000";
        let first = receive(&mut state, &mib, line);
        assert_eq!(first.len(), 1);
        let second = receive(&mut state, &mib, line);
        assert!(second.is_empty(), "no edge, no trap");
        assert_eq!(state.alarms.len(), 1);
    }

    #[test]
    fn battery_current_flows_only_on_battery() {
        let mib = mib();
        let (mut state, _rx) = state(false);

        receive(&mut state, &mib, "(228.0 228.0 220.0 050 50.0 22.0 25.0 00000000");
        assert_eq!(state.data.battery.current, 0);

        receive(&mut state, &mib, "(228.0 228.0 220.0 050 50.0 22.0 25.0 10000000");
        // 7 A * 50 % = 3.5 A AC; * 220 / 22 = 35 A battery side, in tenths
        assert_eq!(state.data.battery.current, 350);
    }

    #[test]
    fn minutes_estimate_interpolates_and_extrapolates() {
        let mib = mib();
        let (mut state, _rx) = state(false);

        receive(&mut state, &mib, "(228.0 228.0 228.4 050 50.0 27.4 25.0 00000000");
        assert_eq!(state.data.battery.minutes_remaining, 10);

        receive(&mut state, &mib, "(228.0 228.0 228.4 100 50.0 27.4 25.0 00000000");
        assert_eq!(state.data.battery.minutes_remaining, 4); // 3.5 rounds up

        // beyond 100 % load the line keeps going down
        receive(&mut state, &mib, "(228.0 228.0 228.4 200 50.0 27.4 25.0 00000000");
        assert!(state.data.battery.minutes_remaining < 0);
    }

    #[test]
    fn charge_has_no_lower_clamp() {
        let mib = mib();
        let (mut state, _rx) = state(false);

        receive(&mut state, &mib, "(228.0 228.0 228.4 006 50.0 20.0 25.0 00000000");
        assert!(state.data.battery.charge_remaining < 0);
    }

    #[test]
    fn rating_frame_updates_cache() {
        let mib = mib();
        let (mut state, _rx) = state(false);

        receive(&mut state, &mib, "#230.0 010 24.00 60.0");
        assert_eq!(
            state.user.rating,
            RatingInfo {
                voltage: 230.0,
                current: 10,
                battery_voltage: 24.0,
                frequency: 60.0,
            }
        );
    }

    #[test]
    fn unknown_frames_are_dropped() {
        let mib = mib();
        let (mut state, _rx) = state(false);
        let before = state.data.clone();

        let traps = receive(&mut state, &mib, "garbage with no discriminator");
        assert!(traps.is_empty());
        assert_eq!(state.data, before);
    }

    #[test]
    fn buzzer_silenced_when_configured() {
        let mib = mib();

        let (mut state1, mut rx1) = state(true);
        receive(&mut state1, &mib, "(228.0 228.0 228.4 006 50.2 27.4 25.0 00000001");
        assert_eq!(rx1.try_recv().unwrap(), "Q");

        let (mut state2, mut rx2) = state(false);
        receive(&mut state2, &mib, "(228.0 228.0 228.4 006 50.2 27.4 25.0 00000001");
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn audible_status_set_toggles_buzzer_once() {
        let (mut state, mut rx) = state(false);
        let hook = state.profile.on_set;

        // enabled -> muted: toggle
        hook(
            &mut state,
            "upsConfigAudibleStatus",
            &FieldValue::Int(2),
            &FieldValue::Int(3),
        );
        assert_eq!(rx.try_recv().unwrap(), "Q");

        // muted -> disabled: no semantic change
        hook(
            &mut state,
            "upsConfigAudibleStatus",
            &FieldValue::Int(3),
            &FieldValue::Int(1),
        );
        assert!(rx.try_recv().is_err());

        // other symbols are ignored
        hook(
            &mut state,
            "upsIdentName",
            &FieldValue::Int(2),
            &FieldValue::Int(3),
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn poll_sequence_order_and_gaps() {
        let commands = mt1000_pro().commands;
        let sequence = commands.poll_sequence();
        assert_eq!(sequence[0], "Q1");
        assert_eq!(sequence[1], "F");
        // the reference profile leaves the manufacturer and three-phase
        // queries empty; the poll loop skips them
        assert!(sequence[2..].iter().all(|cmd| cmd.is_empty()));
    }
}
