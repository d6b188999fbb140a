//! Megatec/Voltronic "Q1" response decoder.
//!
//! One inbound serial line decodes to one [`Frame`]. The decoder is total:
//! framing noise triggers a recovery scan to the first discriminator byte,
//! numeric garbage parses as zero, and anything unrecognisable comes back as
//! [`Frame::Unknown`]. The UPS never gets to wedge the agent.

/// Start byte of a status query response (`Q1`).
pub const QUERY_BYTE: char = '(';
/// Start byte of a rating info response (`F`).
pub const RATING_BYTE: char = '#';
/// Start byte of the three-phase extension responses (`G1`/`G2`/`G3`/`GF`).
pub const EXTRA_BYTE: char = '!';

/// UPS status bits, transmitted left to right as `b7..b0`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsStatus {
    /// b7: utility power failed, running from battery
    pub utility_fail: bool,
    /// b6: battery voltage low
    pub battery_low: bool,
    /// b5: bypass/boost (AVR) active
    pub bypass_boost_active: bool,
    /// b4: UPS failed
    pub ups_failed: bool,
    /// b3: standby (line-interactive) type; 0 means online
    pub ups_standby: bool,
    /// b2: self test in progress
    pub test_active: bool,
    /// b1: shutdown active
    pub shutdown_active: bool,
    /// b0: buzzer on
    pub buzzer_active: bool,
}

/// `Q1` response: eight space-separated fields.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QueryResult {
    pub input_voltage: f32,
    /// Holds the transient voltage that caused the last transfer; tracks
    /// input voltage once the fault is queried.
    pub input_fault_voltage: f32,
    pub output_voltage: f32,
    /// Percentage of the maximum rated current, not an absolute value.
    pub load_percent: i32,
    pub input_freq: f32,
    /// `S.SS` (per-cell, online types) or `SS.S` (total, standby types).
    pub battery_voltage: f32,
    pub temperature: f32,
    pub status: UpsStatus,
}

/// `F` response: rated values.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RatingInfo {
    pub voltage: f32,
    pub current: i32,
    pub battery_voltage: f32,
    pub frequency: f32,
}

/// `G1` response: three-phase battery and frequency detail.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ExtraQueryResult {
    pub battery_voltage: i32,
    pub battery_capacity: i32,
    pub battery_time_remaining: i32,
    pub battery_current: f32,
    pub temperature: f32,
    pub input_freq: f32,
    pub bypass_freq: f32,
    pub output_freq: f32,
}

/// `G2` response: three 7-bit status groups.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtraQueryError {
    // group A
    pub rectifier_fault: bool,
    pub battery_low_protection: bool,
    pub battery_low: bool,
    /// three-phase in, single-phase out when set
    pub tp_in_one_out: bool,
    pub battery_supply: bool,
    /// equalizing charge when set, float charge otherwise
    pub battery_equalization: bool,
    pub rectifier_running: bool,

    // group B
    pub bypass_freq_error: bool,
    pub manual_bypass: bool,
    pub bypass_normal: bool,
    pub static_bypass_on_inverter: bool,
    pub inverter_running: bool,

    // group C
    pub emergency_stop: bool,
    pub battery_input_high: bool,
    pub manual_bypass_stop: bool,
    pub overload_stop: bool,
    pub inverter_output_abnormal: bool,
    pub over_temperature: bool,
    pub output_short_circuit: bool,
}

/// `G3` response: R/S/T voltage triples plus per-phase load.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ThreePhaseInfo {
    pub input_r: f32,
    pub input_s: f32,
    pub input_t: f32,
    pub bypass_r: f32,
    pub bypass_s: f32,
    pub bypass_t: f32,
    pub output_r: f32,
    pub output_s: f32,
    pub output_t: f32,
    pub load_r: f32,
    pub load_s: f32,
    pub load_t: f32,
}

/// `GF` response: rating strings use `^` as an intra-field space filler.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThreePhaseRating {
    pub rectifier_info: String,
    pub rectifier_freq: i32,
    pub bypass_info: String,
    pub bypass_freq: i32,
    pub output_info: String,
    pub output_freq: i32,
    pub battery_voltage: i32,
    pub power_rating: String,
}

/// One decoded UPS response frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Query(QueryResult),
    Rating(RatingInfo),
    ExtraQuery(ExtraQueryResult),
    ExtraError(ExtraQueryError),
    ThreePhase(ThreePhaseInfo),
    ThreePhaseRating(ThreePhaseRating),
    Unknown,
}

/// Silent-zero float parsing: the wire regularly carries damaged digits and
/// a zero reading is preferable to losing the frame.
fn parse_float(s: &str) -> f32 {
    s.parse().unwrap_or(0.0)
}

fn parse_int(s: &str) -> i32 {
    s.parse().unwrap_or(0)
}

/// Decode one line. Lines not starting with a discriminator are scanned for
/// the first one and decoded from there; `parse(junk + frame)` equals
/// `parse(frame)` for discriminator-free junk.
pub fn parse(line: &str) -> Frame {
    let mut chars = line.char_indices();
    let Some((_, start)) = chars.next() else {
        return Frame::Unknown;
    };
    let rest = &line[start.len_utf8()..];

    match start {
        QUERY_BYTE => Frame::Query(parse_query(rest)),
        RATING_BYTE => Frame::Rating(parse_rating(rest)),
        EXTRA_BYTE => parse_extra(rest),
        _ => {
            for (i, c) in line.char_indices().skip(1) {
                if c == QUERY_BYTE || c == RATING_BYTE || c == EXTRA_BYTE {
                    return parse(&line[i..]);
                }
            }
            Frame::Unknown
        }
    }
}

fn parse_status(s: &str) -> UpsStatus {
    let mut status = UpsStatus::default();
    for (i, c) in s.chars().enumerate() {
        let bit = c == '1';
        match i {
            0 => status.utility_fail = bit,
            1 => status.battery_low = bit,
            2 => status.bypass_boost_active = bit,
            3 => status.ups_failed = bit,
            4 => status.ups_standby = bit,
            5 => status.test_active = bit,
            6 => status.shutdown_active = bit,
            7 => status.buzzer_active = bit,
            _ => break,
        }
    }
    status
}

fn parse_query(data: &str) -> QueryResult {
    let fields: Vec<&str> = data.split(' ').collect();
    if fields.len() != 8 {
        return QueryResult::default();
    }
    QueryResult {
        input_voltage: parse_float(fields[0]),
        input_fault_voltage: parse_float(fields[1]),
        output_voltage: parse_float(fields[2]),
        load_percent: parse_int(fields[3]),
        input_freq: parse_float(fields[4]),
        battery_voltage: parse_float(fields[5]),
        temperature: parse_float(fields[6]),
        status: parse_status(fields[7]),
    }
}

fn parse_rating(data: &str) -> RatingInfo {
    let fields: Vec<&str> = data.split(' ').collect();
    if fields.len() != 4 {
        return RatingInfo::default();
    }
    RatingInfo {
        voltage: parse_float(fields[0]),
        current: parse_int(fields[1]),
        battery_voltage: parse_float(fields[2]),
        frequency: parse_float(fields[3]),
    }
}

/// The `!` family is discriminated by field count; an unknown count decodes
/// to Unknown rather than guessing a shape.
fn parse_extra(data: &str) -> Frame {
    let fields: Vec<&str> = data.split(' ').collect();
    match fields.len() {
        8 => Frame::ExtraQuery(parse_extra_query(&fields)),
        3 => Frame::ExtraError(parse_extra_error(&fields)),
        4 => Frame::ThreePhase(parse_three_phase(&fields)),
        5 => Frame::ThreePhaseRating(parse_three_phase_rating(&fields)),
        _ => Frame::Unknown,
    }
}

fn parse_extra_query(fields: &[&str]) -> ExtraQueryResult {
    ExtraQueryResult {
        battery_voltage: parse_int(fields[0]),
        battery_capacity: parse_int(fields[1]),
        battery_time_remaining: parse_int(fields[2]),
        battery_current: parse_float(fields[3]),
        temperature: parse_float(fields[4]),
        input_freq: parse_float(fields[5]),
        bypass_freq: parse_float(fields[6]),
        output_freq: parse_float(fields[7]),
    }
}

fn parse_extra_error(fields: &[&str]) -> ExtraQueryError {
    let mut result = ExtraQueryError::default();

    for (i, c) in fields[0].chars().enumerate() {
        let bit = c == '1';
        match i {
            0 => result.rectifier_fault = bit,
            1 => result.battery_low_protection = bit,
            2 => result.battery_low = bit,
            3 => result.tp_in_one_out = bit,
            4 => result.battery_supply = bit,
            5 => result.battery_equalization = bit,
            6 => result.rectifier_running = bit,
            _ => break,
        }
    }
    for (i, c) in fields[1].chars().enumerate() {
        let bit = c == '1';
        match i {
            0 => result.bypass_freq_error = bit,
            1 => result.manual_bypass = bit,
            2 => result.bypass_normal = bit,
            3 => result.static_bypass_on_inverter = bit,
            4 => result.inverter_running = bit,
            _ => break,
        }
    }
    for (i, c) in fields[2].chars().enumerate() {
        let bit = c == '1';
        match i {
            0 => result.emergency_stop = bit,
            1 => result.battery_input_high = bit,
            2 => result.manual_bypass_stop = bit,
            3 => result.overload_stop = bit,
            4 => result.inverter_output_abnormal = bit,
            5 => result.over_temperature = bit,
            6 => result.output_short_circuit = bit,
            _ => break,
        }
    }

    result
}

/// Split one `a/b/c` triple; short triples fill with zero.
fn parse_triple(field: &str) -> (f32, f32, f32) {
    let mut parts = field.split('/');
    (
        parts.next().map(parse_float).unwrap_or(0.0),
        parts.next().map(parse_float).unwrap_or(0.0),
        parts.next().map(parse_float).unwrap_or(0.0),
    )
}

fn parse_three_phase(fields: &[&str]) -> ThreePhaseInfo {
    let (input_r, input_s, input_t) = parse_triple(fields[0]);
    let (bypass_r, bypass_s, bypass_t) = parse_triple(fields[1]);
    let (output_r, output_s, output_t) = parse_triple(fields[2]);
    let (load_r, load_s, load_t) = parse_triple(fields[3]);
    ThreePhaseInfo {
        input_r,
        input_s,
        input_t,
        bypass_r,
        bypass_s,
        bypass_t,
        output_r,
        output_s,
        output_t,
        load_r,
        load_s,
        load_t,
    }
}

fn unfill(field: &str) -> String {
    field.replace('^', " ").trim().to_string()
}

fn parse_three_phase_rating(fields: &[&str]) -> ThreePhaseRating {
    // Layout on the wire: info/freq pairs for rectifier, bypass and output
    // collapse into five space-separated fields once `^` fills the gaps
    // inside the info strings.
    ThreePhaseRating {
        rectifier_info: unfill(fields[0]),
        rectifier_freq: parse_int(fields[1]),
        bypass_info: unfill(fields[2]),
        bypass_freq: parse_int(fields[3]),
        output_info: unfill(fields[4]),
        output_freq: 0,
        battery_voltage: 0,
        power_rating: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_result_mains_ok() {
        let frame = parse("(228.0 228.0 228.4 006 50.2 27.4 25.0 00001000");
        let Frame::Query(q) = frame else {
            panic!("expected Query, got {:?}", frame);
        };
        assert_eq!(q.input_voltage, 228.0);
        assert_eq!(q.input_fault_voltage, 228.0);
        assert_eq!(q.output_voltage, 228.4);
        assert_eq!(q.load_percent, 6);
        assert_eq!(q.input_freq, 50.2);
        assert_eq!(q.battery_voltage, 27.4);
        assert_eq!(q.temperature, 25.0);
        assert!(!q.status.utility_fail);
        assert!(!q.status.battery_low);
        assert!(q.status.ups_standby);
        assert!(!q.status.buzzer_active);
    }

    #[test]
    fn query_result_status_bits_left_to_right() {
        let Frame::Query(q) = parse("(0 0 0 0 0 0 0 11000001") else {
            panic!();
        };
        assert!(q.status.utility_fail);
        assert!(q.status.battery_low);
        assert!(!q.status.bypass_boost_active);
        assert!(!q.status.shutdown_active);
        assert!(q.status.buzzer_active);
    }

    #[test]
    fn rating_info() {
        let Frame::Rating(r) = parse("#220.0 007 24.00 50.0") else {
            panic!();
        };
        assert_eq!(r.voltage, 220.0);
        assert_eq!(r.current, 7);
        assert_eq!(r.battery_voltage, 24.0);
        assert_eq!(r.frequency, 50.0);
    }

    #[test]
    fn resync_skips_leading_junk() {
        // noisy prefix before the discriminator
        let Frame::Rating(r) = parse("xyz#220.0 007 24.00 50.0") else {
            panic!();
        };
        assert_eq!(r.voltage, 220.0);
        assert_eq!(r.current, 7);
        assert_eq!(r.battery_voltage, 24.0);
        assert_eq!(r.frequency, 50.0);
    }

    #[test]
    fn resync_is_prefix_invariant() {
        let clean = parse("(228.0 228.0 228.4 006 50.2 27.4 25.0 00001000");
        let noisy = parse("\u{1}\u{2}garbage(228.0 228.0 228.4 006 50.2 27.4 25.0 00001000");
        assert_eq!(clean, noisy);
    }

    #[test]
    fn junk_without_discriminator_is_unknown() {
        assert_eq!(parse("hello world"), Frame::Unknown);
        assert_eq!(parse(""), Frame::Unknown);
        assert_eq!(parse("@"), Frame::Unknown);
    }

    #[test]
    fn field_count_mismatch_yields_zeroed_struct() {
        let Frame::Query(q) = parse("(228.0 228.0") else {
            panic!();
        };
        assert_eq!(q, QueryResult::default());

        let Frame::Rating(r) = parse("#220.0 007") else {
            panic!();
        };
        assert_eq!(r, RatingInfo::default());
    }

    #[test]
    fn bad_numbers_parse_as_zero() {
        let Frame::Query(q) = parse("(22x.0 228.0 228.4 0!6 50.2 27.4 25.0 00000000") else {
            panic!();
        };
        assert_eq!(q.input_voltage, 0.0);
        assert_eq!(q.load_percent, 0);
        assert_eq!(q.output_voltage, 228.4);
    }

    #[test]
    fn extra_query_by_field_count() {
        let Frame::ExtraQuery(e) = parse("!240 094 0123 025.0 +35.0 50.1 52.0 50.0") else {
            panic!();
        };
        assert_eq!(e.battery_voltage, 240);
        assert_eq!(e.battery_capacity, 94);
        assert_eq!(e.battery_time_remaining, 123);
        assert_eq!(e.battery_current, 25.0);
        assert_eq!(e.temperature, 35.0);
        assert_eq!(e.input_freq, 50.1);
        assert_eq!(e.bypass_freq, 52.0);
        assert_eq!(e.output_freq, 50.0);
    }

    #[test]
    fn extra_error_bit_groups() {
        let Frame::ExtraError(e) = parse("!00000010 00000100 00000000") else {
            panic!();
        };
        // group A, index 6 of "00000010" is '1'
        assert!(e.rectifier_running);
        assert!(!e.rectifier_fault);
        // group B, index 5 of "00000100" is '1' but group B only has 5 bits
        assert!(!e.bypass_freq_error);
        assert!(!e.inverter_running);
        // group C all clear
        assert_eq!(
            (e.emergency_stop, e.over_temperature, e.output_short_circuit),
            (false, false, false)
        );
    }

    #[test]
    fn three_phase_info_triples() {
        let Frame::ThreePhase(t) =
            parse("!222.0/222.0/222.0 221.0/221.0/221.0 220.0/220.0/220.0 014.0/015.0/014.0")
        else {
            panic!();
        };
        assert_eq!(t.input_r, 222.0);
        assert_eq!(t.bypass_s, 221.0);
        assert_eq!(t.output_t, 220.0);
        assert_eq!(t.load_s, 15.0);
    }

    #[test]
    fn three_phase_rating_unfills_carets() {
        let Frame::ThreePhaseRating(r) = parse("!220V/380V^3P4W 050 220V/380V^3P4W 050 396")
        else {
            panic!();
        };
        assert_eq!(r.rectifier_info, "220V/380V 3P4W");
        assert_eq!(r.rectifier_freq, 50);
        assert_eq!(r.bypass_info, "220V/380V 3P4W");
        assert_eq!(r.bypass_freq, 50);
        assert_eq!(r.output_info, "396");
    }

    #[test]
    fn extra_with_unknown_field_count_is_unknown() {
        assert_eq!(parse("!1 2"), Frame::Unknown);
        assert_eq!(parse("!1 2 3 4 5 6"), Frame::Unknown);
    }

    #[test]
    fn decoder_is_total_over_arbitrary_bytes() {
        for line in ["\u{0}\u{1}\u{2}", "(((", "#", "!", "(# !", "ÿþý("] {
            let _ = parse(line); // must not panic
        }
    }
}
