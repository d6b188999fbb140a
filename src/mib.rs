//! Symbolic-name to numeric-OID resolution over loaded SMIv2 modules.
//!
//! The loader understands the registration subset of SMIv2: statements of
//! the form `label KEYWORD ... ::= { parent n }` for OBJECT-TYPE,
//! OBJECT-IDENTITY, MODULE-IDENTITY, NOTIFICATION-TYPE and plain
//! `OBJECT IDENTIFIER` assignments. That is everything the agent needs to
//! turn UPS-MIB symbols into OIDs; full SMI syntax is out of scope.

use std::collections::HashMap;
use std::path::Path;

use crate::error::ResolveError;
use crate::snmp::Oid;

/// Keywords that introduce a registration whose label we keep.
const DEFINITION_KEYWORDS: &[&str] = &[
    "OBJECT-TYPE",
    "OBJECT-IDENTITY",
    "MODULE-IDENTITY",
    "NOTIFICATION-TYPE",
];

/// Resolver over all loaded modules.
pub struct Mib {
    symbols: HashMap<String, Oid>,
}

impl Mib {
    /// Load every file under `dir`. Fails when the directory is unreadable
    /// or no symbol could be resolved at all.
    pub fn load_dir(dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let mut mib = Self::with_anchors();
        let mut pending = Vec::new();

        for entry in std::fs::read_dir(dir.as_ref())? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let text = std::fs::read_to_string(&path)?;
            pending.extend(scan_registrations(&text));
            tracing::debug!(target: "app::mib", module = %path.display(), "loaded MIB module");
        }

        mib.resolve_pending(pending);
        Ok(mib)
    }

    /// Build a resolver from MIB text directly (used by tests).
    pub fn from_text(text: &str) -> Self {
        let mut mib = Self::with_anchors();
        mib.resolve_pending(scan_registrations(text));
        mib
    }

    /// The well-known roots every SMIv2 module hangs off.
    fn with_anchors() -> Self {
        let mut symbols = HashMap::new();
        for (name, arcs) in [
            ("iso", &[1][..]),
            ("org", &[1, 3][..]),
            ("dod", &[1, 3, 6][..]),
            ("internet", &[1, 3, 6, 1][..]),
            ("directory", &[1, 3, 6, 1, 1][..]),
            ("mgmt", &[1, 3, 6, 1, 2][..]),
            ("mib-2", &[1, 3, 6, 1, 2, 1][..]),
            ("transmission", &[1, 3, 6, 1, 2, 1, 10][..]),
            ("experimental", &[1, 3, 6, 1, 3][..]),
            ("private", &[1, 3, 6, 1, 4][..]),
            ("enterprises", &[1, 3, 6, 1, 4, 1][..]),
            ("snmpV2", &[1, 3, 6, 1, 6][..]),
            ("snmpModules", &[1, 3, 6, 1, 6, 3][..]),
            ("snmpMIB", &[1, 3, 6, 1, 6, 3, 1][..]),
            ("snmpMIBObjects", &[1, 3, 6, 1, 6, 3, 1, 1][..]),
            ("snmpTraps", &[1, 3, 6, 1, 6, 3, 1, 1, 5][..]),
        ] {
            symbols.insert(name.to_string(), Oid::from_slice(arcs));
        }
        Self { symbols }
    }

    /// Fixpoint over `(label, parent, arc)` triples: each pass resolves the
    /// labels whose parents are already known.
    fn resolve_pending(&mut self, mut pending: Vec<(String, String, u32)>) {
        loop {
            let before = pending.len();
            pending.retain(|(label, parent, arc)| {
                if let Some(parent_oid) = self.symbols.get(parent).cloned() {
                    self.symbols.insert(label.clone(), parent_oid.child(*arc));
                    false
                } else {
                    true
                }
            });
            if pending.len() == before {
                break;
            }
        }
        for (label, parent, _) in &pending {
            tracing::debug!(target: "app::mib", label = %label, parent = %parent,
                "unresolved MIB registration");
        }
    }

    /// Number of known symbols (anchors included).
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Resolve a symbol to its numeric OID. Strings with a leading `.` are
    /// taken as numeric OIDs and pass through unchanged.
    pub fn resolve(&self, name: &str) -> Result<Oid, ResolveError> {
        if let Some(stripped) = name.strip_prefix('.') {
            return Oid::parse(stripped).map_err(|_| ResolveError::BadOid(name.to_string()));
        }
        self.symbols
            .get(name)
            .cloned()
            .ok_or_else(|| ResolveError::UnknownSymbol(name.to_string()))
    }
}

/// Extract `(label, parent, arc)` registrations from module text.
fn scan_registrations(text: &str) -> Vec<(String, String, u32)> {
    let tokens = tokenize(text);
    let mut out = Vec::new();
    let mut pending_label: Option<String> = None;
    let mut i = 0;

    while i < tokens.len() {
        match tokens[i].as_str() {
            "::=" => {
                // match `::= { parent n }`
                if let Some(label) = pending_label.take() {
                    if tokens.get(i + 1).map(String::as_str) == Some("{")
                        && tokens.get(i + 4).map(String::as_str) == Some("}")
                    {
                        if let (Some(parent), Some(arc)) = (
                            tokens.get(i + 2),
                            tokens.get(i + 3).and_then(|t| t.parse::<u32>().ok()),
                        ) {
                            out.push((label, parent.clone(), arc));
                            i += 5;
                            continue;
                        }
                    }
                }
            }
            keyword if DEFINITION_KEYWORDS.contains(&keyword) => {
                if i > 0 {
                    pending_label = Some(tokens[i - 1].clone());
                }
            }
            "IDENTIFIER" => {
                // `label OBJECT IDENTIFIER ::= { parent n }`; a SYNTAX
                // clause of OBJECT IDENTIFIER is not a registration
                if i >= 2 && tokens[i - 1] == "OBJECT" && tokens[i - 2] != "SYNTAX" {
                    pending_label = Some(tokens[i - 2].clone());
                }
            }
            _ => {}
        }
        i += 1;
    }

    out
}

/// Split into identifiers, numbers, `::=`, `{` and `}`; `--` comments run to
/// end of line; everything else is ignored.
fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    for line in text.lines() {
        let line = match line.find("--") {
            Some(pos) => &line[..pos],
            None => line,
        };
        let mut chars = line.char_indices().peekable();
        while let Some((start, c)) = chars.next() {
            if c.is_ascii_alphanumeric() {
                let mut end = start + 1;
                while let Some(&(pos, next)) = chars.peek() {
                    if next.is_ascii_alphanumeric() || next == '-' {
                        end = pos + 1;
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(line[start..end].to_string());
            } else if c == ':' {
                if line[start..].starts_with("::=") {
                    tokens.push("::=".to_string());
                    chars.next();
                    chars.next();
                }
            } else if c == '{' || c == '}' {
                tokens.push(c.to_string());
            }
        }
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oid;

    const SNIPPET: &str = r#"
TEST-MIB DEFINITIONS ::= BEGIN

upsMIB MODULE-IDENTITY
    LAST-UPDATED "9402230000Z"
    ::= { mib-2 33 }

upsObjects OBJECT IDENTIFIER ::= { upsMIB 1 }
upsBattery OBJECT IDENTIFIER ::= { upsObjects 2 }

upsBatteryStatus OBJECT-TYPE
    SYNTAX INTEGER {
        unknown(1),
        batteryNormal(2),
        batteryLow(3),
        batteryDepleted(4)
    }
    MAX-ACCESS read-only
    STATUS current
    ::= { upsBattery 1 }  -- trailing comment

upsTraps OBJECT IDENTIFIER ::= { upsMIB 2 }

upsTrapAlarmEntryAdded NOTIFICATION-TYPE
    OBJECTS { upsAlarmId, upsAlarmDescr }
    STATUS current
    ::= { upsTraps 3 }

END
"#;

    #[test]
    fn resolves_nested_registrations() {
        let mib = Mib::from_text(SNIPPET);
        assert_eq!(mib.resolve("upsMIB").unwrap(), oid!(1, 3, 6, 1, 2, 1, 33));
        assert_eq!(
            mib.resolve("upsBatteryStatus").unwrap(),
            oid!(1, 3, 6, 1, 2, 1, 33, 1, 2, 1)
        );
        assert_eq!(
            mib.resolve("upsTrapAlarmEntryAdded").unwrap(),
            oid!(1, 3, 6, 1, 2, 1, 33, 2, 3)
        );
    }

    #[test]
    fn enum_clauses_do_not_confuse_the_scanner() {
        // the INTEGER { ... } braces before ::= must not be taken as a
        // registration
        let mib = Mib::from_text(SNIPPET);
        assert!(mib.resolve("batteryNormal").is_err());
    }

    #[test]
    fn numeric_passthrough() {
        let mib = Mib::from_text("");
        assert_eq!(
            mib.resolve(".1.3.6.1.4.1.123.0.2").unwrap(),
            oid!(1, 3, 6, 1, 4, 1, 123, 0, 2)
        );
        assert!(mib.resolve(".1.3.not-an-oid").is_err());
    }

    #[test]
    fn unknown_symbol_is_an_error() {
        let mib = Mib::from_text(SNIPPET);
        assert!(matches!(
            mib.resolve("upsNoSuchThing"),
            Err(ResolveError::UnknownSymbol(_))
        ));
    }

    #[test]
    fn forward_references_resolve_by_fixpoint() {
        let text = r#"
child OBJECT IDENTIFIER ::= { parent 2 }
parent OBJECT IDENTIFIER ::= { mib-2 40 }
"#;
        let mib = Mib::from_text(text);
        assert_eq!(mib.resolve("child").unwrap(), oid!(1, 3, 6, 1, 2, 1, 40, 2));
    }

    #[test]
    fn loads_shipped_ups_mib() {
        let dir = concat!(env!("CARGO_MANIFEST_DIR"), "/mibs");
        let mib = Mib::load_dir(dir).unwrap();
        for symbol in [
            "upsIdentManufacturer",
            "upsBatteryStatus",
            "upsAlarmsPresent",
            "upsAlarmId",
            "upsAlarmDescr",
            "upsAlarmTime",
            "upsAlarmLowBattery",
            "upsAlarmInputBad",
            "upsAlarmOutputOverload",
            "upsAlarmGeneralFault",
            "upsAlarmUpsSystemOff",
            "upsTrapAlarmEntryAdded",
            "upsTrapAlarmEntryRemoved",
            "upsConfigAudibleStatus",
            "upsTestId",
            "upsInputFrequency",
            "upsOutputPercentLoad",
        ] {
            assert!(mib.resolve(symbol).is_ok(), "missing {}", symbol);
        }
        assert_eq!(
            mib.resolve("upsAlarmId").unwrap(),
            oid!(1, 3, 6, 1, 2, 1, 33, 1, 6, 2, 1, 1)
        );
        assert_eq!(
            mib.resolve("upsAlarmLowBattery").unwrap(),
            oid!(1, 3, 6, 1, 2, 1, 33, 1, 6, 3, 3)
        );
    }
}
