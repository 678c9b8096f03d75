//! Discovery rule and service check model.

use std::fmt;
use std::time::Duration;

use crate::store::ItemKind;

pub type RuleId = u64;
pub type CheckId = u64;

/// Status of a probed service, and of a discovered host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceStatus {
    Up,
    Down,
}

/// Service check protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckType {
    Icmp,
    Tcp,
    Smtp,
    Ftp,
    Pop,
    Nntp,
    Imap,
    Http,
    Https,
    Ssh,
    Telnet,
    Ldap,
    SnmpV1,
    SnmpV2c,
    SnmpV3,
    Agent,
}

impl CheckType {
    /// Checks probed by a batched range sweep inside a single worker.
    /// Everything else runs one probe per `(address, port)` pair.
    pub fn is_batched(self) -> bool {
        matches!(
            self,
            CheckType::Icmp
                | CheckType::Http
                | CheckType::Https
                | CheckType::SnmpV1
                | CheckType::SnmpV2c
                | CheckType::SnmpV3
        )
    }

    pub fn is_snmp(self) -> bool {
        matches!(self, CheckType::SnmpV1 | CheckType::SnmpV2c | CheckType::SnmpV3)
    }

    /// Which global timeout class applies to this check.
    pub(crate) fn timeout_kind(self) -> ItemKind {
        match self {
            CheckType::Agent => ItemKind::Agent,
            t if t.is_snmp() => ItemKind::Snmp,
            _ => ItemKind::Simple,
        }
    }

    /// Default probe port used when the check carries no port expression.
    pub fn default_port(self) -> u16 {
        match self {
            CheckType::Icmp => 0,
            CheckType::Tcp => 0,
            CheckType::Smtp => 25,
            CheckType::Ftp => 21,
            CheckType::Pop => 110,
            CheckType::Nntp => 119,
            CheckType::Imap => 143,
            CheckType::Http => 80,
            CheckType::Https => 443,
            CheckType::Ssh => 22,
            CheckType::Telnet => 23,
            CheckType::Ldap => 389,
            CheckType::SnmpV1 | CheckType::SnmpV2c | CheckType::SnmpV3 => 161,
            CheckType::Agent => 10050,
        }
    }
}

impl fmt::Display for CheckType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CheckType::Icmp => "ICMP ping",
            CheckType::Tcp => "TCP",
            CheckType::Smtp => "SMTP",
            CheckType::Ftp => "FTP",
            CheckType::Pop => "POP",
            CheckType::Nntp => "NNTP",
            CheckType::Imap => "IMAP",
            CheckType::Http => "HTTP",
            CheckType::Https => "HTTPS",
            CheckType::Ssh => "SSH",
            CheckType::Telnet => "Telnet",
            CheckType::Ldap => "LDAP",
            CheckType::SnmpV1 => "SNMPv1",
            CheckType::SnmpV2c => "SNMPv2c",
            CheckType::SnmpV3 => "SNMPv3",
            CheckType::Agent => "Zabbix agent",
        };
        f.write_str(name)
    }
}

/// SNMPv3 USM security level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SnmpV3Level {
    #[default]
    NoAuthNoPriv,
    AuthNoPriv,
    AuthPriv,
}

/// SNMPv3 authentication material carried by a check.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SnmpV3Auth {
    pub security_name: String,
    pub context_name: String,
    pub security_level: SnmpV3Level,
    pub auth_protocol: String,
    pub auth_passphrase: String,
    pub priv_protocol: String,
    pub priv_passphrase: String,
}

/// A single service probe definition within a rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Check {
    pub dcheckid: CheckId,
    pub kind: CheckType,
    /// Port expression, e.g. `"80,8000-8005"`.  Empty means the protocol
    /// default port.
    pub ports: String,
    /// Agent item key or SNMP OID for checks that carry one.
    pub key: String,
    pub snmp_community: String,
    pub snmpv3: Option<SnmpV3Auth>,
    /// Resolved per cycle from the global per-type timeouts.
    pub timeout: Duration,
    pub allow_redirect: bool,
    /// Marks the check whose value determines host identity.
    pub uniq: bool,
}

impl Check {
    pub fn new(dcheckid: CheckId, kind: CheckType) -> Self {
        Self {
            dcheckid,
            kind,
            ports: String::new(),
            key: String::new(),
            snmp_community: String::new(),
            snmpv3: None,
            timeout: Duration::from_secs(3),
            allow_redirect: false,
            uniq: false,
        }
    }

    pub fn with_ports(mut self, ports: &str) -> Self {
        self.ports = ports.to_string();
        self
    }

    pub fn with_key(mut self, key: &str) -> Self {
        self.key = key.to_string();
        self
    }

    /// Parsed port ranges; falls back to the protocol default port when the
    /// expression is empty or yields nothing usable.
    pub(crate) fn port_ranges(&self) -> Vec<(u16, u16)> {
        let mut out = parse_port_ranges(&self.ports);
        if out.is_empty() {
            out.push((self.default_port(), self.default_port()));
        }
        out
    }

    pub(crate) fn default_port(&self) -> u16 {
        self.kind.default_port()
    }

    pub(crate) fn ports_count(&self) -> u64 {
        self.port_ranges()
            .iter()
            .map(|(from, to)| u64::from(*to) - u64::from(*from) + 1)
            .sum()
    }
}

/// A discovery rule: ranges, checks and scheduling policy.  Immutable within
/// a cycle; `revision` changes invalidate in-flight work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub druleid: RuleId,
    pub revision: u64,
    pub name: String,
    /// Update interval expression with a time suffix, possibly containing
    /// user macros; resolved per cycle.
    pub delay: String,
    /// Textual range list, e.g. `"192.168.1.1-254,10.0.0.0/24"`.
    pub ipranges: String,
    pub checks: Vec<Check>,
    /// Maximum workers a cycle of this rule may occupy; 0 means unbounded.
    pub concurrency: usize,
}

impl Rule {
    /// The check designated to determine host identity: the first one with
    /// its `uniq` flag set, 0 when none is flagged.
    pub fn unique_check_id(&self) -> CheckId {
        self.checks
            .iter()
            .find(|c| c.uniq)
            .map(|c| c.dcheckid)
            .unwrap_or(0)
    }
}

/// Parses `"n"`/`"n-m"` comma-separated port ranges.  Malformed pieces are
/// ignored; out-of-order bounds are rejected.
pub(crate) fn parse_port_ranges(expr: &str) -> Vec<(u16, u16)> {
    let mut out = Vec::new();
    for piece in expr.split(',') {
        let piece = piece.trim();
        if piece.is_empty() {
            continue;
        }
        let range = match piece.split_once('-') {
            Some((from, to)) => from
                .trim()
                .parse::<u16>()
                .ok()
                .zip(to.trim().parse::<u16>().ok()),
            None => piece.parse::<u16>().ok().map(|p| (p, p)),
        };
        match range {
            Some((from, to)) if from <= to => out.push((from, to)),
            _ => continue,
        }
    }
    out
}

/// Parses a time expression with an optional `s`/`m`/`h`/`d`/`w` suffix into
/// seconds.  Bare digits are seconds.
pub fn parse_time_suffix(text: &str) -> Option<u64> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    let (digits, mult) = match text.char_indices().last() {
        Some((idx, c)) if c.is_ascii_alphabetic() => {
            let mult = match c {
                's' => 1,
                'm' => 60,
                'h' => 3600,
                'd' => 86_400,
                'w' => 604_800,
                _ => return None,
            };
            (&text[..idx], mult)
        }
        _ => (text, 1),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse::<u64>().ok().and_then(|n| n.checked_mul(mult))
}

/// Validates a per-item timeout expression; the accepted window is
/// 1 to 600 seconds.
pub(crate) fn validate_item_timeout(text: &str) -> Result<Duration, String> {
    match parse_time_suffix(text) {
        Some(secs) if (1..=600).contains(&secs) => Ok(Duration::from_secs(secs)),
        Some(secs) => Err(format!("timeout \"{secs}\" out of range 1-600s")),
        None => Err(format!("invalid timeout expression \"{text}\"")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn time_suffix_parsing() {
        assert_eq!(parse_time_suffix("30"), Some(30));
        assert_eq!(parse_time_suffix("30s"), Some(30));
        assert_eq!(parse_time_suffix("5m"), Some(300));
        assert_eq!(parse_time_suffix("1h"), Some(3600));
        assert_eq!(parse_time_suffix("2d"), Some(172_800));
        assert_eq!(parse_time_suffix("1w"), Some(604_800));
        assert_eq!(parse_time_suffix("abc"), None);
        assert_eq!(parse_time_suffix(""), None);
        assert_eq!(parse_time_suffix("10x"), None);
        assert_eq!(parse_time_suffix("-5s"), None);
    }

    #[test]
    fn item_timeout_window() {
        assert_eq!(validate_item_timeout("3s"), Ok(Duration::from_secs(3)));
        assert_eq!(validate_item_timeout("600"), Ok(Duration::from_secs(600)));
        assert!(validate_item_timeout("0").is_err());
        assert!(validate_item_timeout("601s").is_err());
        assert!(validate_item_timeout("soon").is_err());
    }

    #[test]
    fn port_ranges() {
        assert_eq!(parse_port_ranges("22"), vec![(22, 22)]);
        assert_eq!(parse_port_ranges("80,8000-8005"), vec![(80, 80), (8000, 8005)]);
        assert_eq!(parse_port_ranges("9-5"), vec![]);
        assert_eq!(parse_port_ranges("x,443"), vec![(443, 443)]);
    }

    #[test]
    fn check_port_defaults() {
        let check = Check::new(1, CheckType::Https);
        assert_eq!(check.port_ranges(), vec![(443, 443)]);
        assert_eq!(check.ports_count(), 1);

        let check = Check::new(2, CheckType::Tcp).with_ports("1-3,10");
        assert_eq!(check.ports_count(), 4);
    }

    #[test]
    fn unique_check_is_first_flagged() {
        let mut a = Check::new(11, CheckType::Tcp);
        let mut b = Check::new(12, CheckType::Agent);
        b.uniq = true;
        let mut c = Check::new(13, CheckType::Agent);
        c.uniq = true;
        let rule = Rule {
            druleid: 1,
            revision: 1,
            name: "lan".into(),
            delay: "1h".into(),
            ipranges: "192.168.0.1".into(),
            checks: vec![a.clone(), b, c],
            concurrency: 0,
        };
        assert_eq!(rule.unique_check_id(), 12);

        a.uniq = false;
        let rule = Rule { checks: vec![a], ..rule };
        assert_eq!(rule.unique_check_id(), 0);
    }
}
