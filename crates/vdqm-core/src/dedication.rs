//! Dedication expression compiler and matcher.
//!
//! A dedication is an administrator-supplied restriction narrowing which
//! mount requests a drive may serve. The canonical form is exactly nine
//! comma-separated `name=value` fields in the fixed order
//! `uid,gid,name,host,vid,mode,datestr,timestr,age`, where each value is a
//! regular-expression fragment (`.*` meaning "any").
//!
//! Compilation opportunistically reduces the expression to field-level
//! comparisons plus a smaller fallback pattern:
//! - `.*` fields become wildcards and are dropped from the pattern;
//! - all-digit `uid`/`gid` values and `name` values resolving to a local
//!   account become exact comparisons, and stay in the pattern as well, so
//!   the pattern re-confirms what the fast path already checked;
//! - everything else stays in the pattern verbatim.
//!
//! Compilation is total: on any parsing anomaly the original string is kept
//! as the sole fallback pattern and no field is treated specially. A drive
//! whose dedication the optimizer cannot prove correct stays usable.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Local};
use regex::Regex;
use tracing::warn;

use vdqm_proto::constants::{VDQM_DEDICATE_FIELDS, VDQM_DEDICATE_FIELD_NAMES};
use vdqm_proto::VolumeRequest;

/// Lookup of local account names, used to detect fast-comparable `name`
/// fields at compile time.
pub trait AccountDirectory: Send + Sync {
    /// Return the canonical account name if `name` is a known local account.
    fn resolve(&self, name: &str) -> Option<String>;
}

/// A fixed account table.
#[derive(Debug, Default)]
pub struct StaticAccounts {
    names: HashSet<String>,
}

impl StaticAccounts {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }
}

impl AccountDirectory for StaticAccounts {
    fn resolve(&self, name: &str) -> Option<String> {
        self.names.get(name).cloned()
    }
}

/// Account directory loaded from the local passwd database.
#[derive(Debug, Default)]
pub struct SystemAccounts {
    names: HashSet<String>,
}

impl SystemAccounts {
    /// Read `/etc/passwd` once; a missing or unreadable file yields an
    /// empty directory (no `name` field is then fast-comparable).
    pub fn load() -> Self {
        let names = std::fs::read_to_string("/etc/passwd")
            .map(|data| {
                data.lines()
                    .filter_map(|line| line.split(':').next())
                    .filter(|name| !name.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();
        Self { names }
    }
}

impl AccountDirectory for SystemAccounts {
    fn resolve(&self, name: &str) -> Option<String> {
        self.names.get(name).cloned()
    }
}

/// The attributes of a mount request a dedication is evaluated against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountAttributes {
    pub uid: u32,
    pub gid: u32,
    /// Resolved account name of the requester
    pub name: String,
    /// Requesting client host
    pub host: String,
    /// Requested volume id
    pub vid: String,
    /// Access mode (0 = read, 1 = write)
    pub mode: i32,
    /// Current date, `%Y/%m/%d`
    pub datestr: String,
    /// Current time, `%H:%M:%S`
    pub timestr: String,
    /// Seconds since the request was submitted
    pub age: i64,
}

impl MountAttributes {
    /// Build the attributes of a queued volume request at wall-clock `now`.
    pub fn from_volume(vol: &VolumeRequest, now: DateTime<Local>) -> Self {
        Self {
            uid: vol.client_uid,
            gid: vol.client_gid,
            name: vol.client_name.clone(),
            host: vol.client_host.clone(),
            vid: vol.volid.clone(),
            mode: vol.mode,
            datestr: now.format("%Y/%m/%d").to_string(),
            timestr: now.format("%H:%M:%S").to_string(),
            age: (now.timestamp() - vol.recv_time).max(0),
        }
    }

    fn field_value(&self, index: usize) -> String {
        match index {
            0 => self.uid.to_string(),
            1 => self.gid.to_string(),
            2 => self.name.clone(),
            3 => self.host.clone(),
            4 => self.vid.clone(),
            5 => self.mode.to_string(),
            6 => self.datestr.clone(),
            7 => self.timestr.clone(),
            8 => self.age.to_string(),
            _ => unreachable!("dedication has exactly nine fields"),
        }
    }
}

/// The outcome of decomposing a well-formed nine-field expression.
struct Decomposition {
    wildcard: [bool; VDQM_DEDICATE_FIELDS],
    fast_uid: Option<u32>,
    fast_gid: Option<u32>,
    fast_name: Option<String>,
    pattern_src: String,
}

/// A compiled dedication, immutable once built.
///
/// Owned exclusively by its drive record and rebuilt whenever the
/// dedication string changes.
#[derive(Debug)]
pub struct DedicationExpression {
    raw: String,
    /// Whether decomposition into fields succeeded
    decomposed: bool,
    wildcard: [bool; VDQM_DEDICATE_FIELDS],
    fast_uid: Option<u32>,
    fast_gid: Option<u32>,
    fast_name: Option<String>,
    /// Operative fallback pattern; `None` when the pattern source is not a
    /// valid regex, in which case the fallback rejects everything
    pattern: Option<Regex>,
    pattern_src: String,
    /// Instrumentation: number of fallback-pattern evaluations
    fallback_evals: AtomicU64,
}

impl DedicationExpression {
    /// Compile an administrator string. Total: never fails. An empty
    /// string compiles to the undedicated expression that matches every
    /// request.
    pub fn compile(expr: &str, accounts: &dyn AccountDirectory) -> Self {
        if expr.is_empty() {
            return Self {
                raw: String::new(),
                decomposed: false,
                wildcard: [false; VDQM_DEDICATE_FIELDS],
                fast_uid: None,
                fast_gid: None,
                fast_name: None,
                pattern: None,
                pattern_src: String::new(),
                fallback_evals: AtomicU64::new(0),
            };
        }

        let (decomposed, wildcard, fast_uid, fast_gid, fast_name, pattern_src) =
            match Self::decompose(expr, accounts) {
                Some(d) => (
                    true,
                    d.wildcard,
                    d.fast_uid,
                    d.fast_gid,
                    d.fast_name,
                    d.pattern_src,
                ),
                // Unparseable: keep the original string as the sole pattern
                None => (
                    false,
                    [false; VDQM_DEDICATE_FIELDS],
                    None,
                    None,
                    None,
                    expr.to_owned(),
                ),
            };

        let pattern = match Regex::new(&pattern_src) {
            Ok(re) => Some(re),
            Err(e) => {
                // An unintelligible pattern must not widen the dedication
                // to match-everything; it rejects until the admin fixes it.
                warn!("dedication pattern '{}' does not compile: {}", pattern_src, e);
                None
            }
        };

        Self {
            raw: expr.to_owned(),
            decomposed,
            wildcard,
            fast_uid,
            fast_gid,
            fast_name,
            pattern,
            pattern_src,
            fallback_evals: AtomicU64::new(0),
        }
    }

    /// Walk the nine fields left to right. Any anomaly returns `None` and
    /// the caller falls back to the non-optimized form.
    fn decompose(expr: &str, accounts: &dyn AccountDirectory) -> Option<Decomposition> {
        let names = VDQM_DEDICATE_FIELD_NAMES;
        let mut wildcard = [false; VDQM_DEDICATE_FIELDS];
        let mut fast_uid = None;
        let mut fast_gid = None;
        let mut fast_name = None;
        let mut kept: Vec<String> = Vec::with_capacity(VDQM_DEDICATE_FIELDS);

        let first = format!("{}=", names[0]);
        let mut rest = expr.strip_prefix(first.as_str())?;

        for (i, name) in names.iter().enumerate() {
            // The value runs up to the next field's `,name=` delimiter;
            // the last field takes whatever remains.
            let value = if i + 1 < VDQM_DEDICATE_FIELDS {
                let delim = format!(",{}=", names[i + 1]);
                let at = rest.find(delim.as_str())?;
                let value = &rest[..at];
                rest = &rest[at + delim.len()..];
                value
            } else {
                rest
            };

            if value == ".*" {
                wildcard[i] = true;
                continue;
            }

            match i {
                0 | 1 => {
                    if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
                        if let Ok(id) = value.parse::<u32>() {
                            if i == 0 {
                                fast_uid = Some(id);
                            } else {
                                fast_gid = Some(id);
                            }
                        }
                    }
                }
                2 => {
                    if let Some(account) = accounts.resolve(value) {
                        fast_name = Some(account);
                    }
                }
                _ => {}
            }

            kept.push(format!("{}={}", name, value));
        }

        let pattern_src = kept.join(",");
        if pattern_src.is_empty() {
            // Every field wildcarded: a degenerate input, not a valid
            // "match nothing is wildcard" state
            return None;
        }

        Some(Decomposition {
            wildcard,
            fast_uid,
            fast_gid,
            fast_name,
            pattern_src,
        })
    }

    /// Whether this drive carries no dedication at all.
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// The administrator string this expression was compiled from.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Whether decomposition into field-level comparisons succeeded.
    pub fn is_decomposed(&self) -> bool {
        self.decomposed
    }

    /// Number of times the fallback pattern has been evaluated.
    pub fn fallback_evaluations(&self) -> u64 {
        self.fallback_evals.load(Ordering::Relaxed)
    }

    /// Evaluate the dedication against a request's attributes.
    ///
    /// Fast-comparable fields are checked first and short-circuit on any
    /// mismatch; otherwise the fallback pattern over the non-wildcard
    /// fields decides. Fast fields are re-confirmed by the pattern.
    pub fn matches(&self, attrs: &MountAttributes) -> bool {
        if self.is_empty() {
            return true;
        }

        if let Some(uid) = self.fast_uid {
            if attrs.uid != uid {
                return false;
            }
        }
        if let Some(gid) = self.fast_gid {
            if attrs.gid != gid {
                return false;
            }
        }
        if let Some(ref name) = self.fast_name {
            if attrs.name != *name {
                return false;
            }
        }

        let subject = self.match_subject(attrs);
        self.fallback_evals.fetch_add(1, Ordering::Relaxed);
        match self.pattern {
            Some(ref re) => re.is_match(&subject),
            None => false,
        }
    }

    /// Concatenation of the non-wildcard fields in fixed order, the string
    /// the fallback pattern is evaluated against.
    fn match_subject(&self, attrs: &MountAttributes) -> String {
        let mut parts = Vec::with_capacity(VDQM_DEDICATE_FIELDS);
        for (i, name) in VDQM_DEDICATE_FIELD_NAMES.iter().enumerate() {
            if self.decomposed && self.wildcard[i] {
                continue;
            }
            parts.push(format!("{}={}", name, attrs.field_value(i)));
        }
        parts.join(",")
    }
}
