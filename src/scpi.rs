//! SCPI token grammar shared by the controller and the simulator.
//!
//! Pure string handling: compound-command splitting, numeric argument
//! extraction from fixed offsets, and the instrument's response number
//! formats. No device state lives here.

/// Most LIST points the card's registers can hold.
pub const MAX_LIST_POINTS: usize = 1002;

/// Most LIST:SEQ indices the card's registers can hold.
pub const MAX_SEQ_POINTS: usize = 512;

/// Shortest programmable dwell, 500 µs.
pub const LIST_DWELL_MIN: f64 = 0.0005;

/// Longest programmable dwell, 10 s.
pub const LIST_DWELL_MAX: f64 = 10.0;

/// Which output quantity a command addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantity {
    Volt,
    Curr,
}

impl Quantity {
    /// Short-form SCPI mnemonic (`VOLT` / `CURR`).
    pub fn mnemonic(self) -> &'static str {
        match self {
            Quantity::Volt => "VOLT",
            Quantity::Curr => "CURR",
        }
    }
}

/// Split a raw line into individual command fragments.
///
/// Compound commands join segments with `;`, optionally prefixing the
/// follow-ups with `:` (`CMD1;:CMD2`). A single leading `:` is stripped,
/// fragments are trimmed and empty fragments dropped.
pub fn split_commands(raw: &str) -> Vec<&str> {
    raw.split(';')
        .map(|seg| {
            let seg = seg.trim();
            seg.strip_prefix(':').unwrap_or(seg).trim()
        })
        .filter(|seg| !seg.is_empty())
        .collect()
}

/// Extract a float argument starting at a fixed byte offset.
///
/// Returns `None` on missing or malformed numerics; the caller decides
/// whether that is ignorable or a protocol error.
pub fn parse_float(cmd: &str, offset: usize) -> Option<f64> {
    cmd.get(offset..)?.trim().parse().ok()
}

/// Extract an integer argument, tolerating float syntax (`3.0` → `3`) the
/// way the instrument does.
pub fn parse_int(cmd: &str, offset: usize) -> Option<i64> {
    let value: f64 = cmd.get(offset..)?.trim().parse().ok()?;
    Some(value as i64)
}

/// Extract a comma-separated float list starting at a fixed byte offset.
///
/// Empty tokens are skipped and parsing stops once `max_items` values have
/// been collected. Any malformed token poisons the whole list: an empty
/// vector comes back and the caller chooses how loudly to fail.
pub fn parse_float_list(cmd: &str, offset: usize, max_items: usize) -> Vec<f64> {
    let Some(payload) = cmd.get(offset..) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for token in payload.split(',') {
        if out.len() >= max_items {
            break;
        }
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        match token.parse() {
            Ok(v) => out.push(v),
            Err(_) => return Vec::new(),
        }
    }
    out
}

/// Integer variant of [`parse_float_list`], with the same tolerance for
/// float syntax as [`parse_int`].
pub fn parse_int_list(cmd: &str, offset: usize, max_items: usize) -> Vec<i64> {
    let Some(payload) = cmd.get(offset..) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for token in payload.split(',') {
        if out.len() >= max_items {
            break;
        }
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        match token.parse::<f64>() {
            Ok(v) => out.push(v as i64),
            Err(_) => return Vec::new(),
        }
    }
    out
}

/// Render a value the way the instrument prints setpoints and
/// measurements: C-style `%.6E` with a sign-carrying two-digit exponent
/// (`5.0` → `"5.000000E+00"`).
pub fn format_sci(value: f64) -> String {
    let s = format!("{:.6E}", value);
    match s.split_once('E') {
        Some((mantissa, exponent)) => {
            let (sign, digits) = match exponent.strip_prefix('-') {
                Some(digits) => ('-', digits),
                None => ('+', exponent),
            };
            format!("{mantissa}E{sign}{digits:0>2}")
        }
        None => s,
    }
}
