/// Parser for strace `write` lines.
///
/// Grammar (anything after the return value is ignored, e.g. `-T` timings):
///
/// ```text
/// [pid N] write(<fd>, "<escaped payload>"[...], <len>) = <ret> ...
/// ```
///
/// A failed write whose buffer strace printed as an address (`NULL`,
/// `0x...`) is accepted too, with an empty payload.
///
/// Lines without the `write(` marker are not trace output for this tool and
/// yield `Ok(None)`. Lines with the marker that don't fit the grammar are
/// errors so the caller can skip and warn instead of relaying garbage.
use regex::Regex;
use std::sync::LazyLock;

const MARKER: &str = "write(";

static HEAD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^(?:\[pid\s+\d+\]\s+)?write\((\d+), ""#).unwrap());

/// `write(1, NULL, 5)` or `write(1, 0x7ffd1234, 5)`: strace couldn't read the buffer.
static UNREADABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:\[pid\s+\d+\]\s+)?write\((\d+), (?:NULL|0x[0-9a-fA-F]+), (\d+)\)\s+=\s+(\S+)(?:\s+(\S+))?")
        .unwrap()
});

static TAIL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\.\.\.)?, (\d+)\)\s+=\s+(\S+)(?:\s+(\S+))?").unwrap());

/// Outcome of the traced call as reported after `=`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallResult {
    /// Bytes the kernel accepted.
    Written(usize),
    /// Call failed or was interrupted for a restart; holds the errno name
    /// (e.g. `EAGAIN`, `ERESTARTSYS`) when strace printed one. A restarted
    /// call shows up again once the kernel reissues it.
    Failed(String),
    /// strace printed a bare `?` (process exited mid-call).
    Unknown,
}

/// One decoded `write` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteCall {
    pub fd: u32,
    pub payload: Vec<u8>,
    /// Buffer length argument as passed by the tracee.
    pub length: usize,
    /// strace cut the payload at its string limit.
    pub truncated: bool,
    pub result: CallResult,
}

impl WriteCall {
    pub fn succeeded(&self) -> bool {
        !matches!(self.result, CallResult::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Marker present but the line doesn't start with `write(<fd>, "`, or
    /// an address-only buffer on a call that didn't fail.
    MissingHead,
    /// No closing quote before end of line.
    Unterminated,
    BadEscape { offset: usize, escape: String },
    /// Nothing parseable after the closing quote.
    MissingTail,
    BadNumber(String),
    /// `<unfinished ...>` split call; the payload is incomplete.
    Unfinished,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::MissingHead => write!(f, "line does not start with a write call"),
            ParseError::Unterminated => write!(f, "unterminated payload string"),
            ParseError::BadEscape { offset, escape } => {
                write!(f, "invalid escape \\{escape} at byte {offset}")
            }
            ParseError::MissingTail => write!(f, "missing length and return value"),
            ParseError::BadNumber(s) => write!(f, "invalid number: {s}"),
            ParseError::Unfinished => write!(f, "unfinished call"),
        }
    }
}

impl std::error::Error for ParseError {}

/// Parse one line of tracer output.
pub fn parse_line(line: &str) -> Result<Option<WriteCall>, ParseError> {
    let line = line.trim();
    if !line.contains(MARKER) {
        return Ok(None);
    }

    let Some(head) = HEAD.captures(line) else {
        return parse_unreadable(line);
    };
    let fd = parse_number::<u32>(&head[1])?;
    let body_start = head.get(0).map_or(0, |m| m.end());

    let (payload, consumed) = decode_payload(&line[body_start..], body_start)?;
    let rest = &line[body_start + consumed..];

    if rest.contains("<unfinished ...>") {
        return Err(ParseError::Unfinished);
    }

    let tail = TAIL.captures(rest).ok_or(ParseError::MissingTail)?;
    let truncated = tail.get(1).is_some();
    let length = parse_number::<usize>(&tail[2])?;
    let result = parse_result(&tail[3], tail.get(4).map(|m| m.as_str()))?;

    Ok(Some(WriteCall {
        fd,
        payload,
        length,
        truncated,
        result,
    }))
}

fn parse_number<T: std::str::FromStr>(s: &str) -> Result<T, ParseError> {
    s.parse().map_err(|_| ParseError::BadNumber(s.to_string()))
}

/// A write whose buffer strace printed as an address. Only failed calls
/// are accepted: there is nothing to relay for a successful one.
fn parse_unreadable(line: &str) -> Result<Option<WriteCall>, ParseError> {
    let caps = UNREADABLE.captures(line).ok_or(ParseError::MissingHead)?;
    let result = parse_result(&caps[3], caps.get(4).map(|m| m.as_str()))?;
    if !matches!(result, CallResult::Failed(_)) {
        return Err(ParseError::MissingHead);
    }
    Ok(Some(WriteCall {
        fd: parse_number(&caps[1])?,
        payload: Vec::new(),
        length: parse_number(&caps[2])?,
        truncated: false,
        result,
    }))
}

fn parse_result(ret: &str, errno: Option<&str>) -> Result<CallResult, ParseError> {
    if ret == "?" {
        return Ok(match errno {
            Some(e) if e.starts_with("ERESTART") => CallResult::Failed(e.to_string()),
            _ => CallResult::Unknown,
        });
    }
    let value = parse_number::<i64>(ret)?;
    if value < 0 {
        return Ok(CallResult::Failed(errno.unwrap_or_default().to_string()));
    }
    usize::try_from(value)
        .map(CallResult::Written)
        .map_err(|_| ParseError::BadNumber(ret.to_string()))
}

/// Decode an escaped C string body up to its closing quote.
///
/// `s` starts just after the opening quote. Returns the raw bytes and the
/// number of input bytes consumed, closing quote included. `base` is only
/// used to report offsets relative to the whole line.
fn decode_payload(s: &str, base: usize) -> Result<(Vec<u8>, usize), ParseError> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'"' => return Ok((out, i + 1)),
            b'\\' => {
                let escape_at = i;
                let Some(&c) = bytes.get(i + 1) else {
                    return Err(ParseError::Unterminated);
                };
                i += 2;
                let decoded = match c {
                    b'n' => b'\n',
                    b't' => b'\t',
                    b'r' => b'\r',
                    b'v' => 0x0b,
                    b'f' => 0x0c,
                    b'a' => 0x07,
                    b'b' => 0x08,
                    b'\\' | b'"' | b'\'' => c,
                    b'0'..=b'7' => {
                        let end = digits_end(bytes, i - 1, 3, |b| (b'0'..=b'7').contains(&b));
                        let digits = &s[i - 1..end];
                        i = end;
                        u8::from_str_radix(digits, 8).map_err(|_| ParseError::BadEscape {
                            offset: base + escape_at,
                            escape: digits.to_string(),
                        })?
                    }
                    b'x' => {
                        let end = digits_end(bytes, i, 2, |b| b.is_ascii_hexdigit());
                        if end == i {
                            return Err(ParseError::BadEscape {
                                offset: base + escape_at,
                                escape: "x".to_string(),
                            });
                        }
                        let digits = &s[i..end];
                        i = end;
                        u8::from_str_radix(digits, 16).map_err(|_| ParseError::BadEscape {
                            offset: base + escape_at,
                            escape: format!("x{digits}"),
                        })?
                    }
                    other => {
                        return Err(ParseError::BadEscape {
                            offset: base + escape_at,
                            escape: String::from_utf8_lossy(&[other]).into_owned(),
                        })
                    }
                };
                out.push(decoded);
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }

    Err(ParseError::Unterminated)
}

/// Index one past the last of at most `max` digits starting at `start`.
fn digits_end(bytes: &[u8], start: usize, max: usize, is_digit: impl Fn(u8) -> bool) -> usize {
    let mut end = start;
    while end < bytes.len() && end - start < max && is_digit(bytes[end]) {
        end += 1;
    }
    end
}
