//! Checksum framing
//!
//! A framed line is `N<line> <message> *<checksum>\n`, the checksum being the
//! XOR of every byte from `N` up to and including the space before `*`.
//! Unframed lines are the message followed by a newline.

/// XOR of all bytes
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, byte| acc ^ byte)
}

/// Render an unframed payload
pub fn render_plain(message: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(message.len() + 1);
    payload.extend_from_slice(message.as_bytes());
    payload.push(b'\n');
    payload
}

/// Render a checksum-framed payload for `line_number`
pub fn render_framed(message: &str, line_number: u64) -> Vec<u8> {
    let mut payload = format!("N{} {} ", line_number, message).into_bytes();
    let sum = checksum(&payload);
    payload.extend_from_slice(format!("*{}\n", sum).as_bytes());
    payload
}

/// A checksum-framed line taken apart
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramedLine {
    /// Line number
    pub line_number: u64,
    /// Message between the line number and the checksum marker
    pub message: String,
    /// Checksum as transmitted
    pub checksum: u8,
}

impl FramedLine {
    /// Whether the transmitted checksum matches the framed bytes
    pub fn is_valid(&self) -> bool {
        checksum(format!("N{} {} ", self.line_number, self.message).as_bytes()) == self.checksum
    }
}

/// Parse a framed payload, with or without the trailing newline
///
/// Returns `None` when the payload is not checksum-framed.
pub fn parse_framed(payload: &[u8]) -> Option<FramedLine> {
    let text = std::str::from_utf8(payload).ok()?;
    let text = text.strip_suffix('\n').unwrap_or(text);
    let rest = text.strip_prefix('N')?;
    let (number, rest) = rest.split_once(' ')?;
    let (message, sum) = rest.rsplit_once(" *")?;
    Some(FramedLine {
        line_number: number.parse().ok()?,
        message: message.to_string(),
        checksum: sum.parse().ok()?,
    })
}
