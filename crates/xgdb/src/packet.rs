//! Packet framing for the remote serial protocol.
//!
//! A packet is `$<payload>#<checksum>` where the checksum is the mod-256 sum of
//! the transmitted payload bytes as two hex digits. `$`, `#`, `}` and `*` inside
//! a payload are escaped as `}` followed by the byte XOR 0x20. Outside packets
//! the peer may send `+`/`-` acknowledgements and the raw interrupt byte 0x03.

/// Out-of-band "stop now" byte.
pub const INTERRUPT: u8 = 0x03;

/// Largest packet body accepted from the client (advertised via `qSupported`).
pub const MAX_PACKET_SIZE: usize = 0x1000;

const START: u8 = b'$';
const END: u8 = b'#';
const ESCAPE: u8 = b'}';
const ESCAPE_XOR: u8 = 0x20;

/// One decoded request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Command {
    pub verb: String,
    pub data: String,
    pub checksum: u8,
}

impl Command {
    /// Split a payload into verb and argument data.
    ///
    /// `q`, `Q` and `v` packets use a multi-letter verb running up to the first
    /// non-alphanumeric character (`qXfer`, `qfThreadInfo`, `vCont`). All other
    /// packets use their first character as the verb.
    #[must_use]
    pub fn parse(payload: &str, checksum: u8) -> Self {
        let split = match payload.as_bytes().first() {
            Some(b'q' | b'Q' | b'v') => payload
                .find(|c: char| !c.is_ascii_alphanumeric())
                .unwrap_or(payload.len()),
            Some(_) => payload.chars().next().map_or(0, char::len_utf8),
            None => 0,
        };
        let (verb, data) = payload.split_at(split);
        Self {
            verb: verb.to_owned(),
            data: data.to_owned(),
            checksum,
        }
    }

    /// Reassemble the payload.
    #[must_use]
    pub fn payload(&self) -> String {
        format!("{}{}", self.verb, self.data)
    }
}

/// Result of scanning the receive buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// A well-formed packet; acknowledge with `+` and dispatch it.
    Packet(Command),
    /// Checksum mismatch or malformed framing; answer `-` and drop it.
    Corrupt,
    /// The raw 0x03 byte.
    Interrupt,
    /// Client acknowledged our last packet.
    Ack,
    /// Client asks for our last packet again.
    Nack,
}

/// Mod-256 sum of `bytes`.
#[must_use]
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, &b| sum.wrapping_add(b))
}

const fn needs_escape(byte: u8) -> bool {
    matches!(byte, START | END | ESCAPE | b'*')
}

/// Frame `payload` as `$<payload>#<checksum>`.
#[must_use]
pub fn encode(payload: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 4);
    out.push(START);
    for &byte in payload.as_bytes() {
        if needs_escape(byte) {
            out.push(ESCAPE);
            out.push(byte ^ ESCAPE_XOR);
        } else {
            out.push(byte);
        }
    }
    let sum = checksum(&out[1..]);
    out.push(END);
    out.extend_from_slice(format!("{sum:02x}").as_bytes());
    out
}

/// Extract the first frame from `buf`.
///
/// Returns the frame (if a complete one is present) and the number of bytes
/// consumed. A partial packet yields `(None, n)` where `n` only covers noise
/// preceding it, so the caller keeps the partial bytes for the next read.
/// 0x03 is recognized here only between frames; [`PacketBuffer`] also lifts
/// it out of packet bodies.
#[must_use]
pub fn decode(buf: &[u8]) -> (Option<Frame>, usize) {
    for (pos, &byte) in buf.iter().enumerate() {
        match byte {
            INTERRUPT => return (Some(Frame::Interrupt), pos + 1),
            b'+' => return (Some(Frame::Ack), pos + 1),
            b'-' => return (Some(Frame::Nack), pos + 1),
            START => return decode_packet(buf, pos),
            _ => {}
        }
    }
    (None, buf.len())
}

fn decode_packet(buf: &[u8], start: usize) -> (Option<Frame>, usize) {
    let body_start = start + 1;
    let Some(offset) = buf[body_start..].iter().position(|&b| b == END) else {
        if buf.len() - body_start > MAX_PACKET_SIZE {
            return (Some(Frame::Corrupt), buf.len());
        }
        return (None, start);
    };
    let end = body_start + offset;
    if buf.len() < end + 3 {
        return (None, start);
    }
    let consumed = end + 3;
    let body = &buf[body_start..end];

    let Some(expected) = parse_hex_byte(&buf[end + 1..consumed]) else {
        return (Some(Frame::Corrupt), consumed);
    };
    if checksum(body) != expected {
        return (Some(Frame::Corrupt), consumed);
    }
    let payload = unescape(body).and_then(|bytes| String::from_utf8(bytes).ok());
    match payload {
        Some(payload) => (
            Some(Frame::Packet(Command::parse(&payload, expected))),
            consumed,
        ),
        None => (Some(Frame::Corrupt), consumed),
    }
}

fn unescape(body: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(body.len());
    let mut bytes = body.iter();
    while let Some(&byte) = bytes.next() {
        if byte == ESCAPE {
            out.push(bytes.next()? ^ ESCAPE_XOR);
        } else {
            out.push(byte);
        }
    }
    Some(out)
}

fn parse_hex_byte(digits: &[u8]) -> Option<u8> {
    match *digits {
        [hi, lo] => Some((hex_digit(hi)? << 4) | hex_digit(lo)?),
        _ => None,
    }
}

const fn hex_digit(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

/// Receive buffer that retains partial packets between reads.
#[derive(Debug, Default)]
pub struct PacketBuffer {
    buf: Vec<u8>,
}

impl PacketBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete frame, if any.
    ///
    /// No packet body carries a raw 0x03, so one found inside a packet that is
    /// still arriving (or just completed) is lifted out and reported first.
    pub fn next_frame(&mut self) -> Option<Frame> {
        let (frame, consumed) = decode(&self.buf);
        if frame != Some(Frame::Interrupt) {
            let scanned = if frame.is_some() { consumed } else { self.buf.len() };
            if let Some(pos) = self.buf[..scanned].iter().position(|&b| b == INTERRUPT) {
                self.buf.remove(pos);
                return Some(Frame::Interrupt);
            }
        }
        self.buf.drain(..consumed);
        frame
    }

    /// Bytes held back waiting for the rest of a packet.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

// ============================================================================
// Hex helpers
// ============================================================================

/// Lowercase hex rendering of `bytes`.
#[must_use]
pub fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Parse an even-length hex string into bytes.
#[must_use]
pub fn hex_decode(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 {
        return None;
    }
    text.as_bytes().chunks_exact(2).map(parse_hex_byte).collect()
}

/// Parse a hex number as sent by the client (digits only, no sign or `0x`).
#[must_use]
pub fn parse_hex(text: &str) -> Option<u64> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u64::from_str_radix(text, 16).ok()
}
