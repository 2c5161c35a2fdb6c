use encoding_rs::{GBK, UTF_16LE, UTF_8};

/// Longest partial line [`LineAssembler`] holds before handing it out.
pub const MAX_LINE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextEncoding {
    #[default]
    Auto,
    Utf8,
    Utf16,
    Ascii,
    Gbk,
}

impl std::str::FromStr for TextEncoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_uppercase().as_str() {
            "AUTO" => Self::Auto,
            "UTF-8" | "UTF8" => Self::Utf8,
            "UTF-16" | "UTF16" => Self::Utf16,
            "ASCII" => Self::Ascii,
            "GBK" | "GB2312" => Self::Gbk,
            other => return Err(format!("unknown encoding: {other}")),
        })
    }
}

impl TextEncoding {
    pub fn decode(&self, bytes: &[u8]) -> String {
        match self {
            Self::Auto => detect_and_decode(bytes),
            Self::Utf8 => UTF_8.decode(bytes).0.into_owned(),
            Self::Utf16 => UTF_16LE.decode(bytes).0.into_owned(),
            Self::Ascii => bytes.iter().map(|&b| if b < 128 { b as char } else { '?' }).collect(),
            Self::Gbk => GBK.decode(bytes).0.into_owned(),
        }
    }
}

fn detect_and_decode(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return String::new();
    }

    if let Ok(s) = std::str::from_utf8(bytes) {
        return s.to_string();
    }

    let mut detector = chardetng::EncodingDetector::new();
    detector.feed(bytes, true);
    let encoding = detector.guess(None, true);

    encoding.decode(bytes).0.into_owned()
}

/// Turns a byte-at-a-time stream into decoded lines.
///
/// A line ends at `\n` (kept in the output) or when the buffer grows past
/// [`MAX_LINE`].
#[derive(Debug)]
pub struct LineAssembler {
    encoding: TextEncoding,
    buf: Vec<u8>,
}

impl LineAssembler {
    pub fn new(encoding: TextEncoding) -> Self {
        Self {
            encoding,
            buf: Vec::new(),
        }
    }

    pub fn push(&mut self, byte: u8) -> Option<String> {
        self.buf.push(byte);
        if byte == b'\n' || self.buf.len() > MAX_LINE {
            self.flush()
        } else {
            None
        }
    }

    /// Hands out whatever is buffered, even without a line ending.
    pub fn flush(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let line = self.encoding.decode(&self.buf);
        self.buf.clear();
        Some(line)
    }

    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}
