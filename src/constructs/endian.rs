use bytes::Buf;

/// Byte order of a file section, detected from its magic number.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Endianness {
    Little,
    Big,
}
impl Endianness {
    /// Detects the byte order whose decoding of `bytes` equals `magic`.
    ///
    /// Returns `None` when neither order matches.
    pub fn detect(bytes: [u8; 4], magic: u32) -> Option<Self> {
        if u32::from_le_bytes(bytes) == magic {
            Some(Self::Little)
        } else if u32::from_be_bytes(bytes) == magic {
            Some(Self::Big)
        } else {
            None
        }
    }

    /// Converts a value read in native order from bytes stored in this order.
    pub(crate) fn u16(self, v: u16) -> u16 {
        match self {
            Self::Little => u16::from_le(v),
            Self::Big => u16::from_be(v),
        }
    }

    pub(crate) fn u32(self, v: u32) -> u32 {
        match self {
            Self::Little => u32::from_le(v),
            Self::Big => u32::from_be(v),
        }
    }

    pub(crate) fn u64(self, v: u64) -> u64 {
        match self {
            Self::Little => u64::from_le(v),
            Self::Big => u64::from_be(v),
        }
    }

    pub(crate) fn f64(self, v: f64) -> f64 {
        f64::from_bits(self.u64(v.to_bits()))
    }
}

/// Bounds-checked field cursor for variable-layout sections.
///
/// Every getter returns `None` instead of panicking when the remaining input
/// is too short, so callers decide whether a short read is structural or
/// block-level corruption.
pub(crate) struct FieldReader<'a> {
    buf: &'a [u8],
    endianness: Endianness,
}
impl<'a> FieldReader<'a> {
    pub fn new(buf: &'a [u8], endianness: Endianness) -> Self {
        Self { buf, endianness }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub fn u8(&mut self) -> Option<u8> {
        (self.buf.remaining() >= 1).then(|| self.buf.get_u8())
    }

    pub fn u16(&mut self) -> Option<u16> {
        (self.buf.remaining() >= 2).then(|| match self.endianness {
            Endianness::Little => self.buf.get_u16_le(),
            Endianness::Big => self.buf.get_u16(),
        })
    }

    pub fn u32(&mut self) -> Option<u32> {
        (self.buf.remaining() >= 4).then(|| match self.endianness {
            Endianness::Little => self.buf.get_u32_le(),
            Endianness::Big => self.buf.get_u32(),
        })
    }

    pub fn u64(&mut self) -> Option<u64> {
        (self.buf.remaining() >= 8).then(|| match self.endianness {
            Endianness::Little => self.buf.get_u64_le(),
            Endianness::Big => self.buf.get_u64(),
        })
    }

    pub fn f32(&mut self) -> Option<f32> {
        (self.buf.remaining() >= 4).then(|| match self.endianness {
            Endianness::Little => self.buf.get_f32_le(),
            Endianness::Big => self.buf.get_f32(),
        })
    }

    /// Borrows the next `len` bytes.
    pub fn bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.buf.len() < len {
            return None;
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Some(head)
    }

    /// Borrows bytes up to the next NUL and consumes the NUL itself.
    pub fn cstr(&mut self) -> Option<&'a [u8]> {
        let nul = self.buf.iter().position(|&b| b == 0)?;
        let text = &self.buf[..nul];
        self.buf = &self.buf[nul + 1..];
        Some(text)
    }
}
