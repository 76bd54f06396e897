use anyhow::{anyhow, bail};
use bytes_varint::{VarIntSupport, VarIntSupportMut};


macro_rules! try_read_impl {
    ($try_reader: ident, $ty:ty, $getter: ident) => {
        fn $try_reader(&mut self) -> anyhow::Result<$ty> {
            if self.remaining() < std::mem::size_of::<$ty>() {
                bail!("buffer underflow");
            }
            Ok(self.$getter())
        }
    }
}

/// Bounds-checked reading, returning errors instead of panicking on truncated input
pub trait BufExt: bytes::Buf + VarIntSupport {
    try_read_impl!(try_read_u8, u8, get_u8);
    try_read_impl!(try_read_i32_le, i32, get_i32_le);

    fn try_read_bytes(&mut self, len: usize) -> anyhow::Result<Vec<u8>> {
        if self.remaining() < len {
            bail!("buffer underflow: expected {} bytes, {} remaining", len, self.remaining());
        }
        let mut result = vec![0u8; len];
        self.copy_to_slice(&mut result);
        Ok(result)
    }

    /// a string prefixed with its UTF-8 length as an unsigned LEB128 varint
    fn try_read_string(&mut self) -> anyhow::Result<String> {
        let len = self.try_get_usize_varint()
            .map_err(|e| anyhow!("invalid string length prefix: {:?}", e))?;
        let raw = self.try_read_bytes(len)?;
        Ok(String::from_utf8(raw)?)
    }
}

pub trait BufMutExt: bytes::BufMut + VarIntSupportMut {
    fn put_string(&mut self, s: &str) {
        self.put_usize_varint(s.len());
        self.put_slice(s.as_bytes());
    }
}


impl <T: bytes::Buf> BufExt for T {
}

impl <T: bytes::BufMut> BufMutExt for T {
}


#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    #[rstest]
    #[case::empty("", vec![0])]
    #[case::ascii("abc", vec![3, b'a', b'b', b'c'])]
    #[case::umlaut("ä", vec![2, 0xc3, 0xa4])]
    fn test_put_string(#[case] s: &str, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        buf.put_string(s);
        assert_eq!(buf.as_ref(), expected.as_slice());

        let mut b: &[u8] = &expected;
        assert_eq!(b.try_read_string().unwrap(), s);
        assert!(b.is_empty());
    }

    #[test]
    fn test_put_string_long_prefix() {
        let s = "x".repeat(200);
        let mut buf = BytesMut::new();
        buf.put_string(&s);
        assert_eq!(&buf[..2], &[0xc8, 0x01]);
        assert_eq!(buf.len(), 202);
    }

    #[rstest]
    #[case::missing_bytes(vec![3, b'a'])]
    #[case::missing_prefix(vec![])]
    #[case::invalid_utf8(vec![1, 0xff])]
    fn test_try_read_string_invalid(#[case] raw: Vec<u8>) {
        let mut b: &[u8] = &raw;
        assert!(b.try_read_string().is_err());
    }

    #[test]
    fn test_try_read_i32_le_underflow() {
        let mut b: &[u8] = &[1, 2, 3];
        assert!(b.try_read_i32_le().is_err());

        let mut b: &[u8] = &[1, 2, 0, 0];
        assert_eq!(b.try_read_i32_le().unwrap(), 0x0201);
    }
}
