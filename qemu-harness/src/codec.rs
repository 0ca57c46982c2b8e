//! Framing of guest output into lines.

use std::io;

use tokio_util::{bytes::BytesMut, codec::Decoder};

/// Splits a byte stream on `\n` and yields each line without its `\n` or a
/// trailing `\r`.
///
/// Bytes that are not UTF-8 are replaced with U+FFFD rather than failing the
/// read. A partial line stays in the frame buffer until its newline arrives.
#[derive(Debug, Default)]
pub(crate) struct ConsoleLineCodec {
    // Bytes before this offset are known not to contain a newline.
    next_index: usize,
}

impl Decoder for ConsoleLineCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<String>> {
        let Some(offset) = buf[self.next_index..].iter().position(|b| *b == b'\n') else {
            self.next_index = buf.len();
            return Ok(None);
        };
        let line = buf.split_to(self.next_index + offset + 1);
        self.next_index = 0;
        Ok(Some(decode_line(&line)))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> io::Result<Option<String>> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }
        self.next_index = 0;
        if buf.is_empty() {
            return Ok(None);
        }
        let line = buf.split_to(buf.len());
        Ok(Some(decode_line(&line)))
    }
}

fn decode_line(line: &[u8]) -> String {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn partial_line_waits_for_its_newline() {
        let mut codec = ConsoleLineCodec::default();
        let mut buf = BytesMut::from(&b"hel"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"lo\r\nnext");
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("hello"));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(&buf[..], b"next");
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let mut codec = ConsoleLineCodec::default();
        let mut buf = BytesMut::from(&b"boot \xff noise\n"[..]);
        assert_eq!(
            codec.decode(&mut buf).unwrap().as_deref(),
            Some("boot \u{FFFD} noise")
        );
    }

    #[test]
    fn unterminated_tail_is_flushed_at_eof() {
        let mut codec = ConsoleLineCodec::default();
        let mut buf = BytesMut::from(&b"/ # "[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(codec.decode_eof(&mut buf).unwrap().as_deref(), Some("/ # "));
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
    }
}
