// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Framing for the two monitor protocol variants.
//!
//! The structured variant exchanges newline-delimited JSON objects; the
//! human variant exchanges free-form text where a response is everything
//! accumulated up to the next `(qemu) ` prompt. Both codecs surface framing
//! failures as [`MonitorError`] so callers see a single error taxonomy.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::MonitorError;

/// The sentinel the human monitor prints when it is ready for the next
/// command. The monitor never emits it inside command output.
pub(crate) const PROMPT: &[u8] = b"(qemu) ";

/// Newline-delimited JSON framing for the structured protocol variant.
#[derive(Debug, Default)]
pub(crate) struct StructuredCodec;

impl Decoder for StructuredCodec {
    type Item = serde_json::Value;
    type Error = MonitorError;

    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        while let Some(pos) = src.iter().position(|&b| b == b'\n') {
            let line = src.split_to(pos + 1);
            let line = &line[..line.len() - 1];
            let line = std::str::from_utf8(line)
                .map_err(|e| {
                    MonitorError::Protocol(format!(
                        "non-UTF8 data on structured monitor: {e}"
                    ))
                })?
                .trim();
            if line.is_empty() {
                continue;
            }

            let value = serde_json::from_str(line).map_err(|e| {
                MonitorError::Protocol(format!(
                    "undecodable structured message ({e}): {line}"
                ))
            })?;
            return Ok(Some(value));
        }

        Ok(None)
    }
}

impl Encoder<serde_json::Value> for StructuredCodec {
    type Error = MonitorError;

    fn encode(
        &mut self,
        item: serde_json::Value,
        dst: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        let serialized = serde_json::to_vec(&item).map_err(|e| {
            MonitorError::Protocol(format!("unencodable request: {e}"))
        })?;
        dst.reserve(serialized.len() + 1);
        dst.put_slice(&serialized);
        dst.put_u8(b'\n');
        Ok(())
    }
}

/// Prompt-delimited framing for the human protocol variant. A frame is the
/// text accumulated since the previous prompt, with the terminating prompt
/// stripped.
#[derive(Debug, Default)]
pub(crate) struct PromptCodec;

impl Decoder for PromptCodec {
    type Item = String;
    type Error = MonitorError;

    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        let Some(pos) = find_prompt(src) else {
            return Ok(None);
        };

        let frame = src.split_to(pos);
        src.advance(PROMPT.len());
        let text = String::from_utf8_lossy(&frame).into_owned();
        Ok(Some(text))
    }
}

impl Encoder<String> for PromptCodec {
    type Error = MonitorError;

    fn encode(
        &mut self,
        item: String,
        dst: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        dst.reserve(item.len() + 1);
        dst.put_slice(item.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}

fn find_prompt(buf: &BytesMut) -> Option<usize> {
    buf.windows(PROMPT.len()).position(|w| w == PROMPT)
}


#[cfg(test)]
mod prompt_codec_tests {
    use super::*;

    #[test]
    fn greeting_frame_ends_at_prompt() {
        let mut codec = PromptCodec;
        let mut buf = BytesMut::from(
            &b"QEMU 8.2 monitor - type 'help' for more information\r\n(qemu) "
                [..],
        );
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert!(frame.starts_with("QEMU 8.2 monitor"));
        assert!(buf.is_empty());
    }

    #[test]
    fn output_accumulates_until_prompt() {
        let mut codec = PromptCodec;
        let mut buf = BytesMut::from(&b"info migrate\r\nMigration "[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.put_slice(b"status: completed\r\n(qemu) ");
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert!(frame.contains("Migration status: completed"));
    }

    #[test]
    fn consecutive_frames() {
        let mut codec = PromptCodec;
        let mut buf = BytesMut::from(&b"one\r\n(qemu) two\r\n(qemu) "[..]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "one\r\n");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "two\r\n");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }
}
