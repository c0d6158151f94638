//! Relay wire format.
//!
//! Every relayed share travels as a three-frame message:
//! frame 0 the topic (UTF-8 pool id), frame 1 a 4-byte flags word,
//! frame 2 the payload. The low flag bits select the payload encoding:
//! camelCase JSON or the field-tagged compact binary defined here.
//! Frames are length-prefixed (u32 big-endian) on the stream.

use anyhow::{anyhow, bail, Result};
use chrono::TimeZone;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::shares::Share;

pub const WIRE_FORMAT_MASK: u32 = 0xF;
pub const WIRE_FORMAT_JSON: u32 = 1;
pub const WIRE_FORMAT_BINARY: u32 = 2;

/// Upper bound on any single frame.
const MAX_FRAME: u32 = 1 << 20;

mod tag {
    pub const POOL_ID: u8 = 1;
    pub const WORKER: u8 = 2;
    pub const MINER: u8 = 3;
    pub const DIFFICULTY: u8 = 4;
    pub const ACTUAL_DIFFICULTY: u8 = 5;
    pub const NETWORK_DIFFICULTY: u8 = 6;
    pub const BLOCK_HEIGHT: u8 = 7;
    pub const BLOCK_CANDIDATE: u8 = 8;
    pub const SOURCE: u8 = 9;
    pub const CREATED_MS: u8 = 10;
    pub const BLOCK_HASH: u8 = 11;
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelayMessage {
    pub topic: String,
    pub flags: u32,
    pub payload: Vec<u8>,
}

/// Serialize a share under the given wire format flag.
pub fn encode_share(share: &Share, format: u32) -> Result<RelayMessage> {
    let payload = match format {
        WIRE_FORMAT_JSON => serde_json::to_vec(share)?,
        WIRE_FORMAT_BINARY => encode_binary(share),
        other => bail!("unsupported wire format {other}"),
    };
    Ok(RelayMessage {
        topic: share.pool_id.clone(),
        flags: format,
        payload,
    })
}

/// Deserialize a relayed share, honoring the reversed-flags interop
/// quirk: legacy publishers byte-swapped the flags word, so a word whose
/// format bits read zero is reversed once and re-masked. Anything else
/// is rejected.
pub fn decode_share(message: &RelayMessage) -> Result<Share> {
    let mut flags = message.flags;
    if flags & WIRE_FORMAT_MASK == 0 {
        flags = flags.swap_bytes();
        tracing::debug!(topic = %message.topic, "reversed flags word from legacy publisher");
    }
    match flags & WIRE_FORMAT_MASK {
        WIRE_FORMAT_JSON => Ok(serde_json::from_slice(&message.payload)?),
        WIRE_FORMAT_BINARY => decode_binary(&message.payload),
        other => bail!("unsupported wire format {other}"),
    }
}

fn put_str(buf: &mut Vec<u8>, tag: u8, value: &str) {
    buf.push(tag);
    buf.extend_from_slice(&(value.len() as u16).to_be_bytes());
    buf.extend_from_slice(value.as_bytes());
}

fn put_f64(buf: &mut Vec<u8>, tag: u8, value: f64) {
    buf.push(tag);
    buf.extend_from_slice(&value.to_bits().to_be_bytes());
}

fn put_u64(buf: &mut Vec<u8>, tag: u8, value: u64) {
    buf.push(tag);
    buf.extend_from_slice(&value.to_be_bytes());
}

fn encode_binary(share: &Share) -> Vec<u8> {
    let mut buf = Vec::with_capacity(128);
    put_str(&mut buf, tag::POOL_ID, &share.pool_id);
    put_str(&mut buf, tag::WORKER, &share.worker);
    if let Some(miner) = &share.miner {
        put_str(&mut buf, tag::MINER, miner);
    }
    put_f64(&mut buf, tag::DIFFICULTY, share.difficulty);
    put_f64(&mut buf, tag::ACTUAL_DIFFICULTY, share.actual_difficulty);
    put_f64(&mut buf, tag::NETWORK_DIFFICULTY, share.network_difficulty);
    put_u64(&mut buf, tag::BLOCK_HEIGHT, share.block_height);
    buf.push(tag::BLOCK_CANDIDATE);
    buf.push(share.is_block_candidate as u8);
    put_str(&mut buf, tag::SOURCE, &share.source);
    put_u64(&mut buf, tag::CREATED_MS, share.created.timestamp_millis() as u64);
    if let Some(hash) = &share.block_hash {
        put_str(&mut buf, tag::BLOCK_HASH, hash);
    }
    buf
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            bail!("truncated binary share");
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn str(&mut self) -> Result<String> {
        let len = u16::from_be_bytes(self.take(2)?.try_into().unwrap()) as usize;
        Ok(String::from_utf8(self.take(len)?.to_vec())?)
    }

    fn f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(u64::from_be_bytes(
            self.take(8)?.try_into().unwrap(),
        )))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }
}

fn decode_binary(payload: &[u8]) -> Result<Share> {
    let mut cur = Cursor {
        data: payload,
        pos: 0,
    };
    let mut pool_id = None;
    let mut worker = None;
    let mut miner = None;
    let mut difficulty = None;
    let mut actual_difficulty = None;
    let mut network_difficulty = 0.0;
    let mut block_height = 0;
    let mut is_block_candidate = false;
    let mut source = String::new();
    let mut created_ms: i64 = 0;
    let mut block_hash = None;

    while cur.pos < cur.data.len() {
        let field = cur.take(1)?[0];
        match field {
            tag::POOL_ID => pool_id = Some(cur.str()?),
            tag::WORKER => worker = Some(cur.str()?),
            tag::MINER => miner = Some(cur.str()?),
            tag::DIFFICULTY => difficulty = Some(cur.f64()?),
            tag::ACTUAL_DIFFICULTY => actual_difficulty = Some(cur.f64()?),
            tag::NETWORK_DIFFICULTY => network_difficulty = cur.f64()?,
            tag::BLOCK_HEIGHT => block_height = cur.u64()?,
            tag::BLOCK_CANDIDATE => is_block_candidate = cur.take(1)?[0] != 0,
            tag::SOURCE => source = cur.str()?,
            tag::CREATED_MS => created_ms = cur.u64()? as i64,
            tag::BLOCK_HASH => block_hash = Some(cur.str()?),
            // Forward compatibility: unknown tags end the parse rather
            // than guess at their width.
            other => bail!("unknown binary field tag {other}"),
        }
    }

    let created = chrono::Utc
        .timestamp_millis_opt(created_ms)
        .single()
        .ok_or_else(|| anyhow!("bad created timestamp"))?;

    Ok(Share {
        pool_id: pool_id.ok_or_else(|| anyhow!("binary share missing pool id"))?,
        worker: worker.ok_or_else(|| anyhow!("binary share missing worker"))?,
        miner,
        difficulty: difficulty.ok_or_else(|| anyhow!("binary share missing difficulty"))?,
        actual_difficulty: actual_difficulty
            .ok_or_else(|| anyhow!("binary share missing actual difficulty"))?,
        network_difficulty,
        block_height,
        is_block_candidate,
        source,
        created,
        block_hash,
    })
}

pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &RelayMessage,
) -> std::io::Result<()> {
    let topic = message.topic.as_bytes();
    writer.write_u32(topic.len() as u32).await?;
    writer.write_all(topic).await?;
    writer.write_u32(4).await?;
    writer.write_all(&message.flags.to_be_bytes()).await?;
    writer.write_u32(message.payload.len() as u32).await?;
    writer.write_all(&message.payload).await?;
    writer.flush().await
}

async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let len = reader.read_u32().await?;
    if len > MAX_FRAME {
        bail!("relay frame of {len} bytes exceeds limit");
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<RelayMessage> {
    let topic = read_frame(reader).await?;
    let flags_frame = read_frame(reader).await?;
    if flags_frame.len() != 4 {
        bail!("flags frame must be 4 bytes, got {}", flags_frame.len());
    }
    let payload = read_frame(reader).await?;
    Ok(RelayMessage {
        topic: String::from_utf8(topic)?,
        flags: u32::from_be_bytes(flags_frame.try_into().unwrap()),
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn share() -> Share {
        Share {
            pool_id: "xmr1".to_string(),
            worker: "addr1.rig7".to_string(),
            miner: Some("addr1".to_string()),
            difficulty: 17.25,
            actual_difficulty: 99.5,
            network_difficulty: 1.5e9,
            block_height: 42,
            is_block_candidate: false,
            source: "A".to_string(),
            created: Utc.timestamp_millis_opt(1_700_000_000_123).unwrap(),
            block_hash: None,
        }
    }

    #[test]
    fn binary_round_trip_preserves_all_fields() {
        let original = share();
        let message = encode_share(&original, WIRE_FORMAT_BINARY).unwrap();
        assert_eq!(message.topic, "xmr1");
        assert_eq!(message.flags & WIRE_FORMAT_MASK, WIRE_FORMAT_BINARY);
        let decoded = decode_share(&message).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn json_round_trip_preserves_all_fields() {
        let mut original = share();
        original.is_block_candidate = true;
        original.block_hash = Some("00ab".to_string());
        let message = encode_share(&original, WIRE_FORMAT_JSON).unwrap();
        // JSON payloads use camelCase property names.
        let text = String::from_utf8(message.payload.clone()).unwrap();
        assert!(text.contains("\"poolId\""));
        assert!(text.contains("\"isBlockCandidate\""));
        let decoded = decode_share(&message).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn reversed_flags_word_is_recovered() {
        let original = share();
        let mut message = encode_share(&original, WIRE_FORMAT_BINARY).unwrap();
        message.flags = message.flags.swap_bytes();
        assert_eq!(message.flags & WIRE_FORMAT_MASK, 0);
        let decoded = decode_share(&message).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn unknown_format_is_rejected() {
        let original = share();
        let mut message = encode_share(&original, WIRE_FORMAT_BINARY).unwrap();
        message.flags = 0x7;
        assert!(decode_share(&message).is_err());
        assert!(encode_share(&original, 9).is_err());
    }

    #[tokio::test]
    async fn stream_round_trip() {
        let message = encode_share(&share(), WIRE_FORMAT_BINARY).unwrap();
        let mut buf = Vec::new();
        write_message(&mut buf, &message).await.unwrap();

        let mut reader = buf.as_slice();
        let read = read_message(&mut reader).await.unwrap();
        assert_eq!(read, message);
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME + 1).to_be_bytes());
        let mut reader = buf.as_slice();
        assert!(read_message(&mut reader).await.is_err());
    }

    #[test]
    fn truncated_binary_payload_errors() {
        let message = encode_share(&share(), WIRE_FORMAT_BINARY).unwrap();
        let truncated = RelayMessage {
            payload: message.payload[..message.payload.len() - 3].to_vec(),
            ..message
        };
        assert!(decode_share(&truncated).is_err());
    }
}
