use anyhow::{anyhow, Result};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};

pub const PLACEHOLDER_SAMPLE_RATE: u32 = 16_000;

/// Header facts of a PCM WAV buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct WavInfo {
    pub channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    pub data_size: u32,
}

impl WavInfo {
    pub fn duration_secs(&self) -> f64 {
        let bytes_per_sec =
            self.sample_rate as u64 * self.channels as u64 * (self.bits_per_sample as u64 / 8);
        if bytes_per_sec == 0 {
            return 0.0;
        }
        self.data_size as f64 / bytes_per_sec as f64
    }
}

/// Walks the RIFF chunks of an in-memory WAV until the data chunk.
pub fn scan_wav(bytes: &[u8]) -> Result<WavInfo> {
    let mut f = Cursor::new(bytes);

    let mut id = [0u8; 4];
    f.read_exact(&mut id)?;
    if &id != b"RIFF" {
        return Err(anyhow!("Not a RIFF file"));
    }
    f.seek(SeekFrom::Current(4))?;
    f.read_exact(&mut id)?;
    if &id != b"WAVE" {
        return Err(anyhow!("Not a WAVE file"));
    }

    let mut fmt: Option<(u16, u32, u16)> = None;
    loop {
        let mut chunk_id = [0u8; 4];
        let n = f.read(&mut chunk_id)?;
        if n == 0 {
            break;
        }
        if n < 4 {
            return Err(anyhow!("Unexpected EOF reading chunk ID"));
        }
        let mut size_buf = [0u8; 4];
        f.read_exact(&mut size_buf)?;
        let chunk_size = u32::from_le_bytes(size_buf);

        if &chunk_id == b"fmt " {
            if chunk_size < 16 {
                return Err(anyhow!("fmt chunk too short"));
            }
            let mut buf = [0u8; 16];
            f.read_exact(&mut buf)?;
            f.seek(SeekFrom::Current(chunk_size as i64 - 16))?;
            let channels = u16::from_le_bytes([buf[2], buf[3]]);
            let sample_rate = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
            let bits = u16::from_le_bytes([buf[14], buf[15]]);
            fmt = Some((channels, sample_rate, bits));
        } else if &chunk_id == b"data" {
            let (channels, sample_rate, bits_per_sample) =
                fmt.ok_or_else(|| anyhow!("data chunk before fmt chunk"))?;
            return Ok(WavInfo {
                channels,
                sample_rate,
                bits_per_sample,
                data_size: chunk_size,
            });
        } else {
            f.seek(SeekFrom::Current(chunk_size as i64))?;
        }
    }
    Err(anyhow!("Missing data chunk"))
}

/// Mono 16-bit PCM silence. Stands in for ambience when no generator is
/// configured so every panel still has a playable track.
pub fn silent_wav(duration_secs: u32, sample_rate: u32) -> Vec<u8> {
    let data_size = duration_secs * sample_rate * 2;
    let mut buf = Vec::with_capacity(44 + data_size as usize);
    // Writes into a Vec cannot fail.
    let _ = write_pcm_header(&mut buf, sample_rate, data_size);
    buf.resize(44 + data_size as usize, 0);
    buf
}

fn write_pcm_header(out: &mut impl Write, sample_rate: u32, data_size: u32) -> std::io::Result<()> {
    out.write_all(b"RIFF")?;
    out.write_all(&(36 + data_size).to_le_bytes())?;
    out.write_all(b"WAVE")?;

    out.write_all(b"fmt ")?;
    out.write_all(&16u32.to_le_bytes())?;
    // PCM (1), Mono (1), SampleRate, ByteRate, BlockAlign (2), Bits (16)
    out.write_all(&1u16.to_le_bytes())?;
    out.write_all(&1u16.to_le_bytes())?;
    out.write_all(&sample_rate.to_le_bytes())?;
    out.write_all(&(sample_rate * 2).to_le_bytes())?;
    out.write_all(&2u16.to_le_bytes())?;
    out.write_all(&16u16.to_le_bytes())?;

    out.write_all(b"data")?;
    out.write_all(&data_size.to_le_bytes())?;
    Ok(())
}
