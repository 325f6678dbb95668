use anyhow::{anyhow, Result};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};

#[derive(Debug)]
pub struct WavInfo {
    pub fmt_content: Vec<u8>,
    pub data_offset: u64,
    pub data_size: u32,
}

impl WavInfo {
    /// Bytes per second from the fmt chunk (offset 8).
    pub fn byte_rate(&self) -> Result<u32> {
        let raw = self
            .fmt_content
            .get(8..12)
            .ok_or_else(|| anyhow!("fmt chunk too short"))?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }
}

pub fn scan_wav(bytes: &[u8]) -> Result<WavInfo> {
    let mut f = Cursor::new(bytes);
    let total = bytes.len() as u64;

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

    let mut fmt_content: Option<Vec<u8>> = None;
    let mut data: Option<(u64, u32)> = None;

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
            let mut buf = vec![0u8; chunk_size as usize];
            f.read_exact(&mut buf)?;
            fmt_content = Some(buf);
        } else if &chunk_id == b"data" {
            let offset = f.stream_position()?;
            // Streamed responses leave the size as 0 or 0xFFFFFFFF; trust the buffer.
            let remaining = (total - offset).min(u32::MAX as u64) as u32;
            let size = if chunk_size == 0 || chunk_size > remaining {
                remaining
            } else {
                chunk_size
            };
            data = Some((offset, size));
            break;
        } else {
            f.seek(SeekFrom::Current(chunk_size as i64 + (chunk_size % 2) as i64))?;
        }
    }

    let (data_offset, data_size) = data.ok_or_else(|| anyhow!("Missing data chunk"))?;
    Ok(WavInfo {
        fmt_content: fmt_content.ok_or_else(|| anyhow!("Missing fmt chunk"))?,
        data_offset,
        data_size,
    })
}

pub fn wav_duration_seconds(bytes: &[u8]) -> Result<f64> {
    let info = scan_wav(bytes)?;
    let rate = info.byte_rate()?;
    if rate == 0 {
        return Err(anyhow!("WAV byte rate is zero"));
    }
    Ok(info.data_size as f64 / rate as f64)
}

/// Joins PCM WAV buffers into one WAV by rewriting the header around the
/// concatenated data chunks. All inputs must share one fmt chunk.
pub fn merge_wav(buffers: &[Vec<u8>]) -> Result<Vec<u8>> {
    let first = buffers.first().ok_or_else(|| anyhow!("No audio to merge"))?;
    if buffers.len() == 1 {
        return Ok(first.clone());
    }

    let mut infos = Vec::with_capacity(buffers.len());
    let mut total_data_size: u64 = 0;
    for (i, buf) in buffers.iter().enumerate() {
        let info = scan_wav(buf).map_err(|e| anyhow!("Failed to parse WAV segment {}: {}", i, e))?;
        if let Some(base) = infos.first().map(|b: &WavInfo| &b.fmt_content) {
            if info.fmt_content != *base {
                return Err(anyhow!(
                    "WAV format mismatch in segment {}. All segments must share sample rate/channels.",
                    i
                ));
            }
        }
        total_data_size += info.data_size as u64;
        infos.push(info);
    }
    let total_data_size = u32::try_from(total_data_size)
        .map_err(|_| anyhow!("Merged audio exceeds WAV size limit"))?;
    let base_fmt = &infos[0].fmt_content;

    let mut out = Vec::with_capacity(total_data_size as usize + 64);
    out.write_all(b"RIFF")?;
    let riff_size = 4 + 8 + base_fmt.len() as u32 + 8 + total_data_size;
    out.write_all(&riff_size.to_le_bytes())?;
    out.write_all(b"WAVE")?;
    out.write_all(b"fmt ")?;
    out.write_all(&(base_fmt.len() as u32).to_le_bytes())?;
    out.write_all(base_fmt)?;
    out.write_all(b"data")?;
    out.write_all(&total_data_size.to_le_bytes())?;

    for (buf, info) in buffers.iter().zip(&infos) {
        let start = info.data_offset as usize;
        let end = start + info.data_size as usize;
        out.write_all(&buf[start..end])?;
    }
    Ok(out)
}

#[cfg(test)]
pub(crate) fn pcm_wav(seconds: f64, sample_rate: u32) -> Vec<u8> {
    let size = (seconds * sample_rate as f64) as u32 * 2;
    let mut buf = Vec::new();
    buf.extend_from_slice(b"RIFF");
    buf.extend_from_slice(&(36 + size).to_le_bytes());
    buf.extend_from_slice(b"WAVE");
    buf.extend_from_slice(b"fmt ");
    buf.extend_from_slice(&16u32.to_le_bytes());
    // PCM, mono, rate, byte rate, block align, bits
    buf.extend_from_slice(&1u16.to_le_bytes());
    buf.extend_from_slice(&1u16.to_le_bytes());
    buf.extend_from_slice(&sample_rate.to_le_bytes());
    buf.extend_from_slice(&(sample_rate * 2).to_le_bytes());
    buf.extend_from_slice(&2u16.to_le_bytes());
    buf.extend_from_slice(&16u16.to_le_bytes());
    buf.extend_from_slice(b"data");
    buf.extend_from_slice(&size.to_le_bytes());
    buf.extend(std::iter::repeat_n(0u8, size as usize));
    buf
}
