//! Audio encode/decode and resampling.
//!
//! The canonical internal form is 16 kHz mono signed 16-bit PCM. Provider
//! audio is decoded to canonical form before playback; captured audio is
//! encoded to the STT provider's requested format before upload.
//!
//! Supported wire formats: opus (Ogg-encapsulated, preferred), mp3, wav.

use crate::error::{Result, VoiceError};
use std::io::Cursor;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

/// Wire formats accepted from and sent to providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    /// Opus packets in an Ogg container.
    Opus,
    /// MPEG layer III.
    Mp3,
    /// RIFF WAV holding pcm_s16le.
    Wav,
}

impl AudioFormat {
    /// Wire name, as used in provider `response_format` fields.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Opus => "opus",
            Self::Mp3 => "mp3",
            Self::Wav => "wav",
        }
    }

    /// MIME type for multipart uploads.
    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Opus => "audio/ogg",
            Self::Mp3 => "audio/mpeg",
            Self::Wav => "audio/wav",
        }
    }
}

impl std::str::FromStr for AudioFormat {
    type Err = VoiceError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "opus" => Ok(Self::Opus),
            "mp3" => Ok(Self::Mp3),
            "wav" | "pcm_s16le" => Ok(Self::Wav),
            other => Err(VoiceError::InvalidRequest(format!(
                "unknown audio format '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// PCM audio in canonical or near-canonical form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioBuffer {
    /// Interleaved signed 16-bit samples.
    pub samples: Vec<i16>,
    /// Sample rate in Hz.
    pub rate: u32,
    /// Channel count (canonical form is mono).
    pub channels: u16,
}

impl AudioBuffer {
    /// The canonical pipeline sample rate.
    pub const CANONICAL_RATE: u32 = 16_000;

    /// Wrap already-canonical samples.
    pub fn canonical(samples: Vec<i16>) -> Self {
        Self {
            samples,
            rate: Self::CANONICAL_RATE,
            channels: 1,
        }
    }

    /// Buffer duration in seconds.
    pub fn duration_s(&self) -> f32 {
        if self.rate == 0 || self.channels == 0 {
            return 0.0;
        }
        self.samples.len() as f32 / (self.rate as f32 * self.channels as f32)
    }

    /// Convert float samples at an arbitrary rate/layout to canonical form.
    pub fn from_f32(samples: &[f32], rate: u32, channels: u16) -> Self {
        let mono = if channels > 1 {
            to_mono(samples, channels)
        } else {
            samples.to_vec()
        };
        let resampled = resample(&mono, rate, Self::CANONICAL_RATE);
        Self::canonical(resampled.iter().map(|s| f32_to_i16(*s)).collect())
    }

    /// Samples as f32 in [-1, 1].
    pub fn to_f32(&self) -> Vec<f32> {
        self.samples
            .iter()
            .map(|s| *s as f32 / i16::MAX as f32)
            .collect()
    }

    /// RMS level of the buffer, in the f32 domain.
    pub fn rms(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let sum: f64 = self
            .samples
            .iter()
            .map(|s| {
                let f = *s as f64 / i16::MAX as f64;
                f * f
            })
            .sum();
        (sum / self.samples.len() as f64).sqrt() as f32
    }
}

fn f32_to_i16(s: f32) -> i16 {
    (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

/// Convert interleaved multi-channel audio to mono by averaging channels.
pub fn to_mono(data: &[f32], channels: u16) -> Vec<f32> {
    let ch = channels.max(1) as usize;
    data.chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

/// Linear-interpolation resampler.
///
/// Sufficient quality for speech in either direction; speech energy sits
/// well below the 8 kHz Nyquist of the canonical rate.
pub fn resample(samples: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if src_rate == dst_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = src_rate as f64 / dst_rate as f64;
    let out_len = (samples.len() as f64 / ratio) as usize;
    let mut output = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let src_pos = i as f64 * ratio;
        let idx = src_pos as usize;
        let frac = src_pos - idx as f64;

        let sample = if idx + 1 < samples.len() {
            samples[idx] as f64 * (1.0 - frac) + samples[idx + 1] as f64 * frac
        } else {
            samples[idx.min(samples.len() - 1)] as f64
        };

        output.push(sample as f32);
    }

    output
}

/// Decode compressed bytes to canonical PCM.
///
/// # Errors
///
/// Returns an error if the bytes are not valid audio in the given format.
pub fn decode(bytes: &[u8], format: AudioFormat) -> Result<AudioBuffer> {
    match format {
        AudioFormat::Wav => decode_wav(bytes),
        AudioFormat::Mp3 => decode_mp3(bytes),
        AudioFormat::Opus => decode_opus(bytes),
    }
}

/// Encode canonical PCM into the given wire format.
///
/// # Errors
///
/// Returns an error if the buffer is not canonical or encoding fails.
pub fn encode(buffer: &AudioBuffer, format: AudioFormat) -> Result<Vec<u8>> {
    if buffer.rate != AudioBuffer::CANONICAL_RATE || buffer.channels != 1 {
        return Err(VoiceError::Codec(format!(
            "encode expects canonical 16kHz mono, got {}Hz/{}ch",
            buffer.rate, buffer.channels
        )));
    }
    match format {
        AudioFormat::Wav => encode_wav(buffer),
        AudioFormat::Mp3 => encode_mp3(buffer),
        AudioFormat::Opus => encode_opus(buffer),
    }
}

// ── WAV ───────────────────────────────────────────────────────

fn decode_wav(bytes: &[u8]) -> Result<AudioBuffer> {
    let reader = hound::WavReader::new(Cursor::new(bytes))
        .map_err(|e| VoiceError::Codec(format!("invalid wav: {e}")))?;
    let spec = reader.spec();

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Int => {
            let shift = spec.bits_per_sample.saturating_sub(1);
            let scale = (1i64 << shift) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| VoiceError::Codec(format!("wav read: {e}")))?
        }
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| VoiceError::Codec(format!("wav read: {e}")))?,
    };

    Ok(AudioBuffer::from_f32(
        &samples,
        spec.sample_rate,
        spec.channels,
    ))
}

fn encode_wav(buffer: &AudioBuffer) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: buffer.rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| VoiceError::Codec(format!("wav write: {e}")))?;
        for sample in &buffer.samples {
            writer
                .write_sample(*sample)
                .map_err(|e| VoiceError::Codec(format!("wav write: {e}")))?;
        }
        writer
            .finalize()
            .map_err(|e| VoiceError::Codec(format!("wav finalize: {e}")))?;
    }
    Ok(cursor.into_inner())
}

// ── MP3 ───────────────────────────────────────────────────────

fn decode_mp3(bytes: &[u8]) -> Result<AudioBuffer> {
    let cursor = Cursor::new(bytes.to_vec());
    let mss = MediaSourceStream::new(Box::new(cursor), Default::default());
    let mut hint = Hint::new();
    hint.with_extension("mp3");

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| VoiceError::Codec(format!("mp3 probe: {e}")))?;
    let mut format = probed.format;

    let track = format
        .default_track()
        .ok_or_else(|| VoiceError::Codec("mp3 has no audio track".into()))?;
    let track_id = track.id;
    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| VoiceError::Codec(format!("mp3 decoder: {e}")))?;

    let mut rate = track.codec_params.sample_rate.unwrap_or(44_100);
    let mut channels = track
        .codec_params
        .channels
        .map(|c| c.count() as u16)
        .unwrap_or(1);
    let mut samples: Vec<f32> = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymphoniaError::IoError(e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(VoiceError::Codec(format!("mp3 read: {e}"))),
        };
        if packet.track_id() != track_id {
            continue;
        }
        match decoder.decode(&packet) {
            Ok(decoded) => {
                let spec = *decoded.spec();
                rate = spec.rate;
                channels = spec.channels.count() as u16;
                let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
                buf.copy_interleaved_ref(decoded);
                samples.extend_from_slice(buf.samples());
            }
            // A corrupt frame is skippable; resynchronization is the
            // decoder's job.
            Err(SymphoniaError::DecodeError(_)) => continue,
            Err(e) => return Err(VoiceError::Codec(format!("mp3 decode: {e}"))),
        }
    }

    if samples.is_empty() {
        return Err(VoiceError::Codec("mp3 contained no audio".into()));
    }
    Ok(AudioBuffer::from_f32(&samples, rate, channels))
}

fn encode_mp3(buffer: &AudioBuffer) -> Result<Vec<u8>> {
    use mp3lame_encoder::{Builder, FlushNoGap, MonoPcm};

    let mut builder =
        Builder::new().ok_or_else(|| VoiceError::Codec("cannot create LAME builder".into()))?;
    builder
        .set_num_channels(1)
        .map_err(|e| VoiceError::Codec(format!("mp3 channels: {e:?}")))?;
    builder
        .set_sample_rate(buffer.rate)
        .map_err(|e| VoiceError::Codec(format!("mp3 rate: {e:?}")))?;
    builder
        .set_brate(mp3lame_encoder::Bitrate::Kbps128)
        .map_err(|e| VoiceError::Codec(format!("mp3 bitrate: {e:?}")))?;
    builder
        .set_quality(mp3lame_encoder::Quality::Best)
        .map_err(|e| VoiceError::Codec(format!("mp3 quality: {e:?}")))?;
    let mut encoder = builder
        .build()
        .map_err(|e| VoiceError::Codec(format!("mp3 encoder init: {e:?}")))?;

    let mut out: Vec<u8> = Vec::new();
    out.reserve(mp3lame_encoder::max_required_buffer_size(
        buffer.samples.len(),
    ));
    let written = encoder
        .encode(MonoPcm(&buffer.samples), out.spare_capacity_mut())
        .map_err(|e| VoiceError::Codec(format!("mp3 encode: {e:?}")))?;
    // SAFETY: LAME initialized exactly `written` bytes of the spare capacity.
    unsafe { out.set_len(out.len() + written) };

    out.reserve(7_200);
    let flushed = encoder
        .flush::<FlushNoGap>(out.spare_capacity_mut())
        .map_err(|e| VoiceError::Codec(format!("mp3 flush: {e:?}")))?;
    // SAFETY: as above, for the flush tail.
    unsafe { out.set_len(out.len() + flushed) };

    Ok(out)
}

// ── Opus (Ogg-encapsulated) ───────────────────────────────────

/// Opus frame length: 10 ms at the canonical rate.
const OPUS_FRAME_SAMPLES: usize = 160;
/// Granule positions count samples at 48 kHz regardless of coding rate.
const OPUS_GRANULE_PER_FRAME: u64 = 480;
/// Audio packets per Ogg page. Bounded so the lacing table stays within
/// one byte of segment count even for maximum-size packets.
const OPUS_PACKETS_PER_PAGE: usize = 15;

fn decode_opus(bytes: &[u8]) -> Result<AudioBuffer> {
    let packets = ogg::read_packets(bytes)?;
    let mut decoder = opus::Decoder::new(AudioBuffer::CANONICAL_RATE, opus::Channels::Mono)
        .map_err(|e| VoiceError::Codec(format!("opus decoder: {e}")))?;

    let mut samples = Vec::new();
    let mut frame = vec![0i16; AudioBuffer::CANONICAL_RATE as usize * 120 / 1_000];
    let mut seen_audio = false;
    for packet in packets {
        // Skip the OpusHead/OpusTags header packets.
        if !seen_audio
            && (packet.starts_with(b"OpusHead") || packet.starts_with(b"OpusTags"))
        {
            continue;
        }
        seen_audio = true;
        let n = decoder
            .decode(&packet, &mut frame, false)
            .map_err(|e| VoiceError::Codec(format!("opus decode: {e}")))?;
        samples.extend_from_slice(&frame[..n]);
    }

    if samples.is_empty() {
        return Err(VoiceError::Codec("opus stream contained no audio".into()));
    }
    Ok(AudioBuffer::canonical(samples))
}

fn encode_opus(buffer: &AudioBuffer) -> Result<Vec<u8>> {
    let mut encoder = opus::Encoder::new(
        buffer.rate,
        opus::Channels::Mono,
        opus::Application::Voip,
    )
    .map_err(|e| VoiceError::Codec(format!("opus encoder: {e}")))?;

    let mut packets = Vec::new();
    for chunk in buffer.samples.chunks(OPUS_FRAME_SAMPLES) {
        let frame = if chunk.len() == OPUS_FRAME_SAMPLES {
            chunk.to_vec()
        } else {
            // Zero-pad the trailing partial frame to a legal opus size.
            let mut padded = chunk.to_vec();
            padded.resize(OPUS_FRAME_SAMPLES, 0);
            padded
        };
        let packet = encoder
            .encode_vec(&frame, 4_000)
            .map_err(|e| VoiceError::Codec(format!("opus encode: {e}")))?;
        packets.push(packet);
    }

    ogg::write_stream(&packets, buffer.rate)
}

mod ogg {
    //! Minimal Ogg encapsulation for opus: enough to produce streams that
    //! standard demuxers accept, and to read back what providers send.

    use super::{OPUS_GRANULE_PER_FRAME, OPUS_PACKETS_PER_PAGE};
    use crate::error::{Result, VoiceError};

    const PAGE_MAGIC: &[u8; 4] = b"OggS";

    /// Ogg CRC32: polynomial 0x04C11DB7, no reflection, zero init/xorout.
    fn crc32(data: &[u8]) -> u32 {
        let mut crc: u32 = 0;
        for byte in data {
            crc ^= (*byte as u32) << 24;
            for _ in 0..8 {
                crc = if crc & 0x8000_0000 != 0 {
                    (crc << 1) ^ 0x04C1_1DB7
                } else {
                    crc << 1
                };
            }
        }
        crc
    }

    /// Reassemble the logical packet stream from concatenated pages.
    pub fn read_packets(bytes: &[u8]) -> Result<Vec<Vec<u8>>> {
        let mut packets = Vec::new();
        let mut partial: Vec<u8> = Vec::new();
        let mut pos = 0usize;

        while pos + 27 <= bytes.len() {
            if &bytes[pos..pos + 4] != PAGE_MAGIC {
                return Err(VoiceError::Codec("bad ogg page magic".into()));
            }
            let segment_count = bytes[pos + 26] as usize;
            let table_end = pos + 27 + segment_count;
            if table_end > bytes.len() {
                return Err(VoiceError::Codec("truncated ogg segment table".into()));
            }
            let lacing = &bytes[pos + 27..table_end];
            let body_len: usize = lacing.iter().map(|v| *v as usize).sum();
            if table_end + body_len > bytes.len() {
                return Err(VoiceError::Codec("truncated ogg page body".into()));
            }

            let mut body_pos = table_end;
            for value in lacing {
                let len = *value as usize;
                partial.extend_from_slice(&bytes[body_pos..body_pos + len]);
                body_pos += len;
                if len < 255 {
                    packets.push(std::mem::take(&mut partial));
                }
            }
            pos = body_pos;
        }

        if bytes.is_empty() || packets.is_empty() {
            return Err(VoiceError::Codec("empty ogg stream".into()));
        }
        Ok(packets)
    }

    /// Write an Ogg Opus stream: OpusHead page, OpusTags page, then audio
    /// pages of up to [`OPUS_PACKETS_PER_PAGE`] packets each.
    pub fn write_stream(packets: &[Vec<u8>], input_rate: u32) -> Result<Vec<u8>> {
        let serial: u32 = 0x564d_4f44; // arbitrary but fixed stream serial
        let mut out = Vec::new();
        let mut page_seq: u32 = 0;

        let mut head = Vec::with_capacity(19);
        head.extend_from_slice(b"OpusHead");
        head.push(1); // version
        head.push(1); // channel count
        head.extend_from_slice(&0u16.to_le_bytes()); // pre-skip
        head.extend_from_slice(&input_rate.to_le_bytes());
        head.extend_from_slice(&0i16.to_le_bytes()); // output gain
        head.push(0); // mapping family
        write_page(&mut out, serial, &mut page_seq, 0x02, 0, &[head]);

        let vendor = b"voicemode";
        let mut tags = Vec::new();
        tags.extend_from_slice(b"OpusTags");
        tags.extend_from_slice(&(vendor.len() as u32).to_le_bytes());
        tags.extend_from_slice(vendor);
        tags.extend_from_slice(&0u32.to_le_bytes()); // no comments
        write_page(&mut out, serial, &mut page_seq, 0x00, 0, &[tags]);

        let mut granule: u64 = 0;
        let total_pages = packets.len().div_ceil(OPUS_PACKETS_PER_PAGE).max(1);
        for (index, group) in packets.chunks(OPUS_PACKETS_PER_PAGE).enumerate() {
            granule += group.len() as u64 * OPUS_GRANULE_PER_FRAME;
            let header_type = if index + 1 == total_pages { 0x04 } else { 0x00 };
            let owned: Vec<Vec<u8>> = group.to_vec();
            write_page(&mut out, serial, &mut page_seq, header_type, granule, &owned);
        }

        Ok(out)
    }

    fn write_page(
        out: &mut Vec<u8>,
        serial: u32,
        page_seq: &mut u32,
        header_type: u8,
        granule: u64,
        packets: &[Vec<u8>],
    ) {
        let mut lacing = Vec::new();
        for packet in packets {
            let mut remaining = packet.len();
            while remaining >= 255 {
                lacing.push(255u8);
                remaining -= 255;
            }
            lacing.push(remaining as u8);
        }

        let mut page = Vec::new();
        page.extend_from_slice(PAGE_MAGIC);
        page.push(0); // version
        page.push(header_type);
        page.extend_from_slice(&granule.to_le_bytes());
        page.extend_from_slice(&serial.to_le_bytes());
        page.extend_from_slice(&page_seq.to_le_bytes());
        page.extend_from_slice(&0u32.to_le_bytes()); // crc placeholder
        page.push(lacing.len() as u8);
        page.extend_from_slice(&lacing);
        for packet in packets {
            page.extend_from_slice(packet);
        }

        let crc = crc32(&page);
        page[22..26].copy_from_slice(&crc.to_le_bytes());
        out.extend_from_slice(&page);
        *page_seq += 1;
    }
}

/// Incremental decoder used while TTS bytes stream in.
///
/// Opus and wav yield PCM as soon as complete pages / the header arrive;
/// mp3 buffers until the stream ends (the preferred wire format is opus).
pub struct StreamingDecoder {
    format: AudioFormat,
    pending: Vec<u8>,
    opus: Option<opus::Decoder>,
    wav_header: Option<(u32, u16)>,
    finished: bool,
}

impl StreamingDecoder {
    /// Create a decoder for one TTS response stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the opus decoder cannot be created.
    pub fn new(format: AudioFormat) -> Result<Self> {
        let opus_decoder = if format == AudioFormat::Opus {
            Some(
                opus::Decoder::new(AudioBuffer::CANONICAL_RATE, opus::Channels::Mono)
                    .map_err(|e| VoiceError::Codec(format!("opus decoder: {e}")))?,
            )
        } else {
            None
        };
        Ok(Self {
            format,
            pending: Vec::new(),
            opus: opus_decoder,
            wav_header: None,
            finished: false,
        })
    }

    /// Feed a chunk of wire bytes, returning any newly decodable canonical
    /// samples.
    ///
    /// # Errors
    ///
    /// Returns an error on malformed input.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<i16>> {
        self.pending.extend_from_slice(bytes);
        match self.format {
            AudioFormat::Opus => self.drain_opus_pages(),
            AudioFormat::Wav => self.drain_wav(),
            AudioFormat::Mp3 => Ok(Vec::new()),
        }
    }

    /// Signal end-of-stream and decode whatever remains.
    ///
    /// # Errors
    ///
    /// Returns an error on malformed input.
    pub fn finish(&mut self) -> Result<Vec<i16>> {
        self.finished = true;
        match self.format {
            AudioFormat::Opus => self.drain_opus_pages(),
            AudioFormat::Wav => self.drain_wav(),
            AudioFormat::Mp3 => {
                if self.pending.is_empty() {
                    return Ok(Vec::new());
                }
                let bytes = std::mem::take(&mut self.pending);
                Ok(decode_mp3(&bytes)?.samples)
            }
        }
    }

    /// Parse complete Ogg pages out of the pending buffer and decode their
    /// packets. Incomplete trailing pages stay pending.
    fn drain_opus_pages(&mut self) -> Result<Vec<i16>> {
        let mut samples = Vec::new();
        let mut frame = vec![0i16; AudioBuffer::CANONICAL_RATE as usize * 120 / 1_000];

        loop {
            if self.pending.len() < 27 || &self.pending[..4] != b"OggS" {
                break;
            }
            let segment_count = self.pending[26] as usize;
            let table_end = 27 + segment_count;
            if self.pending.len() < table_end {
                break;
            }
            let body_len: usize = self.pending[27..table_end]
                .iter()
                .map(|v| *v as usize)
                .sum();
            let page_end = table_end + body_len;
            if self.pending.len() < page_end {
                break;
            }

            let page: Vec<u8> = self.pending.drain(..page_end).collect();
            let lacing = &page[27..table_end];
            let mut pos = table_end;
            let mut packet: Vec<u8> = Vec::new();
            for value in lacing {
                let len = *value as usize;
                packet.extend_from_slice(&page[pos..pos + len]);
                pos += len;
                if len < 255 {
                    let complete = std::mem::take(&mut packet);
                    if complete.starts_with(b"OpusHead") || complete.starts_with(b"OpusTags") {
                        continue;
                    }
                    let decoder = self
                        .opus
                        .as_mut()
                        .ok_or_else(|| VoiceError::Internal("opus decoder missing".into()))?;
                    let n = decoder
                        .decode(&complete, &mut frame, false)
                        .map_err(|e| VoiceError::Codec(format!("opus decode: {e}")))?;
                    samples.extend_from_slice(&frame[..n]);
                }
            }
        }
        Ok(samples)
    }

    /// Strip the RIFF header once seen, then emit whole i16 frames,
    /// resampling from the header rate to canonical.
    fn drain_wav(&mut self) -> Result<Vec<i16>> {
        if self.wav_header.is_none() {
            if self.pending.len() < 44 {
                return Ok(Vec::new());
            }
            if &self.pending[..4] != b"RIFF" || &self.pending[8..12] != b"WAVE" {
                return Err(VoiceError::Codec("invalid wav stream header".into()));
            }
            let channels = u16::from_le_bytes([self.pending[22], self.pending[23]]);
            let rate = u32::from_le_bytes([
                self.pending[24],
                self.pending[25],
                self.pending[26],
                self.pending[27],
            ]);
            self.wav_header = Some((rate, channels));
            self.pending.drain(..44);
        }

        let (rate, channels) = self
            .wav_header
            .ok_or_else(|| VoiceError::Internal("wav header missing".into()))?;
        let frame_bytes = 2 * channels as usize;
        let usable = (self.pending.len() / frame_bytes) * frame_bytes;
        if usable == 0 {
            return Ok(Vec::new());
        }
        let raw: Vec<u8> = self.pending.drain(..usable).collect();
        let interleaved: Vec<f32> = raw
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / i16::MAX as f32)
            .collect();
        let buffer = AudioBuffer::from_f32(&interleaved, rate, channels);
        Ok(buffer.samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    /// 16 kHz mono test tone: 440 Hz sine at the given duration.
    fn tone(duration_s: f32) -> AudioBuffer {
        let rate = AudioBuffer::CANONICAL_RATE;
        let n = (rate as f32 * duration_s) as usize;
        let samples: Vec<i16> = (0..n)
            .map(|i| {
                let t = i as f32 / rate as f32;
                f32_to_i16(0.4 * (2.0 * std::f32::consts::PI * 440.0 * t).sin())
            })
            .collect();
        AudioBuffer::canonical(samples)
    }

    fn db_ratio(a: f32, b: f32) -> f32 {
        20.0 * (a.max(1e-9) / b.max(1e-9)).log10()
    }

    #[test]
    fn format_names_round_trip() {
        for format in [AudioFormat::Opus, AudioFormat::Mp3, AudioFormat::Wav] {
            assert_eq!(AudioFormat::from_str(format.as_str()).unwrap(), format);
        }
        assert!(AudioFormat::from_str("flac").is_err());
    }

    #[test]
    fn wav_round_trip_is_sample_exact() {
        let original = tone(1.0);
        let encoded = encode(&original, AudioFormat::Wav).unwrap();
        let decoded = decode(&encoded, AudioFormat::Wav).unwrap();
        assert_eq!(decoded.rate, AudioBuffer::CANONICAL_RATE);
        assert_eq!(decoded.samples.len(), original.samples.len());
    }

    #[test]
    fn opus_round_trip_duration_within_10ms() {
        let original = tone(1.0);
        let encoded = encode(&original, AudioFormat::Opus).unwrap();
        let decoded = decode(&encoded, AudioFormat::Opus).unwrap();
        let diff = (decoded.duration_s() - original.duration_s()).abs();
        assert!(diff <= 0.010, "duration drift {diff}s");
    }

    #[test]
    fn opus_round_trip_preserves_level() {
        let original = tone(1.0);
        let encoded = encode(&original, AudioFormat::Opus).unwrap();
        let decoded = decode(&encoded, AudioFormat::Opus).unwrap();
        let drift = db_ratio(decoded.rms(), original.rms()).abs();
        assert!(drift <= 3.0, "RMS drift {drift}dB");
    }

    #[test]
    fn opus_partial_tail_frame_is_padded_not_dropped() {
        // 1.005s is not a whole number of 10ms frames.
        let original = tone(1.005);
        let encoded = encode(&original, AudioFormat::Opus).unwrap();
        let decoded = decode(&encoded, AudioFormat::Opus).unwrap();
        assert!(decoded.duration_s() >= original.duration_s() - 0.001);
        assert!(decoded.duration_s() <= original.duration_s() + 0.010);
    }

    #[test]
    fn mp3_round_trip_recognizable() {
        let original = tone(1.0);
        let encoded = encode(&original, AudioFormat::Mp3).unwrap();
        let decoded = decode(&encoded, AudioFormat::Mp3).unwrap();
        // LAME pads with encoder/decoder delay; allow for it.
        let diff = (decoded.duration_s() - original.duration_s()).abs();
        assert!(diff <= 0.2, "duration drift {diff}s");
    }

    #[test]
    fn encode_rejects_non_canonical_input() {
        let buffer = AudioBuffer {
            samples: vec![0; 48_000],
            rate: 48_000,
            channels: 1,
        };
        assert!(encode(&buffer, AudioFormat::Wav).is_err());
    }

    #[test]
    fn resample_halves_and_doubles() {
        let samples: Vec<f32> = (0..1_000).map(|i| (i as f32 / 100.0).sin()).collect();
        let down = resample(&samples, 32_000, 16_000);
        assert!((down.len() as i64 - 500).abs() <= 1);
        let up = resample(&samples, 8_000, 16_000);
        assert!((up.len() as i64 - 2_000).abs() <= 2);
    }

    #[test]
    fn to_mono_averages_channels() {
        let stereo = [1.0, 0.0, 0.5, 0.5, -1.0, 1.0];
        let mono = to_mono(&stereo, 2);
        assert_eq!(mono, vec![0.5, 0.5, 0.0]);
    }

    #[test]
    fn streaming_opus_decodes_page_by_page() {
        let original = tone(1.0);
        let encoded = encode(&original, AudioFormat::Opus).unwrap();

        let mut decoder = StreamingDecoder::new(AudioFormat::Opus).unwrap();
        let mut samples = Vec::new();
        // Feed in awkward 100-byte chunks to exercise page reassembly.
        for chunk in encoded.chunks(100) {
            samples.extend(decoder.push(chunk).unwrap());
        }
        samples.extend(decoder.finish().unwrap());

        let whole = decode(&encoded, AudioFormat::Opus).unwrap();
        assert_eq!(samples.len(), whole.samples.len());
    }

    #[test]
    fn streaming_wav_strips_header_and_emits_pcm() {
        let original = tone(0.5);
        let encoded = encode(&original, AudioFormat::Wav).unwrap();

        let mut decoder = StreamingDecoder::new(AudioFormat::Wav).unwrap();
        let mut samples = Vec::new();
        for chunk in encoded.chunks(64) {
            samples.extend(decoder.push(chunk).unwrap());
        }
        samples.extend(decoder.finish().unwrap());
        assert_eq!(samples.len(), original.samples.len());
    }

    #[test]
    fn duration_is_rate_aware() {
        let buffer = AudioBuffer::canonical(vec![0; 8_000]);
        assert!((buffer.duration_s() - 0.5).abs() < 1e-6);
    }
}
