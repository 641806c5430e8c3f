use base64::prelude::{BASE64_STANDARD, Engine as _};

use super::Packetizer;
use super::rtp::{RTP_HEADER_LEN, RtpHeader};

/// Largest NAL payload per packet when no explicit limit is configured.
pub const DEFAULT_MTU: usize = 1400 - RTP_HEADER_LEN;

/// Smallest usable payload limit; FU-A needs room for two header bytes
/// plus at least one byte of data.
const MIN_MTU: usize = 3;

const NAL_TYPE_SPS: u8 = 7;
const NAL_TYPE_PPS: u8 = 8;
const NAL_TYPE_FU_A: u8 = 28;

/// H.264 RTP packetizer (RFC 6184, packetization-mode=1).
///
/// Turns one Annex B access unit into RTP packets:
///
/// - NAL units that fit in `mtu` bytes go out as Single NAL Unit packets
///   (§5.6).
/// - Larger NAL units are split into FU-A fragments (§5.8):
///
///   ```text
///   FU indicator:  [F|NRI|Type=28]
///   FU header:     [S|E|R|NAL_Type]
///   Fragment data: up to mtu - 2 bytes
///   ```
///
/// The marker bit is set on the final packet of the access unit.
///
/// SPS and PPS are captured from the first keyframe that carries them, after
/// which the `a=fmtp` line advertises `profile-level-id` and
/// `sprop-parameter-sets`.
#[derive(Debug)]
pub struct H264Packetizer {
    header: RtpHeader,
    mtu: usize,
    sps: Option<Vec<u8>>,
    pps: Option<Vec<u8>>,
}

impl H264Packetizer {
    pub fn new(pt: u8, ssrc: u32) -> Self {
        Self::from_header(RtpHeader::new(pt, ssrc))
    }

    pub fn with_random_ssrc(pt: u8) -> Self {
        Self::from_header(RtpHeader::with_random_ssrc(pt))
    }

    fn from_header(header: RtpHeader) -> Self {
        Self {
            header,
            mtu: DEFAULT_MTU,
            sps: None,
            pps: None,
        }
    }

    /// Size each packet for a datagram limit of `max_packet_size` bytes,
    /// RTP header included.
    pub fn max_packet_size(mut self, max_packet_size: usize) -> Self {
        self.mtu = max_packet_size.saturating_sub(RTP_HEADER_LEN).max(MIN_MTU);
        self
    }

    /// Largest NAL payload carried by one packet.
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    fn profile_level_id(&self) -> Option<String> {
        let sps = self.sps.as_deref().filter(|sps| sps.len() >= 4)?;
        Some(format!("{:02x}{:02x}{:02x}", sps[1], sps[2], sps[3]))
    }

    fn sprop_parameter_sets(&self) -> Option<String> {
        let sps = self.sps.as_deref()?;
        let pps = self.pps.as_deref()?;
        Some(format!(
            "{},{}",
            BASE64_STANDARD.encode(sps),
            BASE64_STANDARD.encode(pps)
        ))
    }

    fn capture_parameter_sets(&mut self, nal_units: &[&[u8]]) {
        for nal in nal_units {
            match nal[0] & 0x1f {
                NAL_TYPE_SPS if self.sps.is_none() => {
                    self.sps = Some(nal.to_vec());
                    tracing::debug!(bytes = nal.len(), "H.264 SPS captured");
                }
                NAL_TYPE_PPS if self.pps.is_none() => {
                    self.pps = Some(nal.to_vec());
                    tracing::debug!(bytes = nal.len(), "H.264 PPS captured");
                }
                _ => {}
            }
        }
    }

    fn packetize_nal(&mut self, nal_unit: &[u8], is_last_nal: bool, packets: &mut Vec<Vec<u8>>) {
        if nal_unit.is_empty() {
            return;
        }

        if nal_unit.len() <= self.mtu {
            let hdr = self.header.write(is_last_nal);
            let mut packet = Vec::with_capacity(RTP_HEADER_LEN + nal_unit.len());
            packet.extend_from_slice(&hdr);
            packet.extend_from_slice(nal_unit);
            packets.push(packet);
            return;
        }

        let nal_type = nal_unit[0] & 0x1f;
        let fu_indicator = (nal_unit[0] & 0x60) | NAL_TYPE_FU_A;
        let max_fragment = self.mtu - 2;

        let mut chunks = nal_unit[1..].chunks(max_fragment).peekable();
        let mut first = true;
        let mut fragments = 0;
        while let Some(chunk) = chunks.next() {
            let last = chunks.peek().is_none();
            let fu_header = match (first, last) {
                (true, _) => 0x80,
                (false, true) => 0x40,
                (false, false) => 0x00,
            } | nal_type;

            let hdr = self.header.write(is_last_nal && last);
            let mut packet = Vec::with_capacity(RTP_HEADER_LEN + 2 + chunk.len());
            packet.extend_from_slice(&hdr);
            packet.push(fu_indicator);
            packet.push(fu_header);
            packet.extend_from_slice(chunk);
            packets.push(packet);

            first = false;
            fragments += 1;
        }

        tracing::trace!(nal_type, nal_size = nal_unit.len(), fragments, "FU-A fragmented NAL unit");
    }

    /// Split an Annex B bitstream into NAL units, start codes removed.
    ///
    /// Accepts both `00 00 00 01` and `00 00 01` start codes, mixed freely.
    /// Bytes before the first start code are ignored.
    pub fn extract_nal_units(data: &[u8]) -> Vec<Vec<u8>> {
        Self::nal_slices(data).into_iter().map(<[u8]>::to_vec).collect()
    }

    fn nal_slices(data: &[u8]) -> Vec<&[u8]> {
        // (payload start, start code length)
        let mut starts: Vec<(usize, usize)> = Vec::new();
        let mut i = 0usize;
        while i + 2 < data.len() {
            if data[i..].starts_with(&[0, 0, 0, 1]) {
                starts.push((i + 4, 4));
                i += 4;
            } else if data[i..].starts_with(&[0, 0, 1]) {
                starts.push((i + 3, 3));
                i += 3;
            } else {
                i += 1;
            }
        }

        let mut nals = Vec::with_capacity(starts.len());
        for (idx, &(start, _)) in starts.iter().enumerate() {
            let end = match starts.get(idx + 1) {
                Some(&(next, sc_len)) => next - sc_len,
                None => data.len(),
            };
            if start < end {
                nals.push(&data[start..end]);
            }
        }
        nals
    }
}

impl Packetizer for H264Packetizer {
    fn packetize(&mut self, encoded_data: &[u8], timestamp_increment: u32) -> Vec<Vec<u8>> {
        let nal_units = Self::nal_slices(encoded_data);
        if self.sps.is_none() || self.pps.is_none() {
            self.capture_parameter_sets(&nal_units);
        }

        let mut packets = Vec::new();
        for (i, nal) in nal_units.iter().enumerate() {
            self.packetize_nal(nal, i + 1 == nal_units.len(), &mut packets);
        }
        self.header.advance_timestamp(timestamp_increment);

        tracing::trace!(
            nal_count = nal_units.len(),
            rtp_packets = packets.len(),
            frame_bytes = encoded_data.len(),
            seq = self.header.sequence(),
            "frame packetized"
        );
        packets
    }

    fn codec_name(&self) -> &'static str {
        "H264"
    }

    fn clock_rate(&self) -> u32 {
        90000
    }

    fn payload_type(&self) -> u8 {
        self.header.pt
    }

    /// `a=rtpmap` first: clients parse attributes in order and `a=fmtp`
    /// refers to the payload type it defines.
    fn sdp_attributes(&self) -> Vec<String> {
        let mut fmtp = format!("a=fmtp:{} packetization-mode=1", self.header.pt);
        if let Some(pl) = self.profile_level_id() {
            fmtp.push_str(&format!(";profile-level-id={pl}"));
        }
        if let Some(sprop) = self.sprop_parameter_sets() {
            fmtp.push_str(&format!(";sprop-parameter-sets={sprop}"));
        }

        vec![
            format!(
                "a=rtpmap:{} {}/{}",
                self.payload_type(),
                self.codec_name(),
                self.clock_rate()
            ),
            fmtp,
            "a=control:track1".to_string(),
        ]
    }

    fn next_sequence(&self) -> u16 {
        self.header.sequence()
    }

    fn next_rtp_timestamp(&self) -> u32 {
        self.header.timestamp()
    }
}
