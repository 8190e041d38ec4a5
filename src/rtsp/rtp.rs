use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{BufMut, Bytes, BytesMut};
use encoder_bus::EncodedFrame;

use crate::rtsp::sdp::{AUDIO_PAYLOAD_TYPE, VIDEO_PAYLOAD_TYPE};

pub const RTP_VERSION: u8 = 2;
pub const RTP_HEADER_LEN: usize = 12;
/// Largest RTP packet sent, header included.
pub const DEFAULT_MTU: usize = 1400;
pub const RTCP_INTERVAL: Duration = Duration::from_secs(5);

pub const RTCP_SR: u8 = 200;
pub const RTCP_SDES: u8 = 202;
pub const RTCP_BYE: u8 = 203;

const NTP_UNIX_OFFSET: u64 = 2_208_988_800;
const NAL_FU_A: u8 = 28;
const SDES_CNAME: u8 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PayloadFormat {
    H264,
    /// G.711 A-law.
    Pcma,
}

impl PayloadFormat {
    pub fn payload_type(&self) -> u8 {
        match self {
            PayloadFormat::H264 => VIDEO_PAYLOAD_TYPE,
            PayloadFormat::Pcma => AUDIO_PAYLOAD_TYPE,
        }
    }

    pub fn clock_rate(&self) -> u32 {
        match self {
            PayloadFormat::H264 => 90_000,
            PayloadFormat::Pcma => 8_000,
        }
    }
}

/// Turns encoded frames into RTP packets for one track.
///
/// Sequence number and timestamp start at the values announced in
/// `RTP-Info`. The first frame sent maps to `base_time`; later frames are
/// spaced by their capture time.
#[derive(Debug)]
pub struct Packetizer {
    format: PayloadFormat,
    ssrc: u32,
    seq: u16,
    base_time: u32,
    mtu: usize,
    first_pts: Option<Duration>,
    last_time: Option<u32>,
    packets: u32,
    octets: u32,
}

impl Packetizer {
    pub fn new(format: PayloadFormat, ssrc: u32, seq: u16, base_time: u32) -> Self {
        Self {
            format,
            ssrc,
            seq,
            base_time,
            mtu: DEFAULT_MTU,
            first_pts: None,
            last_time: None,
            packets: 0,
            octets: 0,
        }
    }

    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn format(&self) -> PayloadFormat {
        self.format
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Sequence number of the next packet.
    pub fn next_seq(&self) -> u16 {
        self.seq
    }

    /// Timestamp of the last frame sent, or the base before the first.
    pub fn rtptime(&self) -> u32 {
        self.last_time.unwrap_or(self.base_time)
    }

    pub fn packets(&self) -> u32 {
        self.packets
    }

    pub fn octets(&self) -> u32 {
        self.octets
    }

    fn timestamp(&mut self, pts: Duration) -> u32 {
        let first = *self.first_pts.get_or_insert(pts);
        let ticks = pts.saturating_sub(first).as_micros() * u128::from(self.format.clock_rate()) / 1_000_000;
        self.base_time.wrapping_add(ticks as u32)
    }

    fn max_payload(&self) -> usize {
        // FU-A needs room for its two header bytes plus at least one byte
        self.mtu.saturating_sub(RTP_HEADER_LEN).max(3)
    }

    pub fn packetize(&mut self, frame: &EncodedFrame) -> Vec<Bytes> {
        let timestamp = self.timestamp(frame.pts);
        self.last_time = Some(timestamp);

        let mut out = Vec::new();
        match self.format {
            PayloadFormat::H264 => {
                let units = split_nal_units(&frame.data);
                let count = units.len();
                for (index, nal) in units.into_iter().enumerate() {
                    self.push_nal(nal, timestamp, index + 1 == count, &mut out);
                }
            }
            PayloadFormat::Pcma => {
                let max = self.max_payload();
                for chunk in frame.data.chunks(max) {
                    out.push(self.packet(false, timestamp, &[chunk]));
                }
            }
        }
        out
    }

    /// Single NAL unit packet when it fits, FU-A fragments otherwise. The
    /// marker bit is set on the last packet of the access unit.
    fn push_nal(&mut self, nal: &[u8], timestamp: u32, last_nal: bool, out: &mut Vec<Bytes>) {
        let max = self.max_payload();
        if nal.len() <= max {
            out.push(self.packet(last_nal, timestamp, &[nal]));
            return;
        }

        let indicator = (nal[0] & 0xe0) | NAL_FU_A;
        let nal_type = nal[0] & 0x1f;
        let fragments: Vec<&[u8]> = nal[1..].chunks(max - 2).collect();
        let count = fragments.len();
        for (index, fragment) in fragments.into_iter().enumerate() {
            let end = index + 1 == count;
            let mut header = nal_type;
            if index == 0 {
                header |= 0x80;
            }
            if end {
                header |= 0x40;
            }
            out.push(self.packet(last_nal && end, timestamp, &[&[indicator, header], fragment]));
        }
    }

    fn packet(&mut self, marker: bool, timestamp: u32, parts: &[&[u8]]) -> Bytes {
        let len: usize = parts.iter().map(|p| p.len()).sum();
        let mut buf = BytesMut::with_capacity(RTP_HEADER_LEN + len);
        buf.put_u8(RTP_VERSION << 6);
        buf.put_u8((u8::from(marker) << 7) | self.format.payload_type());
        buf.put_u16(self.seq);
        buf.put_u32(timestamp);
        buf.put_u32(self.ssrc);
        for part in parts {
            buf.put_slice(part);
        }
        self.seq = self.seq.wrapping_add(1);
        self.packets = self.packets.wrapping_add(1);
        self.octets = self.octets.wrapping_add(len as u32);
        buf.freeze()
    }

    /// Compound RTCP packet: sender report followed by an SDES CNAME.
    pub fn sender_report(&self, wallclock: SystemTime, cname: &str) -> Bytes {
        let since_epoch = wallclock.duration_since(UNIX_EPOCH).unwrap_or_default();
        let ntp_secs = since_epoch.as_secs() + NTP_UNIX_OFFSET;
        let ntp_frac = (u64::from(since_epoch.subsec_nanos()) << 32) / 1_000_000_000;

        let mut buf = BytesMut::with_capacity(64);
        buf.put_u8(RTP_VERSION << 6);
        buf.put_u8(RTCP_SR);
        buf.put_u16(6);
        buf.put_u32(self.ssrc);
        buf.put_u32(ntp_secs as u32);
        buf.put_u32(ntp_frac as u32);
        buf.put_u32(self.rtptime());
        buf.put_u32(self.packets);
        buf.put_u32(self.octets);

        let cname = &cname.as_bytes()[..cname.len().min(255)];
        // ssrc, item type and length, text, end-of-list
        let chunk_len = 4 + 2 + cname.len() + 1;
        let padded = chunk_len.div_ceil(4) * 4;
        buf.put_u8((RTP_VERSION << 6) | 1);
        buf.put_u8(RTCP_SDES);
        buf.put_u16((padded / 4) as u16);
        buf.put_u32(self.ssrc);
        buf.put_u8(SDES_CNAME);
        buf.put_u8(cname.len() as u8);
        buf.put_slice(cname);
        buf.put_bytes(0, padded - chunk_len + 1);
        buf.freeze()
    }
}

/// Packet type of the first packet in an RTCP datagram, if it looks like
/// RTCP at all.
pub fn rtcp_packet_type(data: &[u8]) -> Option<u8> {
    if data.len() < 4 || data[0] >> 6 != RTP_VERSION {
        return None;
    }
    (200..=204).contains(&data[1]).then_some(data[1])
}

/// NAL units of an Annex-B byte stream, start codes removed. Data without
/// any start code is taken as a single unit.
pub fn split_nal_units(data: &[u8]) -> Vec<&[u8]> {
    let mut units = Vec::new();
    let mut start = None;
    let mut i = 0;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            if let Some(begin) = start {
                units.push(trim_trailing_zeros(&data[begin..i]));
            }
            i += 3;
            start = Some(i);
        } else {
            i += 1;
        }
    }
    match start {
        Some(begin) => units.push(&data[begin..]),
        None => units.push(data),
    }
    units.retain(|unit| !unit.is_empty());
    units
}

fn trim_trailing_zeros(unit: &[u8]) -> &[u8] {
    let end = unit.iter().rposition(|b| *b != 0).map_or(0, |pos| pos + 1);
    &unit[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(seq: u64, pts_ms: u64, data: Vec<u8>) -> EncodedFrame {
        EncodedFrame {
            seq,
            pts: Duration::from_millis(pts_ms),
            keyframe: seq == 0,
            data: Bytes::from(data),
        }
    }

    fn seq_of(packet: &[u8]) -> u16 {
        u16::from_be_bytes([packet[2], packet[3]])
    }

    fn ts_of(packet: &[u8]) -> u32 {
        u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]])
    }

    #[test]
    fn test_split_nal_units() {
        let data = [0, 0, 0, 1, 0x67, 1, 2, 0, 0, 1, 0x68, 3, 0, 0, 0, 1, 0x65, 4, 5];
        let units = split_nal_units(&data);
        assert_eq!(units, vec![&[0x67, 1, 2][..], &[0x68, 3][..], &[0x65, 4, 5][..]]);
        assert_eq!(split_nal_units(&[0x41, 9]), vec![&[0x41, 9][..]]);
    }

    #[test]
    fn test_small_frame_single_nal_packets() {
        let mut p = Packetizer::new(PayloadFormat::H264, 0xdeadbeef, 100, 5000);
        let packets = p.packetize(&frame(0, 0, vec![0, 0, 0, 1, 0x67, 1, 0, 0, 0, 1, 0x65, 2, 3]));
        assert_eq!(packets.len(), 2);

        let sps = &packets[0];
        assert_eq!(sps[0], 0x80);
        assert_eq!(sps[1], VIDEO_PAYLOAD_TYPE);
        assert_eq!(seq_of(sps), 100);
        assert_eq!(ts_of(sps), 5000);
        assert_eq!(&sps[8..12], &0xdeadbeefu32.to_be_bytes());
        assert_eq!(&sps[12..], &[0x67, 1]);

        let idr = &packets[1];
        assert_eq!(idr[1], 0x80 | VIDEO_PAYLOAD_TYPE);
        assert_eq!(seq_of(idr), 101);
        assert_eq!(&idr[12..], &[0x65, 2, 3]);
        assert_eq!(p.next_seq(), 102);
        assert_eq!(p.octets(), 5);
    }

    #[test]
    fn test_large_nal_fragments_as_fu_a() {
        let mut p = Packetizer::new(PayloadFormat::H264, 1, 0, 0).with_mtu(RTP_HEADER_LEN + 10);
        let mut data = vec![0, 0, 0, 1, 0x65];
        data.extend((1..=20u8).collect::<Vec<_>>());
        let packets = p.packetize(&frame(0, 0, data));

        // 20 body bytes, 8 per fragment
        assert_eq!(packets.len(), 3);
        let headers: Vec<(u8, u8)> = packets.iter().map(|pk| (pk[12], pk[13])).collect();
        assert_eq!(headers[0], (0x60 | NAL_FU_A, 0x80 | 5));
        assert_eq!(headers[1], (0x60 | NAL_FU_A, 5));
        assert_eq!(headers[2], (0x60 | NAL_FU_A, 0x40 | 5));
        assert_eq!(&packets[0][14..], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&packets[2][14..], &[17, 18, 19, 20]);

        // marker only on the end fragment
        assert_eq!(packets[0][1] & 0x80, 0);
        assert_eq!(packets[2][1] & 0x80, 0x80);
        assert!(packets.iter().all(|pk| pk.len() <= RTP_HEADER_LEN + 10));
    }

    #[test]
    fn test_timestamps_follow_capture_time() {
        let mut video = Packetizer::new(PayloadFormat::H264, 1, 65535, u32::MAX - 10);
        let a = video.packetize(&frame(7, 280, vec![0x41, 1]));
        let b = video.packetize(&frame(8, 320, vec![0x41, 2]));
        assert_eq!(ts_of(&a[0]), u32::MAX - 10);
        // 40 ms at 90 kHz, wrapping
        assert_eq!(ts_of(&b[0]), (u32::MAX - 10).wrapping_add(3600));
        assert_eq!(seq_of(&b[0]), 0);

        let mut audio = Packetizer::new(PayloadFormat::Pcma, 2, 0, 0);
        audio.packetize(&frame(0, 0, vec![0xd5; 160]));
        let next = audio.packetize(&frame(1, 20, vec![0xd5; 160]));
        assert_eq!(next[0][1], AUDIO_PAYLOAD_TYPE);
        assert_eq!(ts_of(&next[0]), 160);
        assert_eq!(audio.rtptime(), 160);
    }

    #[test]
    fn test_sender_report_layout() {
        let mut p = Packetizer::new(PayloadFormat::H264, 0x01020304, 0, 900);
        p.packetize(&frame(0, 0, vec![0x65, 1, 2, 3]));
        let report = p.sender_report(UNIX_EPOCH + Duration::from_secs(10), "lite-rtsp");

        assert_eq!(rtcp_packet_type(&report), Some(RTCP_SR));
        assert_eq!(&report[4..8], &[1, 2, 3, 4]);
        assert_eq!(
            u32::from_be_bytes([report[8], report[9], report[10], report[11]]),
            (10 + NTP_UNIX_OFFSET) as u32
        );
        assert_eq!(u32::from_be_bytes([report[16], report[17], report[18], report[19]]), 900);
        assert_eq!(u32::from_be_bytes([report[20], report[21], report[22], report[23]]), 1);
        assert_eq!(u32::from_be_bytes([report[24], report[25], report[26], report[27]]), 4);

        let sdes = &report[28..];
        assert_eq!(sdes[1], RTCP_SDES);
        let words = u16::from_be_bytes([sdes[2], sdes[3]]) as usize;
        assert_eq!(sdes.len(), (words + 1) * 4);
        assert_eq!(&sdes[10..19], b"lite-rtsp");
    }

    #[test]
    fn test_rtcp_packet_type() {
        assert_eq!(rtcp_packet_type(&[0x81, 201, 0, 7]), Some(201));
        assert_eq!(rtcp_packet_type(&[0x80, 96, 0, 0]), None);
        assert_eq!(rtcp_packet_type(&[0x40, 200, 0, 6]), None);
        assert_eq!(rtcp_packet_type(&[0x80]), None);
    }
}
