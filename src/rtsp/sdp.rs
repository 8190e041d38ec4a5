use std::fmt::Write as _;

use crate::capability::MediaCapability;

pub const VIDEO_PAYLOAD_TYPE: u8 = 96;
/// PCMA, static payload type.
pub const AUDIO_PAYLOAD_TYPE: u8 = 8;

pub const VIDEO_TRACK: u8 = 0;
pub const AUDIO_TRACK: u8 = 1;

/// Session description for one profile: H.264 on `track0`, G.711 A-law on
/// `track1` when the profile carries audio.
pub fn describe(cap: &MediaCapability, origin_id: u64, host: &str) -> String {
    let mut sdp = String::with_capacity(512);
    // writing into a String cannot fail
    let _ = write!(sdp, "v=0\r\n");
    let _ = write!(sdp, "o=- {} 1 IN IP4 {}\r\n", origin_id, host);
    let _ = write!(sdp, "s={}\r\n", cap.token);
    let _ = write!(sdp, "c=IN IP4 0.0.0.0\r\n");
    let _ = write!(sdp, "t=0 0\r\n");
    let _ = write!(sdp, "a=control:*\r\n");
    let _ = write!(sdp, "a=range:npt=0-\r\n");

    let _ = write!(sdp, "m=video 0 RTP/AVP {}\r\n", VIDEO_PAYLOAD_TYPE);
    if cap.bitrate_kbps > 0 {
        let _ = write!(sdp, "b=AS:{}\r\n", cap.bitrate_kbps);
    }
    let _ = write!(sdp, "a=rtpmap:{} H264/90000\r\n", VIDEO_PAYLOAD_TYPE);
    let _ = write!(
        sdp,
        "a=fmtp:{} packetization-mode=1\r\n",
        VIDEO_PAYLOAD_TYPE
    );
    if cap.width > 0 && cap.height > 0 {
        let _ = write!(sdp, "a=cliprect:0,0,{},{}\r\n", cap.height, cap.width);
    }
    if cap.fps > 0 {
        let _ = write!(sdp, "a=framerate:{}\r\n", cap.fps);
    }
    let _ = write!(sdp, "a=recvonly\r\n");
    let _ = write!(sdp, "a=control:track{}\r\n", VIDEO_TRACK);

    if cap.audio_enabled {
        let _ = write!(sdp, "m=audio 0 RTP/AVP {}\r\n", AUDIO_PAYLOAD_TYPE);
        let _ = write!(sdp, "a=rtpmap:{} PCMA/8000/1\r\n", AUDIO_PAYLOAD_TYPE);
        let _ = write!(sdp, "a=recvonly\r\n");
        let _ = write!(sdp, "a=control:track{}\r\n", AUDIO_TRACK);
    }
    sdp
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::MediaCapability;

    fn cap(audio: bool) -> MediaCapability {
        MediaCapability {
            token: "main".into(),
            path: "/vs0".into(),
            width: 1920,
            height: 1080,
            fps: 25,
            bitrate_kbps: 4096,
            audio_enabled: audio,
            session_timeout: None,
            secure_supported: false,
        }
    }

    #[test]
    fn test_video_only() {
        let sdp = describe(&cap(false), 42, "10.0.0.2");
        assert!(sdp.starts_with("v=0\r\no=- 42 1 IN IP4 10.0.0.2\r\ns=main\r\n"));
        assert!(sdp.contains("m=video 0 RTP/AVP 96\r\n"));
        assert!(sdp.contains("a=rtpmap:96 H264/90000\r\n"));
        assert!(sdp.contains("b=AS:4096\r\n"));
        assert!(sdp.contains("a=framerate:25\r\n"));
        assert!(sdp.contains("a=control:track0\r\n"));
        assert!(!sdp.contains("m=audio"));
    }

    #[test]
    fn test_with_audio() {
        let sdp = describe(&cap(true), 1, "cam");
        assert!(sdp.contains("m=audio 0 RTP/AVP 8\r\na=rtpmap:8 PCMA/8000/1\r\n"));
        assert!(sdp.ends_with("a=control:track1\r\n"));
    }
}
