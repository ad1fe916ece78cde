//! Human-readable rendering of frames and IE lists for debug logging.

use std::fmt::Write;

use crate::constants::{ControlKind, FrameType, IaxCommand};
use crate::datetime::WireDateTime;
use crate::format;
use crate::frame::FullFrame;
use crate::ies::{parse_ies, Ie};

fn frametype_name(t: u8) -> &'static str {
    match FrameType::from_wire(t) {
        Some(FrameType::DtmfEnd) => "DTMF_E",
        Some(FrameType::Voice) => "VOICE",
        Some(FrameType::Video) => "VIDEO",
        Some(FrameType::Control) => "CONTROL",
        Some(FrameType::Null) => "NULL",
        Some(FrameType::Iax) => "IAX",
        Some(FrameType::Text) => "TEXT",
        Some(FrameType::Image) => "IMAGE",
        Some(FrameType::Html) => "HTML",
        Some(FrameType::Cng) => "CNG",
        Some(FrameType::Modem) => "MODEM",
        Some(FrameType::DtmfBegin) => "DTMF_B",
        None => "?",
    }
}

fn subclass_name(frametype: u8, csub: u8) -> String {
    match FrameType::from_wire(frametype) {
        Some(FrameType::Iax) => IaxCommand::from_wire(csub)
            .map(|c| c.name().to_string())
            .unwrap_or_else(|| format!("({csub}?)")),
        Some(FrameType::Control) => ControlKind::from_wire(csub)
            .map(|c| format!("{c:?}"))
            .unwrap_or_else(|| format!("({csub}?)")),
        Some(FrameType::DtmfBegin | FrameType::DtmfEnd) => {
            format!("{}", csub as char)
        }
        _ => format!("{csub}"),
    }
}

/// One-line summary of a full frame, in the shape the debug log has always
/// used.
pub fn show_frame(dir: &str, f: &FullFrame) -> String {
    let mut out = format!(
        "{dir}-Frame Retry[{}] -- OSeqno: {:03} ISeqno: {:03} Type: {} Subclass: {}\n",
        if f.retrans { "Yes" } else { " No" },
        f.oseqno,
        f.iseqno,
        frametype_name(f.frametype),
        subclass_name(f.frametype, f.csub),
    );
    let _ = write!(
        out,
        "   Timestamp: {:05}ms  SCall: {:05}  DCall: {:05}",
        f.ts, f.scallno, f.dcallno
    );
    if FrameType::from_wire(f.frametype) == Some(FrameType::Iax) {
        if let Ok(ies) = parse_ies(&f.payload) {
            for ie in &ies {
                let _ = write!(out, "\n   {}", show_ie(ie));
            }
        }
    }
    out
}

/// Renders one IE as `NAME : value`.
pub fn show_ie(ie: &Ie) -> String {
    match ie {
        Ie::CalledNumber(s) => format!("CALLED NUMBER   : {s}"),
        Ie::CallingNumber(s) => format!("CALLING NUMBER  : {s}"),
        Ie::CallingAni(s) => format!("ANI             : {s}"),
        Ie::CallingName(s) => format!("CALLING NAME    : {s}"),
        Ie::CalledContext(s) => format!("CALLED CONTEXT  : {s}"),
        Ie::Username(s) => format!("USERNAME        : {s}"),
        Ie::Password(_) => "PASSWORD        : <hidden>".to_string(),
        Ie::Capability(v) => format!(
            "CAPABILITY      : {}",
            format::mask_to_string(u64::from(*v))
        ),
        Ie::Capability2(v) => format!("CAPABILITY2     : {}", format::mask_to_string(*v)),
        Ie::Format(v) => format!("FORMAT          : {}", format::mask_to_string(u64::from(*v))),
        Ie::Format2(v) => format!("FORMAT2         : {}", format::mask_to_string(*v)),
        Ie::Language(s) => format!("LANGUAGE        : {s}"),
        Ie::Version(v) => format!("VERSION         : {v}"),
        Ie::AdsiCpe(v) => format!("ADSICPE         : {v}"),
        Ie::Dnid(s) => format!("DNID            : {s}"),
        Ie::AuthMethods(v) => format!("AUTHMETHODS     : {v}"),
        Ie::Challenge(s) => {
            let mut hexed = String::new();
            for b in s.as_bytes() {
                let _ = write!(hexed, "\\x{b:02x}");
            }
            format!("CHALLENGE       : {hexed}")
        }
        Ie::Md5Result(s) => format!("MD5 RESULT      : {s}"),
        Ie::RsaResult(d) => format!("RSA RESULT      : {} bytes", d.len()),
        Ie::ApparentAddr(a) => format!("APPARENT ADDRESS: {a}"),
        Ie::Refresh(v) => format!("REFRESH         : {v}"),
        Ie::DpStatus(v) => format!("DIALPLAN STATUS : {v}"),
        Ie::CallNo(v) => format!("CALL NUMBER     : {v}"),
        Ie::Cause(s) => format!("CAUSE           : {s}"),
        Ie::UnknownCmd(v) => format!("UNKNOWN IAX CMD : {v}"),
        Ie::MsgCount(v) => format!("MESSAGE COUNT   : {v}"),
        Ie::AutoAnswer => "AUTO ANSWER REQ : Present".to_string(),
        Ie::MusicOnHold => "MUSICONHOLD     : Present".to_string(),
        Ie::TransferId(v) => format!("TRANSFER ID     : {v}"),
        Ie::Rdnis(s) => format!("REFERRING DNIS  : {s}"),
        Ie::DateTime(v) => {
            let dt = WireDateTime::unpack(*v);
            format!(
                "DATE TIME       : {:04}-{:02}-{:02}  {:02}:{:02}:{:02}",
                dt.year, dt.month, dt.day, dt.hour, dt.minute, dt.second
            )
        }
        Ie::DeviceType(s) => format!("DEVICE TYPE     : {s}"),
        Ie::ServiceIdent(s) => format!("SERVICE IDENT   : {s}"),
        Ie::FirmwareVer(v) => format!("FIRMWARE VER    : {v}"),
        Ie::FwBlockDesc(v) => format!("FW BLOCK DESC   : {v}"),
        Ie::FwBlockData(d) => format!("FW BLOCK DATA   : {} bytes", d.len()),
        Ie::CallingPres(v) => format!("CALLING PRESNTN : {v}"),
        Ie::CallingTon(v) => format!("CALLING TYPEOFNUM: {v}"),
        Ie::CallingTns(v) => format!("CALLING TRANSITNET: {v}"),
        Ie::CallingAni2(v) => format!("CALLING ANI2    : {v}"),
        Ie::SamplingRate(v) => format!("SAMPLINGRATE    : {v:#06x}"),
        Ie::CauseCode(v) => format!("CAUSE CODE      : {v}"),
        Ie::Encryption(v) => format!("ENCRYPTION      : {v}"),
        Ie::EncKey(_) => "ENCRYPTION KEY  : <hidden>".to_string(),
        Ie::CodecPrefs(s) => format!("CODEC_PREFS     : {s}"),
        Ie::RrJitter(v) => format!("RR_JITTER       : {v}"),
        Ie::RrLoss(v) => format!("RR_LOSS         : {v}"),
        Ie::RrPkts(v) => format!("RR_PKTS         : {v}"),
        Ie::RrDelay(v) => format!("RR_DELAY        : {v}"),
        Ie::RrDropped(v) => format!("RR_DROPPED      : {v}"),
        Ie::RrOoo(v) => format!("RR_OUTOFORDER   : {v}"),
        Ie::Variable(s) => format!("VARIABLE        : {s}"),
        Ie::OspToken { block, data } => format!("OSPTOKEN        : block {block}, {} bytes", data.len()),
        Ie::CallToken(d) => {
            if d.is_empty() {
                "CALLTOKEN       : Requested".to_string()
            } else {
                format!("CALLTOKEN       : {} bytes", d.len())
            }
        }
        Ie::Unknown { ie, data } => format!("Unknown IE {ie:03}  : {} bytes", data.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{FrameType, IaxCommand};
    use crate::ies::build_ies;

    #[test]
    fn renders_a_new_frame() {
        let payload = build_ies(&[
            Ie::Version(2),
            Ie::Username("alice".into()),
            Ie::CalledNumber("100".into()),
        ]);
        let f = FullFrame {
            scallno: 7,
            dcallno: 0,
            retrans: false,
            ts: 4,
            oseqno: 0,
            iseqno: 0,
            frametype: FrameType::Iax as u8,
            csub: IaxCommand::New as u8,
            payload,
        };
        let s = show_frame("Tx", &f);
        assert!(s.contains("Type: IAX"));
        assert!(s.contains("Subclass: NEW"));
        assert!(s.contains("USERNAME        : alice"));
    }
}
