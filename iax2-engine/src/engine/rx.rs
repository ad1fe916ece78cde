//! Inbound datagram processing: classification, slot resolution, sequence
//! discipline and decryption. Command semantics live in `handlers`.

use std::net::SocketAddr;

use tracing::{debug, trace, warn};

use iax2_proto::constants::{cause, FrameType, IaxCommand, FLAG_FULL, FULL_HDR_LEN};
use iax2_proto::frame::{Frame, FullFrame, MiniFrame, TrunkFrame, VideoFrame};
use iax2_proto::{Ie, IeSet};
use iax2_transport::jitter::{JitterFrame, MediaKind};
use iax2_transport::Seqno;

use crate::call::{CallState, Direction, SlotKind};
use crate::config::CallTokenPolicy;
use crate::error::EngineError;
use crate::events::MediaDirection;

use super::tx::is_seqless;
use super::Engine;

impl Engine {
    /// Entry point for one received datagram. Runs to completion on the
    /// calling worker thread.
    pub fn handle_datagram(&self, data: &[u8], from: SocketAddr) {
        if self.is_shutting_down() || data.len() < 4 {
            return;
        }
        let word0 = u16::from_be_bytes([data[0], data[1]]);
        if word0 & FLAG_FULL != 0 {
            self.handle_full_datagram(data, from);
            return;
        }
        match Frame::decode(data) {
            Ok(Frame::Mini(mini)) => self.handle_mini(mini, from),
            Ok(Frame::Video(video)) => self.handle_video(video, from),
            Ok(Frame::Trunk(trunk)) => self.handle_trunk(trunk, from),
            Ok(Frame::Full(_)) => unreachable!("full bit checked above"),
            Err(e) => {
                debug!(%from, error = %e, "undecodable datagram dropped");
            }
        }
    }

    /// Full frames resolve their slot first because encrypted ones cannot be
    /// parsed until the slot's keys are known.
    fn handle_full_datagram(&self, data: &[u8], from: SocketAddr) {
        if data.len() < FULL_HDR_LEN {
            debug!(%from, "short full frame");
            return;
        }
        let scallno = u16::from_be_bytes([data[0], data[1]]) & 0x7FFF;
        let dcallno = u16::from_be_bytes([data[2], data[3]]) & 0x7FFF;

        let callno = self.resolve_slot(from, scallno, dcallno);

        let Some(callno) = callno else {
            // No slot: only the handful of call-starting commands may
            // allocate one; anything else gets an INVAL.
            match FullFrame::decode(data) {
                Ok(frame) => self.handle_unmatched_full(frame, from),
                Err(e) => debug!(%from, error = %e, "bad full frame dropped"),
            }
            return;
        };

        // Decrypt under the slot lock, then reparse.
        let decrypted = self.calls.with_slot(callno, |slot| {
            if slot.enc.active() {
                slot.enc.decrypt_full(data).map(Some)
            } else {
                Ok(None)
            }
        });
        let bytes = match decrypted {
            Some(Ok(Some(plain))) => plain,
            Some(Ok(None)) => data.to_vec(),
            Some(Err(_)) => {
                // A frame that will not decrypt is protocol abort territory,
                // but a single one may just be stray; ask for retransmits.
                warn!(callno, %from, "frame failed to decrypt, sending VNAK");
                self.calls.with_slot(callno, |slot| {
                    let _ = self.send_seqless_on(slot, IaxCommand::Vnak, 0);
                });
                return;
            }
            None => return,
        };

        match FullFrame::decode(&bytes) {
            Ok(frame) => self.process_full(callno, frame, from),
            Err(e) => {
                debug!(callno, %from, error = %e, "bad full frame, replying INVAL");
                self.send_apathetic(from, scallno, FrameType::Iax as u8, IaxCommand::Inval as u8, 0, &[]);
            }
        }
    }

    /// Finds the local slot a full frame belongs to: our number when the
    /// sender echoes it, otherwise the (addr, their number) map, otherwise
    /// the transfer map.
    fn resolve_slot(&self, from: SocketAddr, scallno: u16, dcallno: u16) -> Option<u16> {
        if dcallno != 0 && dcallno != 1 {
            let matched = self.calls.with_slot(dcallno, |slot| {
                (slot.addr == from && (slot.peer_callno == 0 || slot.peer_callno == scallno))
                    // Transfer probes arrive from the counterpart's address.
                    || slot.transfer_addr == Some(from)
            });
            if matched == Some(true) {
                return Some(dcallno);
            }
        }
        if let Some(callno) = self.calls.find_by_peer(from, scallno) {
            return Some(callno);
        }
        self.calls.find_by_transfer(from, scallno)
    }

    /// Sequence discipline and dispatch for a frame that found its slot.
    fn process_full(&self, callno: u16, frame: FullFrame, from: SocketAddr) {
        let now = self.now();
        let frametype = FrameType::from_wire(frame.frametype);
        let iax_cmd = match frametype {
            Some(FrameType::Iax) => IaxCommand::from_wire(frame.csub),
            _ => None,
        };
        let seqless = iax_cmd.map(is_seqless).unwrap_or(false);

        enum SeqVerdict {
            Process,
            ReAck(u32),
            Vnak(u8),
        }

        let verdict = self.calls.with_slot(callno, |slot| {
            slot.last_rx = now;

            // Learn the peer's call number from its first full frame.
            // Source number 1 is the stateless-reply number, never a call.
            if slot.peer_callno == 0 && frame.scallno > 1 {
                slot.peer_callno = frame.scallno;
                self.calls.link_peer(from, frame.scallno, callno);
            }

            // Implicit acknowledgment by the frame's iseqno.
            let released = slot.tx.ack(Seqno(frame.iseqno));
            if released.count > 0 {
                trace!(callno, released = released.count, "frames acked");
                self.arm_retrans_timer(slot);
            }
            if released.final_acked {
                slot.state = CallState::Dead;
            }

            if seqless {
                return SeqVerdict::Process;
            }
            if frame.oseqno == slot.iseqno.0 {
                slot.iseqno = slot.iseqno.next();
                slot.rx_clock.on_full_frame(frame.ts);
                return SeqVerdict::Process;
            }
            let behind = Seqno(frame.oseqno).precedes(slot.iseqno);
            if behind {
                // A retransmission of something already consumed; the ack
                // must have been lost. Re-ack, do not reprocess.
                SeqVerdict::ReAck(frame.ts)
            } else {
                SeqVerdict::Vnak(slot.iseqno.0)
            }
        });

        match verdict {
            None => {}
            Some(SeqVerdict::Process) => {
                if tracing::enabled!(tracing::Level::TRACE) {
                    trace!("\n{}", iax2_proto::dump::show_frame("Rx", &frame));
                }
                self.dispatch_full(callno, frame, from);
                self.reap_if_dead(callno);
            }
            Some(SeqVerdict::ReAck(ts)) => {
                self.calls.with_slot(callno, |slot| {
                    let _ = self.send_seqless_on(slot, IaxCommand::Ack, ts);
                });
            }
            Some(SeqVerdict::Vnak(iseqno)) => {
                debug!(callno, got = frame.oseqno, expected = iseqno, "out of order, VNAK");
                self.calls.with_slot(callno, |slot| {
                    let _ = self.send_seqless_on(slot, IaxCommand::Vnak, 0);
                });
            }
        }
    }

    /// A slot marked dead by the final-frame ack (or a handler) is reaped
    /// once the dispatch that noticed it returns.
    pub(crate) fn reap_if_dead(&self, callno: u16) {
        let dead = self
            .calls
            .with_slot(callno, |slot| slot.state == CallState::Dead)
            .unwrap_or(false);
        if dead {
            self.destroy_call(callno, false);
        }
    }

    /// Full frame with no matching slot: NEW, REGREQ/REGREL and POKE may
    /// start one; stray ACK-family frames are ignored; everything else is
    /// answered with INVAL so a confused peer can kill its leg.
    fn handle_unmatched_full(&self, frame: FullFrame, from: SocketAddr) {
        let cmd = match FrameType::from_wire(frame.frametype) {
            Some(FrameType::Iax) => IaxCommand::from_wire(frame.csub),
            _ => None,
        };
        let ies = match IeSet::parse(&frame.payload) {
            Ok(ies) => ies,
            Err(e) => {
                debug!(%from, error = %e, "IE parse failure on unmatched frame");
                self.send_apathetic(
                    from,
                    frame.scallno,
                    FrameType::Iax as u8,
                    IaxCommand::Inval as u8,
                    frame.ts,
                    &[],
                );
                return;
            }
        };

        match cmd {
            Some(IaxCommand::New) => self.start_inbound(frame, ies, from, SlotKind::Call),
            Some(IaxCommand::RegReq) | Some(IaxCommand::RegRel) => {
                self.start_inbound(frame, ies, from, SlotKind::Registration)
            }
            Some(IaxCommand::Poke) => {
                // Pokes stay stateless on the answering side.
                self.send_apathetic(
                    from,
                    frame.scallno,
                    FrameType::Iax as u8,
                    IaxCommand::Pong as u8,
                    frame.ts,
                    &[],
                );
            }
            Some(IaxCommand::FwDownl) => {
                // Firmware serving is out of scope for the engine.
                self.send_apathetic(
                    from,
                    frame.scallno,
                    FrameType::Iax as u8,
                    IaxCommand::Reject as u8,
                    frame.ts,
                    &[Ie::Cause("no firmware available".into())],
                );
            }
            Some(IaxCommand::Ack) | Some(IaxCommand::Inval) | Some(IaxCommand::Vnak) => {
                trace!(%from, "stray ack-family frame ignored");
            }
            Some(IaxCommand::TxCnt) => {
                // Transfer probe for a call we cannot find; reject the path.
                self.send_apathetic(
                    from,
                    frame.scallno,
                    FrameType::Iax as u8,
                    IaxCommand::TxRej as u8,
                    frame.ts,
                    &[],
                );
            }
            _ => {
                self.send_apathetic(
                    from,
                    frame.scallno,
                    FrameType::Iax as u8,
                    IaxCommand::Inval as u8,
                    frame.ts,
                    &[],
                );
            }
        }
    }

    /// Call-token enforcement and slot allocation for NEW/REGREQ.
    fn start_inbound(&self, frame: FullFrame, ies: IeSet, from: SocketAddr, kind: SlotKind) {
        let identity = ies.username.clone();
        let policy = self.token_policy_for(identity.as_deref());
        let required = self
            .tokens
            .required_for(policy, from, self.token_ignores());

        let mut validated = false;
        match (&ies.calltoken, ies.calltoken_seen) {
            (Some(token), _) => {
                let now_ms = self.time.now_system_ms();
                if self.tokens.validate(from, token, now_ms).is_err() {
                    warn!(%from, "invalid call token");
                    self.apathetic_reject(frame.scallno, from, frame.ts, "invalid call token");
                    return;
                }
                validated = true;
            }
            (None, true) => {
                // Empty CALLTOKEN IE: the sender asks for a token. No state
                // is allocated for this exchange.
                let token = self.tokens.create(from, self.time.now_system_ms());
                self.send_apathetic(
                    from,
                    frame.scallno,
                    FrameType::Iax as u8,
                    IaxCommand::CallToken as u8,
                    frame.ts,
                    &[Ie::CallToken(token)],
                );
                return;
            }
            (None, false) => {
                if required || policy == CallTokenPolicy::Required {
                    let token = self.tokens.create(from, self.time.now_system_ms());
                    self.send_apathetic(
                        from,
                        frame.scallno,
                        FrameType::Iax as u8,
                        IaxCommand::CallToken as u8,
                        frame.ts,
                        &[Ie::CallToken(token)],
                    );
                    return;
                }
            }
        }

        let callno = match self.allocate_slot(
            from,
            Direction::Inbound,
            kind,
            false,
            validated,
            identity.as_deref(),
        ) {
            Ok(n) => n,
            Err(
                e @ (EngineError::PoolExhausted
                | EngineError::PeerLimitExceeded(_)
                | EngineError::NonvalidatedQuotaExceeded),
            ) => {
                warn!(%from, error = %e, "inbound call refused");
                self.apathetic_reject(frame.scallno, from, frame.ts, "congestion");
                return;
            }
            Err(e) => {
                warn!(%from, error = %e, "slot allocation failed");
                return;
            }
        };

        self.calls.with_slot(callno, |slot| {
            slot.peer_callno = frame.scallno;
            slot.iseqno = Seqno(frame.oseqno.wrapping_add(1));
            slot.rx_clock.on_full_frame(frame.ts);
        });
        self.calls.link_peer(from, frame.scallno, callno);

        let Some(cmd) = IaxCommand::from_wire(frame.csub) else {
            return;
        };
        self.dispatch_new_slot(callno, cmd, frame, ies, from);
        self.reap_if_dead(callno);
    }

    /// Apathetic REJECT honoring the delayed-reject setting for the token
    /// path.
    pub(crate) fn apathetic_reject(&self, dcallno: u16, from: SocketAddr, ts: u32, text: &str) {
        // No slot exists, so a delayed apathetic reject has nowhere to live;
        // the deferral only applies to calls that got a slot.
        self.send_apathetic(
            from,
            dcallno,
            FrameType::Iax as u8,
            IaxCommand::Reject as u8,
            ts,
            &[
                Ie::Cause(text.to_string()),
                Ie::CauseCode(cause::CALL_REJECTED),
            ],
        );
    }

    // ---- Media paths ------------------------------------------------------

    fn handle_mini(&self, mini: MiniFrame, from: SocketAddr) {
        let Some(callno) = self.calls.find_by_peer(from, mini.scallno) else {
            trace!(%from, scallno = mini.scallno, "mini frame for unknown call");
            return;
        };
        self.deliver_audio(callno, mini.ts, &mini.payload);
    }

    pub(crate) fn deliver_audio(&self, callno: u16, ts16: u16, payload: &[u8]) {
        let now = self.now();
        let delivered = self.calls.with_slot(callno, |slot| {
            if !slot.is_up() || slot.quelched {
                return None;
            }
            let ts = slot.rx_clock.extend_audio(ts16);
            match slot.jb.as_mut() {
                Some(jb) => {
                    jb.put(
                        JitterFrame {
                            ts,
                            kind: MediaKind::Voice,
                            len_ms: 20,
                            data: payload.to_vec(),
                        },
                        now,
                    );
                    None
                }
                None => Some(ts),
            }
        });
        if let Some(Some(ts)) = delivered {
            self.events
                .on_media(callno, MediaDirection::Audio, ts, payload);
        }
    }

    fn handle_video(&self, video: VideoFrame, from: SocketAddr) {
        let Some(callno) = self.calls.find_by_peer(from, video.scallno) else {
            return;
        };
        let ts = self.calls.with_slot(callno, |slot| {
            if !slot.is_up() {
                return None;
            }
            Some(slot.rx_clock.extend_video(video.ts))
        });
        if let Some(Some(ts)) = ts {
            self.events.on_media(
                callno,
                MediaDirection::Video { mark: video.mark },
                ts,
                &video.payload,
            );
        }
    }

    /// Unbundles a trunk frame: every entry is an audio frame for one of the
    /// sender's calls.
    fn handle_trunk(&self, trunk: TrunkFrame, from: SocketAddr) {
        for entry in &trunk.entries {
            let Some(callno) = self.calls.find_by_peer(from, entry.callno) else {
                continue;
            };
            // Without per-entry timestamps the trunk base stands in.
            let ts16 = entry.ts.unwrap_or(trunk.ts as u16);
            self.deliver_audio(callno, ts16, &entry.payload);
        }
    }
}
