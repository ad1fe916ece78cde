//! Outbound frame construction.
//!
//! Reliable full frames consume a sequence number, get queued for
//! retransmission and, on encrypted calls, go out (and stay queued) as
//! ciphertext. The sequence-less commands (ACK, INVAL, VNAK, TXCNT, TXACC)
//! are fire-and-forget.

use std::net::SocketAddr;

use tracing::{debug, trace, warn};

use iax2_proto::constants::{FrameType, IaxCommand, FLAG_RETRANS};
use iax2_proto::frame::FullFrame;
use iax2_proto::{build_ies, subclass, Ie};
use iax2_transport::reliable::initial_retry_delay;
use iax2_transport::Seqno;

use crate::call::{CallSlot, CallState};
use crate::error::{EngineError, EngineResult};
use crate::sched::TimerEvent;

use super::Engine;

/// Commands that neither consume a sequence number nor get retransmitted.
/// CALLTOKEN belongs here because the responder holds no call state at all.
pub(crate) fn is_seqless(cmd: IaxCommand) -> bool {
    matches!(
        cmd,
        IaxCommand::Ack
            | IaxCommand::Inval
            | IaxCommand::Vnak
            | IaxCommand::TxCnt
            | IaxCommand::TxAcc
            | IaxCommand::CallToken
    )
}

impl Engine {
    /// Builds, sends and (when reliable) queues one full frame on a locked
    /// slot. The workhorse behind every `send_*` wrapper.
    pub(crate) fn transmit_full(
        &self,
        slot: &mut CallSlot,
        frametype: u8,
        csub: u8,
        payload: Vec<u8>,
        ts_override: Option<u32>,
        reliable: bool,
        final_frame: bool,
        to_transfer_path: bool,
    ) -> EngineResult<()> {
        let now = self.now();
        // An explicit timestamp is either an echo of the trigger frame or a
        // voice timestamp the clock already accounted for; only fresh
        // non-voice frames read the clock here.
        let ts = match ts_override {
            Some(ts) => ts,
            None => slot.tx_clock.nonvoice_ts(now),
        };

        let oseqno = if reliable {
            slot.next_oseqno()
        } else {
            slot.oseqno
        };

        let (addr, dcallno) = if to_transfer_path {
            (
                slot.transfer_addr.unwrap_or(slot.addr),
                slot.transfer_peer_callno,
            )
        } else {
            (slot.addr, slot.peer_callno)
        };

        let frame = FullFrame {
            scallno: slot.callno,
            dcallno,
            retrans: false,
            ts,
            oseqno: oseqno.0,
            iseqno: slot.iseqno.0,
            frametype,
            csub,
            payload,
        };
        if tracing::enabled!(tracing::Level::TRACE) {
            trace!("\n{}", iax2_proto::dump::show_frame("Tx", &frame));
        }
        let mut bytes = frame.encode();
        if slot.enc.active() {
            bytes = slot.enc.encrypt_full(&bytes, &mut *self.rng.lock())?;
        }
        self.transport.send_to(&bytes, addr)?;

        if reliable {
            let delay = initial_retry_delay(slot.pingtime);
            slot.tx
                .push(oseqno, ts, bytes, now, delay, to_transfer_path, final_frame);
            self.arm_retrans_timer(slot);
        }
        if final_frame {
            slot.final_sent = true;
            slot.state = CallState::Terminating;
        }
        Ok(())
    }

    /// Keeps exactly one retransmit timer armed per slot, at the queue's
    /// earliest deadline.
    pub(crate) fn arm_retrans_timer(&self, slot: &mut CallSlot) {
        if let Some(at) = slot.tx.next_deadline() {
            if let Some(old) = slot.timers.retrans.take() {
                self.sched.cancel(old);
            }
            slot.timers.retrans = Some(
                self.sched
                    .schedule(at, TimerEvent::Retransmit(slot.callno)),
            );
        }
    }

    /// Reliable IAX command on a locked slot.
    pub(crate) fn send_command_on(
        &self,
        slot: &mut CallSlot,
        cmd: IaxCommand,
        ies: Vec<Ie>,
    ) -> EngineResult<()> {
        let reliable = !is_seqless(cmd);
        self.transmit_full(
            slot,
            FrameType::Iax as u8,
            cmd as u8,
            build_ies(&ies),
            None,
            reliable,
            false,
            false,
        )
    }

    /// Sequence-less reply echoing the trigger frame's timestamp.
    pub(crate) fn send_seqless_on(
        &self,
        slot: &mut CallSlot,
        cmd: IaxCommand,
        ts: u32,
    ) -> EngineResult<()> {
        self.transmit_full(
            slot,
            FrameType::Iax as u8,
            cmd as u8,
            Vec::new(),
            Some(ts),
            false,
            false,
            false,
        )
    }

    pub fn send_command(&self, callno: u16, cmd: IaxCommand, ies: Vec<Ie>) -> EngineResult<()> {
        self.calls
            .with_slot(callno, |slot| self.send_command_on(slot, cmd, ies))
            .ok_or(EngineError::NoSuchCall(callno))?
    }

    /// Reliable IAX command whose acknowledgment ends the call.
    pub fn send_command_final(
        &self,
        callno: u16,
        cmd: IaxCommand,
        ies: Vec<Ie>,
    ) -> EngineResult<()> {
        self.calls
            .with_slot(callno, |slot| {
                self.transmit_full(
                    slot,
                    FrameType::Iax as u8,
                    cmd as u8,
                    build_ies(&ies),
                    None,
                    true,
                    true,
                    false,
                )
            })
            .ok_or(EngineError::NoSuchCall(callno))?
    }

    /// Generic reliable full frame (control, DTMF, text, ...).
    pub(crate) fn send_full_frame(
        &self,
        callno: u16,
        frametype: u8,
        csub: u8,
        ies: Vec<Ie>,
        payload: &[u8],
    ) -> EngineResult<()> {
        let body = if ies.is_empty() {
            payload.to_vec()
        } else {
            build_ies(&ies)
        };
        self.calls
            .with_slot(callno, |slot| {
                self.transmit_full(slot, frametype, csub, body, None, true, false, false)
            })
            .ok_or(EngineError::NoSuchCall(callno))?
    }

    /// Full voice frame re-anchoring the mini-frame timestamp space.
    pub(crate) fn send_full_voice(
        &self,
        callno: u16,
        format: u64,
        ts: u32,
        payload: &[u8],
    ) -> EngineResult<()> {
        let Some(csub) = subclass::compress(format as i64) else {
            warn!(callno, format, "voice format not encodable as subclass");
            return Err(EngineError::BadCallState(callno));
        };
        self.calls
            .with_slot(callno, |slot| {
                slot.last_full_voice_ts = Some(ts);
                slot.last_voice_format = format;
                self.transmit_full(
                    slot,
                    FrameType::Voice as u8,
                    csub,
                    payload.to_vec(),
                    Some(ts),
                    true,
                    false,
                    false,
                )
            })
            .ok_or(EngineError::NoSuchCall(callno))?
    }

    /// Builds the outgoing NEW for a freshly dialled slot.
    pub(crate) fn send_new(&self, callno: u16) -> EngineResult<()> {
        let now_ms = self.time.now_system_ms();
        self.calls
            .with_slot(callno, |slot| {
                let mut ies = vec![Ie::Version(iax2_proto::constants::IAX_PROTO_VERSION)];
                if let Some(n) = &slot.caller.calling_number {
                    ies.push(Ie::CallingNumber(n.clone()));
                }
                if let Some(n) = &slot.caller.calling_name {
                    ies.push(Ie::CallingName(n.clone()));
                }
                if let Some(n) = &slot.caller.calling_ani {
                    ies.push(Ie::CallingAni(n.clone()));
                }
                if let Some(p) = slot.caller.calling_pres {
                    ies.push(Ie::CallingPres(p));
                }
                if let Some(t) = slot.caller.calling_ton {
                    ies.push(Ie::CallingTon(t));
                }
                if let Some(t) = slot.caller.calling_tns {
                    ies.push(Ie::CallingTns(t));
                }
                if let Some(n) = &slot.caller.called_number {
                    ies.push(Ie::CalledNumber(n.clone()));
                }
                if let Some(c) = &slot.caller.called_context {
                    ies.push(Ie::CalledContext(c.clone()));
                }
                if let Some(d) = &slot.caller.dnid {
                    ies.push(Ie::Dnid(d.clone()));
                }
                if let Some(r) = &slot.caller.rdnis {
                    ies.push(Ie::Rdnis(r.clone()));
                }
                if let Some(l) = &slot.caller.language {
                    ies.push(Ie::Language(l.clone()));
                }
                if let Some(u) = &slot.username {
                    ies.push(Ie::Username(u.clone()));
                }
                // The 64-bit capability goes in the versioned IE, with the
                // 32-bit form alongside for old peers.
                ies.push(Ie::Capability((slot.capability & 0xFFFF_FFFF) as u32));
                ies.push(Ie::Capability2(slot.capability));
                let format = iax2_proto::format::best_format(slot.capability);
                ies.push(Ie::Format((format & 0xFFFF_FFFF) as u32));
                ies.push(Ie::Format2(format));
                if !slot.prefs.is_empty() {
                    ies.push(Ie::CodecPrefs(slot.prefs.to_wire()));
                }
                if slot.enc_offered != 0 {
                    ies.push(Ie::Encryption(slot.enc_offered));
                }
                ies.push(Ie::DateTime(
                    iax2_proto::datetime::WireDateTime::from_unix_ms(now_ms).pack(),
                ));
                if let Some(token) = &slot.calltoken {
                    ies.push(Ie::CallToken(token.clone()));
                }
                self.send_command_on(slot, IaxCommand::New, ies)
            })
            .ok_or(EngineError::NoSuchCall(callno))?
    }

    /// Stateless full frame for addresses with no slot: call-token offers,
    /// apathetic rejects, INVALs and poke answers. Source call number 1 is
    /// reserved for exactly this.
    pub(crate) fn send_apathetic(
        &self,
        addr: SocketAddr,
        dcallno: u16,
        frametype: u8,
        csub: u8,
        ts: u32,
        ies: &[Ie],
    ) {
        let frame = FullFrame {
            scallno: 1,
            dcallno,
            retrans: false,
            ts,
            oseqno: 0,
            iseqno: 0,
            frametype,
            csub,
            payload: build_ies(ies),
        };
        if let Err(e) = self.transport.send_to(&frame.encode(), addr) {
            debug!(%addr, error = %e, "apathetic reply failed");
        }
    }

    /// Retransmits one queued frame: sets the retransmission bit, refreshes
    /// our `iseqno`, and re-pads ciphertext so the new header is not
    /// correlatable with the old.
    pub(crate) fn retransmit_frame(&self, slot: &mut CallSlot, oseqno: Seqno) -> EngineResult<()> {
        let iseqno = slot.iseqno.0;
        let encrypted = slot.enc.active();
        let transfer_addr = slot.transfer_addr;

        // Split borrows: pull what we need from the queue entry first.
        let Some(pending) = slot.tx.get_mut(oseqno) else {
            return Ok(());
        };
        let addr = if pending.transfer {
            transfer_addr.unwrap_or(slot.addr)
        } else {
            slot.addr
        };

        if encrypted {
            let mut plain = slot.enc.decrypt_own(&pending.data)?;
            if plain.len() < 12 {
                return Err(EngineError::DecryptFailed);
            }
            let dword = u16::from_be_bytes([plain[2], plain[3]]) | FLAG_RETRANS;
            plain[2..4].copy_from_slice(&dword.to_be_bytes());
            plain[9] = iseqno;
            let fresh = slot
                .enc
                .encrypt_full(&plain, &mut *self.rng.lock())?;
            if let Some(pending) = slot.tx.get_mut(oseqno) {
                pending.data = fresh;
                self.transport.send_to(&pending.data, addr)?;
            }
        } else {
            if pending.data.len() < 12 {
                return Ok(());
            }
            let dword = u16::from_be_bytes([pending.data[2], pending.data[3]]) | FLAG_RETRANS;
            pending.data[2..4].copy_from_slice(&dword.to_be_bytes());
            pending.data[9] = iseqno;
            self.transport.send_to(&pending.data, addr)?;
        }
        Ok(())
    }
}
