//! Per-command semantics for full frames that passed the sequence
//! discipline. One function per protocol exchange, all running on the
//! worker that received the datagram.

use std::net::SocketAddr;
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use iax2_proto::constants::{
    cause, ControlKind, FrameType, IaxCommand, AUTH_MD5, AUTH_PLAINTEXT, AUTH_RSA, ENCRYPT_AES128,
    IAX_PROTO_VERSION,
};
use iax2_proto::datetime::WireDateTime;
use iax2_proto::frame::FullFrame;
use iax2_proto::{format, subclass, Ie, IeSet};
use iax2_transport::jitter::{JitterFrame, MediaKind};
use iax2_transport::Seqno;

use crate::auth;
use crate::call::{CallSlot, CallState, Direction, SlotKind, TransferState};
use crate::config::CodecPriority;
use crate::crypto;
use crate::events::{CallDisposition, CallOffer, MediaDirection, PeerStatusEvent, RegEvent};
use crate::registry::{format_binding, PeerStatus};
use crate::sched::TimerEvent;

use super::Engine;

/// Interval bounds for mid-call key rotation.
const KEYROTATE_MIN: Duration = Duration::from_secs(120);
const KEYROTATE_MAX: Duration = Duration::from_secs(300);

impl Engine {
    /// First command on a freshly allocated inbound slot.
    pub(crate) fn dispatch_new_slot(
        &self,
        callno: u16,
        cmd: IaxCommand,
        frame: FullFrame,
        ies: IeSet,
        from: SocketAddr,
    ) {
        match cmd {
            IaxCommand::New => self.handle_new(callno, &frame, ies, from),
            IaxCommand::RegReq => self.handle_regreq(callno, &frame, ies, from, false),
            IaxCommand::RegRel => self.handle_regreq(callno, &frame, ies, from, true),
            _ => unreachable!("rx admits only call-starting commands"),
        }
    }

    /// Frame dispatch for an established slot.
    pub(crate) fn dispatch_full(&self, callno: u16, frame: FullFrame, from: SocketAddr) {
        match FrameType::from_wire(frame.frametype) {
            Some(FrameType::Iax) => self.dispatch_iax(callno, frame, from),
            Some(FrameType::Voice) => self.handle_full_voice(callno, frame),
            Some(FrameType::Video) => self.handle_full_video(callno, frame),
            Some(FrameType::Control) => self.handle_control(callno, frame),
            Some(FrameType::DtmfBegin) => self.ack_only(callno, frame.ts),
            Some(FrameType::DtmfEnd) => {
                self.ack_only(callno, frame.ts);
                self.events.on_dtmf(callno, frame.csub as char);
            }
            Some(FrameType::Text) => {
                self.ack_only(callno, frame.ts);
                let text = String::from_utf8_lossy(&frame.payload);
                self.events.on_text(callno, &text);
            }
            Some(FrameType::Cng) => {
                self.ack_only(callno, frame.ts);
                self.calls.with_slot(callno, |slot| slot.tx_clock.mark_silent());
            }
            Some(FrameType::Null) => self.ack_only(callno, frame.ts),
            Some(FrameType::Image) | Some(FrameType::Html) | Some(FrameType::Modem) => {
                self.ack_only(callno, frame.ts);
            }
            None => {
                debug!(callno, frametype = frame.frametype, "undefined frame type");
                self.calls.with_slot(callno, |slot| {
                    let _ = self.send_seqless_on(slot, IaxCommand::Inval, frame.ts);
                });
            }
        }
    }

    fn dispatch_iax(&self, callno: u16, frame: FullFrame, from: SocketAddr) {
        let ies = match IeSet::parse(&frame.payload) {
            Ok(ies) => ies,
            Err(e) => {
                debug!(callno, error = %e, "IE parse failure");
                self.calls.with_slot(callno, |slot| {
                    let _ = self.send_seqless_on(slot, IaxCommand::Inval, frame.ts);
                });
                return;
            }
        };
        let Some(cmd) = IaxCommand::from_wire(frame.csub) else {
            self.reply_unsupported(callno, frame.csub, frame.ts);
            return;
        };
        trace!(callno, cmd = cmd.name(), "IAX command in");

        match cmd {
            IaxCommand::New => self.ack_only(callno, frame.ts),
            IaxCommand::Ping => self.handle_ping(callno, &frame),
            IaxCommand::Pong => self.handle_pong(callno, &frame, &ies),
            IaxCommand::Ack => self.handle_ack(callno),
            IaxCommand::Hangup => self.handle_hangup(callno, &frame, &ies),
            IaxCommand::Reject => self.handle_reject(callno, &frame, &ies),
            IaxCommand::Accept => self.handle_accept(callno, &frame, &ies),
            IaxCommand::AuthReq => self.handle_authreq(callno, &frame, &ies),
            IaxCommand::AuthRep => self.handle_authrep(callno, &frame, &ies, from),
            IaxCommand::Inval => {
                debug!(callno, "peer says the call is invalid");
                self.calls.with_slot(callno, |slot| {
                    slot.hangup_cause = Some("invalid call".into());
                    slot.state = CallState::Dead;
                });
                self.destroy_call(callno, true);
            }
            IaxCommand::LagRq => {
                // Echo through the whole receive path so the peer measures
                // true lag.
                self.calls.with_slot(callno, |slot| {
                    let _ = self.transmit_full(
                        slot,
                        FrameType::Iax as u8,
                        IaxCommand::LagRp as u8,
                        Vec::new(),
                        Some(frame.ts),
                        true,
                        false,
                        false,
                    );
                });
            }
            IaxCommand::LagRp => self.handle_lagrp(callno, &frame),
            IaxCommand::RegReq | IaxCommand::RegRel => {
                // A re-registration arriving on the still-live exchange slot.
                self.handle_regreq(callno, &frame, ies, from, cmd == IaxCommand::RegRel)
            }
            IaxCommand::RegAuth => self.handle_regauth(callno, &frame, &ies),
            IaxCommand::RegAck => self.handle_regack(callno, &frame, &ies),
            IaxCommand::RegRej => self.handle_regrej(callno, &frame, &ies),
            IaxCommand::Vnak => self.handle_vnak(callno, &frame),
            IaxCommand::DpReq => self.handle_dpreq(callno, &frame, &ies),
            IaxCommand::DpRep => self.ack_only(callno, frame.ts),
            IaxCommand::Dial => self.handle_dial(callno, &frame, &ies),
            IaxCommand::TxReq => self.handle_txreq(callno, &frame, &ies),
            IaxCommand::TxCnt => self.handle_txcnt(callno, &frame, &ies, from),
            IaxCommand::TxAcc => self.handle_txacc(callno, &frame, &ies),
            IaxCommand::TxReady => self.handle_txready(callno, &frame),
            IaxCommand::TxRel => self.handle_txrel(callno, &frame, &ies),
            IaxCommand::TxRej => self.handle_txrej(callno, &frame),
            IaxCommand::TxMedia => self.handle_txmedia(callno, &frame),
            IaxCommand::Quelch => {
                self.ack_only(callno, frame.ts);
                self.calls.with_slot(callno, |slot| {
                    slot.quelched = true;
                    slot.moh_on_quelch = ies.musiconhold;
                });
                self.events.on_control(callno, ControlKind::Hold);
            }
            IaxCommand::Unquelch => {
                self.ack_only(callno, frame.ts);
                self.calls.with_slot(callno, |slot| slot.quelched = false);
                self.events.on_control(callno, ControlKind::Unhold);
            }
            IaxCommand::Poke => {
                // A poke that landed on a live slot still just wants a PONG.
                self.calls.with_slot(callno, |slot| {
                    let _ = self.transmit_full(
                        slot,
                        FrameType::Iax as u8,
                        IaxCommand::Pong as u8,
                        Vec::new(),
                        Some(frame.ts),
                        true,
                        false,
                        false,
                    );
                });
            }
            IaxCommand::Mwi => {
                self.ack_only(callno, frame.ts);
                self.events.on_mwi(callno, ies.msgcount.unwrap_or(0));
            }
            IaxCommand::Unsupport => {
                warn!(
                    callno,
                    cmd = ies.iax_unknown.unwrap_or(0),
                    "peer does not support a command we sent"
                );
                self.ack_only(callno, frame.ts);
            }
            IaxCommand::Transfer => {
                self.ack_only(callno, frame.ts);
                if let Some(number) = &ies.called_number {
                    self.events.on_transfer_requested(callno, number);
                }
            }
            IaxCommand::FwDownl | IaxCommand::FwData => {
                // Firmware exchange is not served by the engine.
                self.calls.with_slot(callno, |slot| {
                    let _ = self.send_command_on(
                        slot,
                        IaxCommand::Reject,
                        vec![Ie::Cause("no firmware available".into())],
                    );
                });
            }
            IaxCommand::RtKey => self.handle_rtkey(callno, &frame, &ies),
            IaxCommand::CallToken => self.handle_calltoken_demand(callno, &ies),
            IaxCommand::Page | IaxCommand::Provision => {
                self.reply_unsupported(callno, frame.csub, frame.ts)
            }
        }
    }

    fn ack_only(&self, callno: u16, ts: u32) {
        self.calls.with_slot(callno, |slot| {
            let _ = self.send_seqless_on(slot, IaxCommand::Ack, ts);
        });
    }

    fn reply_unsupported(&self, callno: u16, csub: u8, _ts: u32) {
        debug!(callno, csub, "unsupported command");
        self.calls.with_slot(callno, |slot| {
            let _ = self.send_command_on(
                slot,
                IaxCommand::Unsupport,
                vec![Ie::UnknownCmd(csub)],
            );
        });
    }

    // ---- Call setup -------------------------------------------------------

    fn handle_new(&self, callno: u16, _frame: &FullFrame, ies: IeSet, from: SocketAddr) {
        if let Some(version) = ies.version {
            if version != IAX_PROTO_VERSION {
                warn!(callno, version, "unsupported protocol version");
                self.reject_call(callno, "unsupported protocol version", cause::FACILITY_REJECTED);
                return;
            }
        }

        let user = self.registry.best_user(ies.username.as_deref(), from);
        let Some(user) = user else {
            if self.config.auth_debug {
                info!(%from, username = ?ies.username, "no matching user for NEW");
            }
            self.reject_call(callno, "No authority found", cause::CALL_REJECTED);
            return;
        };

        // Stash everything the offer and the auth continuation need.
        let needs_auth = user.credentials.requires_auth();
        let enc_agreed = ies.encmethods.unwrap_or(0)
            & if user.encryption != 0 {
                user.encryption
            } else {
                self.config.encryption
            };
        let force_enc = self.config.force_encryption || user.force_encryption;

        // Key material only exists when an MD5-capable secret is involved.
        if force_enc && (enc_agreed & ENCRYPT_AES128 == 0 || user.credentials.secret.is_none()) {
            // No key material can exist without auth; forced encryption
            // cannot be satisfied.
            warn!(callno, "encryption required but not negotiable");
            self.reject_call(
                callno,
                "encryption required",
                cause::BEARERCAPABILITY_NOTAVAIL,
            );
            return;
        }

        let shrink = self.config.shrink_callerid;
        self.calls.with_slot(callno, |slot| {
            slot.state = CallState::WaitAccept;
            slot.remote_identity = Some(user.name.clone());
            slot.username = ies.username.clone();
            slot.caller.calling_number = ies
                .calling_number
                .clone()
                .map(|n| if shrink { shrink_number(&n) } else { n });
            slot.context = ies
                .called_context
                .clone()
                .unwrap_or_else(|| user.context.clone());
            slot.capability = if user.capability != 0 {
                user.capability
            } else {
                self.config.capability
            };
            slot.peer_capability = ies.capability.unwrap_or(0);
            slot.peer_requested_format = ies.format.unwrap_or(0);
            if let Some(prefs) = &ies.codec_prefs {
                slot.peer_prefs = iax2_proto::codec_pref::CodecPref::from_wire(prefs);
            }
            slot.prefs = user.prefs.clone();
            slot.enc_offered = enc_agreed;
            slot.force_encryption = force_enc;
            slot.caller.calling_name = ies.calling_name.clone();
            slot.caller.calling_ani = ies.calling_ani.clone();
            slot.caller.calling_pres = ies.calling_pres;
            slot.caller.calling_ton = ies.calling_ton;
            slot.caller.calling_tns = ies.calling_tns;
            slot.caller.called_number = ies.called_number.clone();
            slot.caller.dnid = ies.dnid.clone();
            slot.caller.rdnis = ies.rdnis.clone();
            slot.caller.language = ies.language.clone();
        });

        if needs_auth {
            if !self
                .registry
                .try_begin_authreq(&user.name, self.config.max_auth_req)
            {
                warn!(callno, user = %user.name, "too many outstanding AUTHREQs");
                self.reject_call(callno, "Too many outstanding authentications", cause::CALL_REJECTED);
                return;
            }
            let challenge = auth::generate_challenge(&mut *self.rng.lock());
            let methods = user.credentials.methods_or(self.config.auth_methods);
            self.calls.with_slot(callno, |slot| {
                slot.state = CallState::Authenticating;
                slot.challenge = Some(challenge.clone());
                slot.auth_methods = methods;
                slot.authreq_charged = true;
                let mut ies = vec![Ie::AuthMethods(methods), Ie::Challenge(challenge.clone())];
                if let Some(u) = &slot.username {
                    ies.push(Ie::Username(u.clone()));
                }
                let _ = self.send_command_on(slot, IaxCommand::AuthReq, ies);
            });
        } else {
            self.complete_inbound_setup(callno, from);
        }
    }

    /// Codec negotiation plus the PBX offer; runs after NEW (unauthenticated
    /// users) or after a verified AUTHREP.
    fn complete_inbound_setup(&self, callno: u16, from: SocketAddr) {
        let priority = self
            .calls
            .with_slot(callno, |slot| {
                slot.remote_identity
                    .as_ref()
                    .and_then(|name| self.registry.user(name))
                    .and_then(|u| u.codec_priority)
                    .unwrap_or(self.config.codec_priority)
            })
            .unwrap_or(self.config.codec_priority);

        let chosen = self.calls.with_slot(callno, |slot| {
            negotiate_format(slot, priority)
        });
        let Some(chosen) = chosen else { return };
        let Some(chosen) = chosen else {
            self.reject_call(callno, "Unable to negotiate codec", cause::BEARERCAPABILITY_NOTAVAIL);
            return;
        };

        let offer = self
            .calls
            .with_slot(callno, |slot| {
                slot.format = chosen;
                CallOffer {
                    callno,
                    addr: from,
                    username: slot.username.clone(),
                    context: slot.context.clone(),
                    called_number: slot.caller.called_number.clone(),
                    calling_number: slot.caller.calling_number.clone(),
                    calling_name: slot.caller.calling_name.clone(),
                    format: chosen,
                    capability: slot.capability,
                }
            });
        let Some(offer) = offer else { return };

        match self.events.on_call_offered(&offer) {
            CallDisposition::Reject { cause: text, code } => {
                self.reject_call(callno, &text, code);
            }
            disposition => {
                self.accept_call(callno, chosen);
                if disposition == CallDisposition::Ring {
                    let _ = self.send_control(callno, ControlKind::Ringing);
                }
            }
        }
    }

    fn accept_call(&self, callno: u16, chosen: u64) {
        let now = self.now();
        self.calls.with_slot(callno, |slot| {
            slot.state = CallState::Up;
            let ies = vec![
                Ie::Format((chosen & 0xFFFF_FFFF) as u32),
                Ie::Format2(chosen),
            ];
            let _ = self.send_command_on(slot, IaxCommand::Accept, ies);
            self.start_call_timers(slot, now);
        });
        info!(callno, format = format::name(chosen), "call accepted");
    }

    /// REJECT, possibly deferred to blunt timing probes.
    pub(crate) fn reject_call(&self, callno: u16, text: &str, code: u8) {
        let delayed = self.config.delay_reject;
        if delayed {
            let now = self.now();
            self.calls.with_slot(callno, |slot| {
                slot.pending_reject = Some((text.to_string(), code));
            });
            self.sched
                .schedule(now + Duration::from_secs(1), TimerEvent::DelayedReject(callno));
        } else {
            let _ = self.send_command_final(
                callno,
                IaxCommand::Reject,
                vec![Ie::Cause(text.to_string()), Ie::CauseCode(code)],
            );
        }
    }

    pub(crate) fn start_call_timers(&self, slot: &mut CallSlot, now: std::time::Instant) {
        let callno = slot.callno;
        if slot.timers.ping.is_none() {
            slot.timers.ping = Some(
                self.sched
                    .schedule(now + self.config.ping_time, TimerEvent::Ping(callno)),
            );
        }
        if slot.timers.lagrq.is_none() {
            slot.timers.lagrq = Some(
                self.sched
                    .schedule(now + self.config.lagrq_time, TimerEvent::Lagrq(callno)),
            );
        }
        if let Some(id) = slot.timers.maxtime.take() {
            self.sched.cancel(id);
        }
        if slot.enc.active() && slot.enc.keyrotate_enabled() && slot.timers.keyrotate.is_none() {
            let jitter = {
                let mut rng = self.rng.lock();
                use rand::Rng;
                rng.gen_range(KEYROTATE_MIN..=KEYROTATE_MAX)
            };
            slot.timers.keyrotate = Some(
                self.sched
                    .schedule(now + jitter, TimerEvent::KeyRotate(callno)),
            );
        }
    }

    // ---- Authentication ---------------------------------------------------

    /// AUTHREQ on an outbound call: produce the strongest proof offered.
    fn handle_authreq(&self, callno: u16, frame: &FullFrame, ies: &IeSet) {
        let _ = frame;
        let offered = ies.authmethods.unwrap_or(0);
        let Some(challenge) = ies.challenge.clone() else {
            self.reject_call(callno, "authreq without challenge", cause::FACILITY_REJECTED);
            return;
        };

        enum Proof {
            Md5(String),
            Rsa(Vec<u8>),
            Plain(String),
        }

        let action = self.calls.with_slot(callno, |slot| {
            slot.challenge = Some(challenge.clone());
            let method = auth::choose_method(
                offered,
                slot.secret.is_some(),
                slot.outkey.is_some(),
            )?;
            match method {
                auth::AuthMethod::Md5 => {
                    let secret = slot.secret.as_deref().unwrap_or_default();
                    Some(Proof::Md5(auth::md5_response(&challenge, secret)))
                }
                auth::AuthMethod::Rsa => {
                    let keyname = slot.outkey.clone().unwrap_or_default();
                    auth::rsa_sign(&self.keys, &keyname, &challenge)
                        .ok()
                        .map(Proof::Rsa)
                }
                auth::AuthMethod::Plaintext => {
                    slot.secret.clone().map(Proof::Plain)
                }
            }
        });

        let sent = match action.flatten() {
            Some(Proof::Md5(digest)) => self
                .send_command(callno, IaxCommand::AuthRep, vec![Ie::Md5Result(digest)])
                .is_ok(),
            Some(Proof::Rsa(sig)) => self
                .send_command(callno, IaxCommand::AuthRep, vec![Ie::RsaResult(sig)])
                .is_ok(),
            Some(Proof::Plain(secret)) => self
                .send_command(callno, IaxCommand::AuthRep, vec![Ie::Password(secret)])
                .is_ok(),
            None => {
                warn!(callno, offered, "no usable authentication method");
                let _ = self.send_command_final(
                    callno,
                    IaxCommand::Hangup,
                    vec![Ie::Cause("no authentication method".into())],
                );
                return;
            }
        };

        // Keys go live only after the (cleartext) AUTHREP has left; the
        // responder installs its side when it verifies the proof, so
        // everything from ACCEPT on is ciphered.
        if sent {
            self.calls.with_slot(callno, |slot| {
                if slot.enc_offered & ENCRYPT_AES128 != 0 {
                    if let Some(secret) = slot.secret.clone() {
                        slot.enc.methods = slot.enc_offered;
                        slot.enc.set_keys(crypto::derive_key(&challenge, &secret));
                    }
                }
            });
        }
    }

    /// AUTHREP on an inbound call we challenged.
    fn handle_authrep(&self, callno: u16, frame: &FullFrame, ies: &IeSet, from: SocketAddr) {
        let _ = frame;
        // The challenge is answered; its quota charge ends here either way.
        let charged = self.calls.with_slot(callno, |slot| {
            let name = slot
                .authreq_charged
                .then(|| slot.remote_identity.clone())
                .flatten();
            slot.authreq_charged = false;
            name
        });
        if let Some(Some(name)) = charged {
            self.registry.end_authreq(&name);
        }

        let verdict = self.calls.with_slot(callno, |slot| {
            let user = slot
                .remote_identity
                .as_ref()
                .and_then(|name| self.registry.user(name));
            let Some(user) = user else {
                return Some(false);
            };
            let Some(challenge) = slot.challenge.clone() else {
                return Some(false);
            };
            let methods = slot.auth_methods;

            let ok = if let (Some(resp), Some(secret), true) = (
                ies.md5_result.as_ref(),
                user.credentials.secret.as_ref(),
                methods & AUTH_MD5 != 0,
            ) {
                auth::verify_md5(&challenge, secret, resp)
            } else if let (Some(sig), false, true) = (
                ies.rsa_result.as_ref(),
                user.credentials.inkeys.is_empty(),
                methods & AUTH_RSA != 0,
            ) {
                auth::rsa_verify(&self.keys, &user.credentials.inkeys, &challenge, sig)
            } else if let (Some(pass), Some(secret), true) = (
                ies.password.as_ref(),
                user.credentials.secret.as_ref(),
                methods & AUTH_PLAINTEXT != 0,
            ) {
                auth::verify_plaintext(secret, pass)
            } else {
                false
            };

            if ok {
                if slot.enc_offered & ENCRYPT_AES128 != 0 {
                    if let Some(secret) = user.credentials.secret.as_ref() {
                        slot.enc.methods = slot.enc_offered;
                        slot.enc.set_keys(crypto::derive_key(&challenge, secret));
                    }
                }
                slot.state = CallState::WaitAccept;
            }
            Some(ok)
        });

        match verdict.flatten() {
            Some(true) => self.complete_inbound_setup(callno, from),
            _ => {
                if self.config.auth_debug {
                    info!(callno, %from, "authentication failed");
                }
                self.reject_call(callno, "Password incorrect", cause::CALL_REJECTED);
            }
        }
    }

    /// ACCEPT on an outbound call.
    fn handle_accept(&self, callno: u16, frame: &FullFrame, ies: &IeSet) {
        let now = self.now();
        let outcome = self.calls.with_slot(callno, |slot| {
            if slot.state == CallState::Up {
                // Duplicate accept; just re-ack.
                let _ = self.send_seqless_on(slot, IaxCommand::Ack, frame.ts);
                return None;
            }
            let format = ies.format.unwrap_or(0);
            if format == 0 || format.count_ones() != 1 {
                return Some(Err(()));
            }
            slot.format = format;
            slot.state = CallState::Up;
            let _ = self.send_seqless_on(slot, IaxCommand::Ack, frame.ts);
            if slot.force_encryption && !slot.enc.active() {
                return Some(Err(()));
            }
            self.start_call_timers(slot, now);
            Some(Ok(format))
        });

        match outcome.flatten() {
            Some(Ok(format)) => {
                info!(callno, format = format::name(format), "call accepted by remote");
                self.events.on_accepted(callno, format);
            }
            Some(Err(())) => {
                warn!(callno, "accept unusable (format or encryption)");
                let _ = self.send_command_final(
                    callno,
                    IaxCommand::Hangup,
                    vec![
                        Ie::Cause("bearer capability not available".into()),
                        Ie::CauseCode(cause::BEARERCAPABILITY_NOTAVAIL),
                    ],
                );
            }
            None => {}
        }
    }

    fn handle_reject(&self, callno: u16, frame: &FullFrame, ies: &IeSet) {
        self.ack_only(callno, frame.ts);
        self.calls.with_slot(callno, |slot| {
            slot.hangup_cause = ies.cause.clone().or(Some("rejected".into()));
            slot.hangup_causecode = ies.causecode;
            slot.state = CallState::Dead;
        });
        self.destroy_call(callno, true);
    }

    fn handle_hangup(&self, callno: u16, frame: &FullFrame, ies: &IeSet) {
        self.ack_only(callno, frame.ts);
        self.calls.with_slot(callno, |slot| {
            slot.hangup_cause = ies.cause.clone();
            slot.hangup_causecode = ies.causecode;
            slot.state = CallState::Dead;
        });
        self.destroy_call(callno, true);
    }

    fn handle_ack(&self, callno: u16) {
        // The implicit-ack bookkeeping already ran in the sequence layer;
        // an ACK that released the final frame leaves the slot Dead and the
        // caller reaps it.
        let _ = callno;
    }

    // ---- Liveness ---------------------------------------------------------

    fn handle_ping(&self, callno: u16, frame: &FullFrame) {
        // PONG carries receiver-report IEs measured by the jitter buffer.
        self.calls.with_slot(callno, |slot| {
            let mut ies = Vec::new();
            if let Some(jb) = slot.jb.as_ref() {
                let stats = jb.stats();
                ies.push(Ie::RrPkts(stats.frames_in as u32));
                ies.push(Ie::RrDropped(stats.dropped as u32));
                ies.push(Ie::RrOoo(stats.out_of_order as u32));
            }
            let _ = self.transmit_full(
                slot,
                FrameType::Iax as u8,
                IaxCommand::Pong as u8,
                iax2_proto::build_ies(&ies),
                Some(frame.ts),
                true,
                false,
                false,
            );
        });
    }

    fn handle_pong(&self, callno: u16, frame: &FullFrame, ies: &IeSet) {
        let _ = ies;
        let now = self.now();
        self.ack_only(callno, frame.ts);

        let poke_peer = self.calls.with_slot(callno, |slot| {
            if let Some((sent_ts, sent_at)) = slot.ping_sent.take() {
                if sent_ts == frame.ts {
                    slot.pingtime = now.duration_since(sent_at);
                }
            }
            slot.poke_peer.clone().map(|p| (p, slot.pingtime))
        });

        if let Some(Some((peer_name, rtt))) = poke_peer {
            self.finish_poke(callno, &peer_name, Some(rtt));
        }
    }

    fn handle_lagrp(&self, callno: u16, frame: &FullFrame) {
        let now = self.now();
        self.ack_only(callno, frame.ts);
        self.calls.with_slot(callno, |slot| {
            if let Some((sent_ts, sent_at)) = slot.lagrq_sent.take() {
                if sent_ts == frame.ts {
                    slot.lag = now.duration_since(sent_at);
                    trace!(callno, lag_ms = slot.lag.as_millis() as u64, "lag measured");
                }
            }
        });
    }

    /// A poke concluded: mark the peer, notify, schedule the next cycle and
    /// drop the poke slot.
    pub(crate) fn finish_poke(&self, callno: u16, peer_name: &str, rtt: Option<Duration>) {
        let now = self.now();
        if let Some(peer) = self.registry.peer(peer_name) {
            let mut peer = peer.lock();
            if let Some(id) = peer.qualify_timer.take() {
                self.sched.cancel(id);
            }
            peer.poke_callno = None;
            match rtt {
                Some(rtt) => {
                    let ms = rtt.as_millis() as u32;
                    if ms > peer.config.maxms && peer.config.maxms > 0 {
                        peer.status = PeerStatus::Unreachable;
                        self.events
                            .on_peer_status(peer_name, PeerStatusEvent::Unreachable);
                    } else {
                        let was_unreachable =
                            matches!(peer.status, PeerStatus::Unreachable | PeerStatus::Unknown);
                        peer.record_qualify_ms(ms);
                        if was_unreachable {
                            self.events.on_peer_status(
                                peer_name,
                                PeerStatusEvent::Reachable { ms },
                            );
                        }
                    }
                    let next = if matches!(peer.status, PeerStatus::Reachable(_)) {
                        peer.config.qualify_freq_ok
                    } else {
                        peer.config.qualify_freq_notok
                    };
                    self.sched
                        .schedule(now + next, TimerEvent::QualifyPoke(peer_name.to_string()));
                }
                None => {
                    peer.status = PeerStatus::Unreachable;
                    self.events
                        .on_peer_status(peer_name, PeerStatusEvent::Unreachable);
                    self.sched.schedule(
                        now + peer.config.qualify_freq_notok,
                        TimerEvent::QualifyPoke(peer_name.to_string()),
                    );
                }
            }
        }
        self.destroy_call(callno, false);
    }

    // ---- Media ------------------------------------------------------------

    fn handle_full_voice(&self, callno: u16, frame: FullFrame) {
        let now = self.now();
        self.ack_only(callno, frame.ts);
        let delivered = self.calls.with_slot(callno, |slot| {
            if !slot.is_up() {
                debug!(callno, "voice before call is up");
                let _ = self.send_seqless_on(slot, IaxCommand::Vnak, 0);
                return None;
            }
            slot.three_way_complete = true;
            let format = subclass::uncompress(frame.csub);
            if format > 0 {
                slot.peer_requested_format = format as u64;
            }
            if slot.quelched {
                return None;
            }
            match slot.jb.as_mut() {
                Some(jb) => {
                    jb.put(
                        JitterFrame {
                            ts: frame.ts,
                            kind: MediaKind::Voice,
                            len_ms: 20,
                            data: frame.payload.clone(),
                        },
                        now,
                    );
                    None
                }
                None => Some(frame.ts),
            }
        });
        if let Some(Some(ts)) = delivered {
            self.events
                .on_media(callno, MediaDirection::Audio, ts, &frame.payload);
        }
    }

    fn handle_full_video(&self, callno: u16, frame: FullFrame) {
        self.ack_only(callno, frame.ts);
        let up = self.calls.with_slot(callno, |slot| {
            if slot.is_up() {
                slot.three_way_complete = true;
                true
            } else {
                false
            }
        });
        if up == Some(true) {
            self.events.on_media(
                callno,
                MediaDirection::Video {
                    mark: frame.ts & 0x8000 != 0,
                },
                frame.ts,
                &frame.payload,
            );
        }
    }

    fn handle_control(&self, callno: u16, frame: FullFrame) {
        self.ack_only(callno, frame.ts);
        let Some(kind) = ControlKind::from_wire(frame.csub) else {
            debug!(callno, csub = frame.csub, "unknown control subclass");
            return;
        };
        if !kind.allowed_on_wire() {
            debug!(callno, ?kind, "control kind dropped at the boundary");
            return;
        }
        self.calls.with_slot(callno, |slot| {
            if slot.is_up() {
                slot.three_way_complete = true;
            }
        });
        if kind == ControlKind::Answer {
            self.events.on_answered(callno);
        }
        self.events.on_control(callno, kind);
    }

    // ---- Sequence recovery ------------------------------------------------

    fn handle_vnak(&self, callno: u16, frame: &FullFrame) {
        let now = self.now();
        let resend: Option<Vec<Seqno>> = self.calls.with_slot(callno, |slot| {
            slot.tx.vnak(Seqno(frame.iseqno), now)
        });
        if let Some(resend) = resend {
            debug!(callno, from_seq = frame.iseqno, count = resend.len(), "VNAK resend");
            for oseqno in resend {
                self.calls.with_slot(callno, |slot| {
                    let _ = self.retransmit_frame(slot, oseqno);
                });
            }
        }
    }

    // ---- Registration (inbound registrar side) ----------------------------

    fn handle_regreq(
        &self,
        callno: u16,
        frame: &FullFrame,
        ies: IeSet,
        from: SocketAddr,
        release: bool,
    ) {
        let _ = frame;
        let Some(peer_name) = ies.username.clone() else {
            self.send_regrej(callno, "no username");
            return;
        };
        let Some(peer) = self.registry.peer(&peer_name) else {
            if self.config.auth_debug {
                info!(%from, peer = %peer_name, "registration for unknown peer");
            }
            self.send_regrej(callno, "Registration Refused");
            return;
        };

        // Never hold the peer lock while touching the slot; decide first,
        // act after.
        enum RegPlan {
            Refuse(&'static str),
            Challenge { methods: u16 },
            Bind { refresh: u16, moved: bool, qualify: bool },
            Unbind,
        }

        // The challenge a previous round left on the slot, if any.
        let outstanding = self
            .calls
            .with_slot(callno, |slot| slot.challenge.clone())
            .flatten();

        let plan = {
            let mut peer_guard = peer.lock();
            if !peer_guard.config.dynamic() {
                RegPlan::Refuse("peer is not dynamic")
            } else if !peer_guard.config.acl.permits(from.ip()) {
                RegPlan::Refuse("Registration Refused")
            } else {
                let creds = peer_guard.config.credentials.clone();
                let methods = creds.methods_or(self.config.auth_methods);
                let has_proof = ies.md5_result.is_some()
                    || ies.rsa_result.is_some()
                    || ies.password.is_some();

                if creds.requires_auth() && (!has_proof || outstanding.is_none()) {
                    RegPlan::Challenge { methods }
                } else if creds.requires_auth() {
                    let challenge = outstanding.clone().unwrap_or_default();
                    let ok = if let (Some(resp), Some(secret)) =
                        (ies.md5_result.as_ref(), creds.secret.as_ref())
                    {
                        methods & AUTH_MD5 != 0 && auth::verify_md5(&challenge, secret, resp)
                    } else if let Some(sig) = ies.rsa_result.as_ref() {
                        methods & AUTH_RSA != 0
                            && auth::rsa_verify(&self.keys, &creds.inkeys, &challenge, sig)
                    } else if let (Some(pass), Some(secret)) =
                        (ies.password.as_ref(), creds.secret.as_ref())
                    {
                        methods & AUTH_PLAINTEXT != 0 && auth::verify_plaintext(secret, pass)
                    } else {
                        false
                    };
                    if !ok {
                        peer_guard.auth_fails += 1;
                        RegPlan::Refuse("Registration Refused")
                    } else if release {
                        RegPlan::Unbind
                    } else {
                        let refresh = ies
                            .refresh
                            .unwrap_or(peer_guard.config.default_refresh)
                            .clamp(self.config.min_reg_expire, self.config.max_reg_expire);
                        RegPlan::Bind {
                            refresh,
                            moved: peer_guard.addr != Some(from),
                            qualify: peer_guard.config.maxms > 0,
                        }
                    }
                } else if release {
                    RegPlan::Unbind
                } else {
                    let refresh = ies
                        .refresh
                        .unwrap_or(peer_guard.config.default_refresh)
                        .clamp(self.config.min_reg_expire, self.config.max_reg_expire);
                    RegPlan::Bind {
                        refresh,
                        moved: peer_guard.addr != Some(from),
                        qualify: peer_guard.config.maxms > 0,
                    }
                }
            }
        };

        let now = self.now();
        match plan {
            RegPlan::Refuse(text) => {
                if self.config.auth_debug {
                    info!(peer = %peer_name, %from, text, "registration refused");
                }
                self.send_regrej(callno, text);
            }
            RegPlan::Challenge { methods } => {
                let challenge = auth::generate_challenge(&mut *self.rng.lock());
                peer.lock().challenge = Some(challenge.clone());
                self.calls.with_slot(callno, |slot| {
                    slot.challenge = Some(challenge.clone());
                    slot.reg_peer = Some(peer_name.clone());
                    let _ = self.send_command_on(
                        slot,
                        IaxCommand::RegAuth,
                        vec![
                            Ie::AuthMethods(methods),
                            Ie::Challenge(challenge.clone()),
                            Ie::Username(peer_name.clone()),
                        ],
                    );
                });
            }
            RegPlan::Unbind => {
                {
                    let mut peer_guard = peer.lock();
                    peer_guard.addr = None;
                    peer_guard.expiry_at = None;
                    if let Some(id) = peer_guard.expire_timer.take() {
                        self.sched.cancel(id);
                    }
                }
                self.store.delete(&format!("IAX/Registry/{peer_name}"));
                self.events.on_registration(&peer_name, RegEvent::Unbound);
                info!(peer = %peer_name, "peer unregistered");
                self.send_regack(callno, &peer_name, from, 0);
            }
            RegPlan::Bind {
                refresh,
                moved,
                qualify,
            } => {
                {
                    let mut peer_guard = peer.lock();
                    peer_guard.addr = Some(from);
                    peer_guard.expiry_at =
                        Some(now + Duration::from_secs(u64::from(refresh)));
                    if let Some(id) = peer_guard.expire_timer.take() {
                        self.sched.cancel(id);
                    }
                    peer_guard.expire_timer = Some(self.sched.schedule(
                        now + Duration::from_secs(u64::from(refresh)),
                        TimerEvent::PeerExpire(peer_name.clone()),
                    ));
                }
                self.store.put(
                    &format!("IAX/Registry/{peer_name}"),
                    &format_binding(from, refresh),
                );
                if moved {
                    self.events
                        .on_registration(&peer_name, RegEvent::Bound(from));
                }
                if qualify {
                    self.start_qualify(&peer_name);
                }
                info!(peer = %peer_name, %from, refresh, "peer registered");
                self.send_regack(callno, &peer_name, from, refresh);
            }
        }
    }

    fn send_regack(&self, callno: u16, peer_name: &str, from: SocketAddr, refresh: u16) {
        let now_ms = self.time.now_system_ms();
        let mut ies = vec![
            Ie::Username(peer_name.to_string()),
            Ie::DateTime(WireDateTime::from_unix_ms(now_ms).pack()),
            Ie::Refresh(refresh.max(1)),
            Ie::ApparentAddr(from),
        ];
        if let Some(peer) = self.registry.peer(peer_name) {
            let peer = peer.lock();
            if let Some(mailbox) = &peer.config.mailbox {
                if let Some((new, _old)) = self.events.mailbox_count(mailbox) {
                    ies.push(Ie::MsgCount(new));
                }
            }
            if let Some(num) = &peer.config.callerid_num {
                ies.push(Ie::CallingNumber(num.clone()));
            }
            if let Some(name) = &peer.config.callerid_name {
                ies.push(Ie::CallingName(name.clone()));
            }
        }
        let _ = self.send_command_final(callno, IaxCommand::RegAck, ies);
    }

    fn send_regrej(&self, callno: u16, text: &str) {
        let _ = self.send_command_final(
            callno,
            IaxCommand::RegRej,
            vec![
                Ie::Cause(text.to_string()),
                Ie::CauseCode(cause::FACILITY_REJECTED),
            ],
        );
    }

    // ---- Registration (outbound registrant side) --------------------------

    /// REGAUTH from the registrar: answer with credentials on the same slot.
    fn handle_regauth(&self, callno: u16, frame: &FullFrame, ies: &IeSet) {
        let _ = frame;
        let Some(index) = self.registry.registration_by_callno(callno) else {
            debug!(callno, "REGAUTH for no registration");
            return;
        };
        let Some(challenge) = ies.challenge.clone() else {
            return;
        };
        let offered = ies.authmethods.unwrap_or(AUTH_MD5);

        let (username, secret) = match self
            .registry
            .with_registration(index, |reg| {
                (reg.config.username.clone(), reg.config.secret.clone())
            }) {
            Some(pair) => pair,
            None => return,
        };
        let Some(secret) = secret else {
            self.registry
                .with_registration(index, |reg| reg.state = crate::registry::RegState::NoAuth);
            warn!(callno, "registrar wants auth but no secret configured");
            return;
        };

        let mut reply = vec![Ie::Username(username)];
        if offered & AUTH_MD5 != 0 {
            reply.push(Ie::Md5Result(auth::md5_response(&challenge, &secret)));
        } else if offered & AUTH_PLAINTEXT != 0 {
            reply.push(Ie::Password(secret));
        } else {
            self.registry
                .with_registration(index, |reg| reg.state = crate::registry::RegState::NoAuth);
            return;
        }
        let refresh = self
            .registry
            .with_registration(index, |reg| {
                reg.on_authenticated();
                reg.refresh
            })
            .unwrap_or(60);
        reply.push(Ie::Refresh(refresh));
        let _ = self.send_command(callno, IaxCommand::RegReq, reply);
    }

    fn handle_regack(&self, callno: u16, frame: &FullFrame, ies: &IeSet) {
        self.ack_only(callno, frame.ts);
        let Some(index) = self.registry.registration_by_callno(callno) else {
            // Registrar-side REGACK handling happens through the final-frame
            // ack; an inbound REGACK with no registration is stray.
            return;
        };
        let refresh = ies.refresh.unwrap_or(0);
        let apparent = ies.apparent_addr;
        let (next, username) = match self.registry.with_registration(index, |reg| {
            reg.on_ack(refresh, apparent);
            (reg.refresh_interval(), reg.config.username.clone())
        }) {
            Some(pair) => pair,
            None => return,
        };
        info!(callno, index, refresh, "registration accepted");
        self.events.on_registration(&username, RegEvent::Accepted);
        let now = self.now();
        self.sched
            .schedule(now + next, TimerEvent::RegRefresh(index));
        self.calls.with_slot(callno, |slot| slot.state = CallState::Dead);
        self.destroy_call(callno, false);
    }

    fn handle_regrej(&self, callno: u16, frame: &FullFrame, ies: &IeSet) {
        self.ack_only(callno, frame.ts);
        if let Some(index) = self.registry.registration_by_callno(callno) {
            warn!(
                callno,
                index,
                cause = ies.cause.as_deref().unwrap_or(""),
                "registration rejected"
            );
            let username = self
                .registry
                .with_registration(index, |reg| {
                    reg.on_rej();
                    reg.config.username.clone()
                })
                .unwrap_or_default();
            self.events.on_registration(&username, RegEvent::Rejected);
        }
        self.destroy_call(callno, false);
    }

    // ---- Dialplan ---------------------------------------------------------

    fn handle_dpreq(&self, callno: u16, frame: &FullFrame, ies: &IeSet) {
        let _ = frame;
        let Some(number) = ies.called_number.clone() else {
            return;
        };
        let context = self
            .calls
            .with_slot(callno, |slot| slot.context.clone())
            .unwrap_or_default();
        let status = self.events.dialplan_status(&context, &number);
        self.calls.with_slot(callno, |slot| {
            let _ = self.send_command_on(
                slot,
                IaxCommand::DpRep,
                vec![
                    Ie::CalledNumber(number.clone()),
                    Ie::DpStatus(status.to_wire()),
                    Ie::Refresh(60),
                ],
            );
        });
    }

    fn handle_dial(&self, callno: u16, frame: &FullFrame, ies: &IeSet) {
        self.ack_only(callno, frame.ts);
        let from = self.calls.with_slot(callno, |slot| {
            if let Some(number) = &ies.called_number {
                slot.caller.called_number = Some(number.clone());
            }
            (slot.state != CallState::Up).then_some(slot.addr)
        });
        if let Some(Some(from)) = from {
            self.complete_inbound_setup(callno, from);
        }
    }

    // ---- Native transfer --------------------------------------------------

    /// TXREQ from our server: start probing the counterpart's address.
    fn handle_txreq(&self, callno: u16, frame: &FullFrame, ies: &IeSet) {
        self.ack_only(callno, frame.ts);
        let (Some(taddr), Some(tid)) = (ies.apparent_addr, ies.transferid) else {
            debug!(callno, "TXREQ missing transfer IEs");
            return;
        };
        self.calls.with_slot(callno, |slot| {
            slot.transfer = TransferState::Begin;
            slot.transfer_id = tid;
            slot.transfer_addr = Some(taddr);
            slot.transfer_peer_callno = ies.callno.unwrap_or(0);
            let _ = self.transmit_full(
                slot,
                FrameType::Iax as u8,
                IaxCommand::TxCnt as u8,
                iax2_proto::build_ies(&[Ie::TransferId(tid)]),
                None,
                false,
                false,
                true,
            );
        });
        if let Some(peer_callno) = ies.callno {
            self.calls.link_transfer(taddr, peer_callno, callno);
        }
    }

    /// TXCNT probing us over the would-be direct path.
    fn handle_txcnt(&self, callno: u16, frame: &FullFrame, ies: &IeSet, from: SocketAddr) {
        self.calls.with_slot(callno, |slot| {
            if slot.transfer == TransferState::None
                || ies.transferid.unwrap_or(0) != slot.transfer_id
            {
                let _ = self.send_seqless_on(slot, IaxCommand::TxRej, frame.ts);
                return;
            }
            // The probe proves the path; remember where it really came from.
            slot.transfer_addr = Some(from);
            if slot.transfer_peer_callno == 0 {
                slot.transfer_peer_callno = frame.scallno;
            }
            let _ = self.transmit_full(
                slot,
                FrameType::Iax as u8,
                IaxCommand::TxAcc as u8,
                iax2_proto::build_ies(&[Ie::TransferId(slot.transfer_id)]),
                Some(frame.ts),
                false,
                false,
                true,
            );
        });
    }

    /// TXACC: our probe came back; tell the server we are ready.
    fn handle_txacc(&self, callno: u16, frame: &FullFrame, ies: &IeSet) {
        let _ = frame;
        self.calls.with_slot(callno, |slot| {
            if slot.transfer != TransferState::Begin
                || ies.transferid.unwrap_or(0) != slot.transfer_id
            {
                return;
            }
            slot.transfer = TransferState::Ready;
            let _ = self.send_command_on(
                slot,
                IaxCommand::TxReady,
                vec![Ie::TransferId(slot.transfer_id)],
            );
        });
    }

    /// TXREADY from a leg; when both legs are ready the server releases.
    fn handle_txready(&self, callno: u16, frame: &FullFrame) {
        self.ack_only(callno, frame.ts);
        let other = self.calls.with_slot(callno, |slot| {
            slot.transfer = TransferState::Ready;
            slot.bridged_with
        });
        let Some(Some(other)) = other else { return };

        let both_ready = self
            .calls
            .with_two_slots(callno, other, |a, b| {
                a.transfer == TransferState::Ready && b.transfer == TransferState::Ready
            })
            .unwrap_or(false);
        if !both_ready {
            return;
        }

        info!(callno, other, "both legs ready, releasing transfer");
        for leg in [callno, other] {
            self.calls.with_slot(leg, |slot| {
                slot.transfer = TransferState::Released;
                let tid = slot.transfer_id;
                let _ = self.transmit_full(
                    slot,
                    FrameType::Iax as u8,
                    IaxCommand::TxRel as u8,
                    iax2_proto::build_ies(&[Ie::TransferId(tid)]),
                    None,
                    true,
                    true,
                    false,
                );
            });
        }
    }

    /// TXREL: the call now lives on the direct path.
    fn handle_txrel(&self, callno: u16, frame: &FullFrame, ies: &IeSet) {
        let _ = ies;
        self.ack_only(callno, frame.ts);
        let relink = self.calls.with_slot(callno, |slot| {
            let new_addr = slot.transfer_addr?;
            let old = (slot.addr, slot.peer_callno);
            slot.addr = new_addr;
            slot.peer_callno = slot.transfer_peer_callno;
            slot.transfer = TransferState::None;
            slot.transfer_addr = None;
            slot.transfer_media_addr = None;
            // The direct leg starts its sequence space fresh.
            slot.oseqno = Seqno(0);
            slot.iseqno = Seqno(0);
            slot.tx.clear();
            info!(callno = slot.callno, %new_addr, "transfer complete");
            Some((old, new_addr, slot.peer_callno))
        });
        if let Some(Some(((old_addr, old_peer), new_addr, new_peer))) = relink {
            self.calls.unlink_peer(old_addr, old_peer);
            self.calls.link_peer(new_addr, new_peer, callno);
        }
    }

    fn handle_txrej(&self, callno: u16, frame: &FullFrame) {
        self.ack_only(callno, frame.ts);
        self.calls.with_slot(callno, |slot| {
            debug!(callno, "transfer rejected, keeping relayed path");
            slot.transfer = TransferState::None;
            slot.transfer_addr = None;
            slot.transfer_peer_callno = 0;
        });
    }

    /// TXMEDIA: redirect media only; signalling stays with the server.
    fn handle_txmedia(&self, callno: u16, frame: &FullFrame) {
        self.ack_only(callno, frame.ts);
        self.calls.with_slot(callno, |slot| {
            if let Some(taddr) = slot.transfer_addr {
                slot.transfer = TransferState::Media;
                slot.transfer_media_addr = Some(taddr);
                info!(callno, %taddr, "media redirected");
            }
        });
    }

    /// The far end wants a call token before it will hold state for us:
    /// restart the opening exchange with the token echoed.
    fn handle_calltoken_demand(&self, callno: u16, ies: &IeSet) {
        let Some(token) = ies.calltoken.clone() else {
            debug!(callno, "CALLTOKEN without token data");
            return;
        };
        let kind = self.calls.with_slot(callno, |slot| {
            if slot.direction != Direction::Outbound || slot.is_up() {
                return None;
            }
            // Nothing of the first attempt survives on the far side.
            slot.calltoken = Some(token.clone());
            slot.oseqno = Seqno(0);
            slot.iseqno = Seqno(0);
            slot.peer_callno = 0;
            slot.tx.clear();
            if let Some(id) = slot.timers.retrans.take() {
                self.sched.cancel(id);
            }
            Some(slot.kind)
        });
        match kind.flatten() {
            Some(SlotKind::Call) => {
                let _ = self.send_new(callno);
            }
            Some(SlotKind::Registration) => {
                if let Some(index) = self.registry.registration_by_callno(callno) {
                    let reply = self.registry.with_registration(index, |reg| {
                        (reg.config.username.clone(), reg.refresh)
                    });
                    if let Some((username, refresh)) = reply {
                        let _ = self.send_command(
                            callno,
                            IaxCommand::RegReq,
                            vec![
                                Ie::Username(username),
                                Ie::Refresh(refresh),
                                Ie::CallToken(token),
                            ],
                        );
                    }
                }
            }
            _ => {}
        }
    }

    // ---- Key rotation -----------------------------------------------------

    fn handle_rtkey(&self, callno: u16, frame: &FullFrame, ies: &IeSet) {
        self.ack_only(callno, frame.ts);
        self.calls.with_slot(callno, |slot| {
            if !slot.enc.active() || !slot.enc.keyrotate_enabled() {
                debug!(callno, "RTKEY without rotation negotiated");
                return;
            }
            match ies.enckey.as_deref() {
                Some(key) if key.len() == 16 => {
                    let mut k = [0u8; 16];
                    k.copy_from_slice(key);
                    slot.enc.install_rx_key(k);
                    trace!(callno, "receive key rotated");
                }
                _ => warn!(callno, "RTKEY with unusable key material"),
            }
        });
    }
}

/// Strips presentation characters from a caller number, keeping digits and
/// a leading `+`.
fn shrink_number(number: &str) -> String {
    number
        .chars()
        .enumerate()
        .filter(|(idx, c)| c.is_ascii_digit() || (*idx == 0 && *c == '+') || *c == '*' || *c == '#')
        .map(|(_, c)| c)
        .collect()
}

/// Codec selection. Returns `None` when no joint format exists.
fn negotiate_format(slot: &mut CallSlot, priority: CodecPriority) -> Option<u64> {
    let joint = slot.capability & slot.peer_capability;
    let requested = slot.peer_requested_format;

    match priority {
        CodecPriority::ReqOnly => {
            if requested != 0 && requested & slot.capability != 0 {
                Some(requested)
            } else {
                None
            }
        }
        CodecPriority::Disabled => {
            let pick = format::best_format(joint);
            (pick != 0).then_some(pick)
        }
        CodecPriority::Caller => {
            let pick = slot.peer_prefs.first_in(joint);
            let pick = if pick != 0 { pick } else { format::best_format(joint) };
            (pick != 0).then_some(pick)
        }
        CodecPriority::Host => {
            let pick = slot.prefs.first_in(joint);
            let pick = if pick != 0 { pick } else { format::best_format(joint) };
            (pick != 0).then_some(pick)
        }
    }
}
