//! Timer-event dispatch: the pump that turns scheduled messages back into
//! protocol work. Each event acquires only the locks its handler needs.

use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, info, warn};

use iax2_proto::constants::{cause, FrameType, IaxCommand};
use iax2_proto::Ie;
use iax2_transport::reliable::TxEvent;

use crate::call::{CallState, Direction, SlotKind};
use crate::crypto;
use crate::registry::{PeerStatus, RegState};
use crate::sched::TimerEvent;
use crate::events::RegEvent;

use super::Engine;

impl Engine {
    /// Runs everything due. The scheduler thread calls this in a loop; tests
    /// call it directly after advancing their manual clock.
    pub fn poll_timers(&self) {
        let now = self.now();
        for event in self.sched.take_due(now) {
            self.run_timer_event(event, now);
        }
    }

    /// Next instant the pump needs to wake for.
    pub fn next_timer_deadline(&self) -> Option<Instant> {
        self.sched.next_deadline()
    }

    fn run_timer_event(&self, event: TimerEvent, now: Instant) {
        match event {
            TimerEvent::Retransmit(callno) => self.on_retransmit_timer(callno, now),
            TimerEvent::Ping(callno) => self.on_ping_timer(callno, now),
            TimerEvent::Lagrq(callno) => self.on_lagrq_timer(callno, now),
            TimerEvent::MaxTimeExpired(callno) => self.on_maxtime(callno),
            TimerEvent::KeyRotate(callno) => self.on_keyrotate(callno, now),
            TimerEvent::DelayedReject(callno) => self.on_delayed_reject(callno),
            TimerEvent::ReturnCallno {
                callno,
                ip,
                validated,
                charged,
            } => {
                // Quarantine over; the number and the quota charge go home
                // on the same schedule.
                self.pool.release(callno);
                if charged {
                    self.counts.release(ip, validated);
                }
            }
            TimerEvent::TrunkTick => {
                for datagram in self.trunks.drain(now) {
                    if let Err(e) = self.transport.send_to(&datagram.data, datagram.addr) {
                        debug!(addr = %datagram.addr, error = %e, "trunk send failed");
                    }
                }
                self.trunks.reap(now);
                if !self.is_shutting_down() {
                    self.sched
                        .schedule(now + self.config.trunk_freq, TimerEvent::TrunkTick);
                }
            }
            TimerEvent::RegRefresh(index) => self.on_reg_refresh(index),
            TimerEvent::QualifyPoke(name) => self.on_qualify_poke(&name, now),
            TimerEvent::QualifyTimeout(name) => self.on_qualify_timeout(&name),
            TimerEvent::PeerExpire(name) => self.on_peer_expire(&name),
        }
    }

    fn on_retransmit_timer(&self, callno: u16, now: Instant) {
        let events = self.calls.with_slot(callno, |slot| {
            slot.timers.retrans = None;
            let events = slot.tx.tick(now);
            self.arm_retrans_timer(slot);
            events
        });
        let Some(events) = events else { return };

        let mut fatal: Option<bool> = None;
        for event in events {
            match event {
                TxEvent::Resend(oseqno) => {
                    self.calls.with_slot(callno, |slot| {
                        if let Err(e) = self.retransmit_frame(slot, oseqno) {
                            debug!(callno, oseqno = oseqno.0, error = %e, "retransmit failed");
                        }
                    });
                }
                TxEvent::Expired {
                    final_frame,
                    oseqno,
                } => {
                    debug!(callno, oseqno = oseqno.0, final_frame, "frame abandoned");
                    fatal = Some(final_frame);
                }
            }
        }

        if let Some(was_final) = fatal {
            if was_final {
                // The teardown itself went unacknowledged; give up quietly.
                self.destroy_call(callno, false);
            } else {
                warn!(callno, "max retries reached, destroying call");
                self.calls.with_slot(callno, |slot| {
                    slot.hangup_cause = Some("timeout".into());
                    slot.hangup_causecode = Some(cause::DESTINATION_OUT_OF_ORDER);
                    if slot.poke_peer.is_none() {
                        let _ = self.send_command_on(slot, IaxCommand::Inval, Vec::new());
                    }
                });
                let poke = self
                    .calls
                    .with_slot(callno, |slot| slot.poke_peer.clone())
                    .flatten();
                let reg = self
                    .calls
                    .with_slot(callno, |slot| slot.reg_index)
                    .flatten();
                match poke {
                    Some(peer) => self.finish_poke(callno, &peer, None),
                    None => self.destroy_call(callno, true),
                }
                if let Some(index) = reg {
                    // The registrar never answered; try again after a pause.
                    self.registry
                        .with_registration(index, |r| r.on_timeout());
                    self.sched.schedule(
                        now + Duration::from_secs(10),
                        TimerEvent::RegRefresh(index),
                    );
                }
            }
        }
    }

    fn on_ping_timer(&self, callno: u16, now: Instant) {
        self.calls.with_slot(callno, |slot| {
            if !slot.is_up() {
                return;
            }
            let ts = slot.tx_clock.nonvoice_ts(now);
            slot.ping_sent = Some((ts, now));
            let _ = self.transmit_full(
                slot,
                FrameType::Iax as u8,
                IaxCommand::Ping as u8,
                Vec::new(),
                Some(ts),
                true,
                false,
                false,
            );
            slot.timers.ping = Some(
                self.sched
                    .schedule(now + self.config.ping_time, TimerEvent::Ping(callno)),
            );
        });
    }

    fn on_lagrq_timer(&self, callno: u16, now: Instant) {
        self.calls.with_slot(callno, |slot| {
            if !slot.is_up() {
                return;
            }
            let ts = slot.tx_clock.nonvoice_ts(now);
            slot.lagrq_sent = Some((ts, now));
            let _ = self.transmit_full(
                slot,
                FrameType::Iax as u8,
                IaxCommand::LagRq as u8,
                Vec::new(),
                Some(ts),
                true,
                false,
                false,
            );
            slot.timers.lagrq = Some(
                self.sched
                    .schedule(now + self.config.lagrq_time, TimerEvent::Lagrq(callno)),
            );
        });
    }

    /// The outgoing call never progressed; congest it.
    fn on_maxtime(&self, callno: u16) {
        let still_waiting = self
            .calls
            .with_slot(callno, |slot| {
                slot.timers.maxtime = None;
                slot.direction == Direction::Outbound && !slot.is_up() && slot.alive()
            })
            .unwrap_or(false);
        if still_waiting {
            warn!(callno, "no response before maxtime, congesting");
            self.calls.with_slot(callno, |slot| {
                slot.hangup_cause = Some("no answer".into());
                slot.hangup_causecode = Some(cause::NORMAL_CIRCUIT_CONGESTION);
            });
            let _ = self.send_command_final(
                callno,
                IaxCommand::Hangup,
                vec![
                    Ie::Cause("timeout".into()),
                    Ie::CauseCode(cause::NORMAL_CIRCUIT_CONGESTION),
                ],
            );
            self.events.on_hangup(
                callno,
                Some("timeout"),
                Some(cause::NORMAL_CIRCUIT_CONGESTION),
            );
        }
    }

    /// Mid-call transmit-key rotation.
    fn on_keyrotate(&self, callno: u16, now: Instant) {
        self.calls.with_slot(callno, |slot| {
            slot.timers.keyrotate = None;
            if !slot.is_up() || !slot.enc.active() || !slot.enc.keyrotate_enabled() {
                return;
            }
            let (raw, interval) = {
                let mut rng = self.rng.lock();
                let mut raw = [0u8; 16];
                rand::RngCore::fill_bytes(&mut *rng, &mut raw);
                let interval =
                    rng.gen_range(Duration::from_secs(120)..=Duration::from_secs(300));
                (raw, interval)
            };
            let key = crypto::rotate_key(&raw);
            // RTKEY carries the installable key; it goes out under the old
            // transmit key, then the new one takes over.
            let _ = self.send_command_on(
                slot,
                IaxCommand::RtKey,
                vec![Ie::EncKey(key.to_vec())],
            );
            slot.enc.install_tx_key(key);
            info!(callno, "transmit key rotated");
            slot.timers.keyrotate = Some(
                self.sched
                    .schedule(now + interval, TimerEvent::KeyRotate(callno)),
            );
        });
    }

    fn on_delayed_reject(&self, callno: u16) {
        let pending = self
            .calls
            .with_slot(callno, |slot| slot.pending_reject.take())
            .flatten();
        if let Some((text, code)) = pending {
            let _ = self.send_command_final(
                callno,
                IaxCommand::Reject,
                vec![Ie::Cause(text), Ie::CauseCode(code)],
            );
        }
    }

    /// Time to (re-)register with a remote registrar.
    fn on_reg_refresh(&self, index: usize) {
        let Some((addr, username, state)) = self.registry.with_registration(index, |reg| {
            (reg.config.addr, reg.config.username.clone(), reg.state)
        }) else {
            return;
        };
        if self.is_shutting_down() {
            return;
        }
        if state == RegState::Rejected {
            debug!(index, "registration was rejected, not retrying");
            return;
        }

        let callno = match self.allocate_slot(
            addr,
            Direction::Outbound,
            SlotKind::Registration,
            false,
            true,
            None,
        ) {
            Ok(n) => n,
            Err(e) => {
                warn!(index, error = %e, "cannot allocate registration slot");
                let now = self.now();
                self.sched
                    .schedule(now + Duration::from_secs(10), TimerEvent::RegRefresh(index));
                return;
            }
        };
        let refresh = self
            .registry
            .with_registration(index, |reg| {
                reg.begin_attempt(callno);
                reg.refresh
            })
            .unwrap_or(60);
        self.calls.with_slot(callno, |slot| {
            slot.state = CallState::WaitAccept;
            slot.reg_index = Some(index);
            let _ = self.send_command_on(
                slot,
                IaxCommand::RegReq,
                vec![Ie::Username(username.clone()), Ie::Refresh(refresh)],
            );
        });
    }

    /// Send one qualify POKE and arm its timeout.
    fn on_qualify_poke(&self, name: &str, now: Instant) {
        let Some(peer) = self.registry.peer(name) else {
            return;
        };
        let (addr, maxms, busy) = {
            let peer = peer.lock();
            (peer.addr, peer.config.maxms, peer.poke_callno.is_some())
        };
        if maxms == 0 || busy {
            return;
        }
        let Some(addr) = addr else {
            // Unregistered dynamic peer; try again on the slow cadence.
            let freq = peer.lock().config.qualify_freq_notok;
            self.sched
                .schedule(now + freq, TimerEvent::QualifyPoke(name.to_string()));
            return;
        };

        let callno = match self.allocate_slot(
            addr,
            Direction::Outbound,
            SlotKind::Poke,
            false,
            true,
            Some(name),
        ) {
            Ok(n) => n,
            Err(e) => {
                debug!(peer = %name, error = %e, "poke slot allocation failed");
                return;
            }
        };

        self.calls.with_slot(callno, |slot| {
            slot.poke_peer = Some(name.to_string());
            let ts = slot.tx_clock.nonvoice_ts(now);
            slot.ping_sent = Some((ts, now));
            let _ = self.transmit_full(
                slot,
                FrameType::Iax as u8,
                IaxCommand::Poke as u8,
                Vec::new(),
                Some(ts),
                true,
                false,
                false,
            );
        });

        let timeout = self.sched.schedule(
            now + Duration::from_millis(u64::from(maxms.max(1))),
            TimerEvent::QualifyTimeout(name.to_string()),
        );
        let mut peer = peer.lock();
        peer.poke_callno = Some(callno);
        peer.qualify_timer = Some(timeout);
    }

    /// The poke went unanswered inside maxms.
    fn on_qualify_timeout(&self, name: &str) {
        let Some(peer) = self.registry.peer(name) else {
            return;
        };
        let callno = {
            let mut guard = peer.lock();
            guard.qualify_timer = None;
            guard.poke_callno
        };
        let Some(callno) = callno else { return };
        let was = peer.lock().status;
        if was != PeerStatus::Unreachable {
            info!(peer = %name, "peer unreachable");
        }
        self.finish_poke(callno, name, None);
    }

    /// A dynamic registration lapsed without refresh.
    fn on_peer_expire(&self, name: &str) {
        let Some(peer) = self.registry.peer(name) else {
            return;
        };
        {
            let mut guard = peer.lock();
            guard.expire_timer = None;
            let lapsed = guard
                .expiry_at
                .map(|at| at <= self.now())
                .unwrap_or(false);
            if !lapsed {
                return;
            }
            guard.addr = None;
            guard.expiry_at = None;
        }
        info!(peer = %name, "registration expired");
        self.store.delete(&format!("IAX/Registry/{name}"));
        self.events.on_registration(name, RegEvent::Unbound);
    }
}
