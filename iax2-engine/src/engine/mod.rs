//! The engine root: one value owning every subsystem, driven by inbound
//! datagrams, timer events and the host's call-control API.

mod handlers;
mod rx;
mod timers;
mod tx;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tracing::{debug, info, warn};

use iax2_proto::constants::{cause, ControlKind, FrameType, IaxCommand};
use iax2_proto::Ie;
use iax2_transport::time::{SystemTimeProvider, TimeProvider};

use crate::acl::Acl;
use crate::auth::KeyStore;
use crate::call::{CallSlot, CallState, CallTable, Direction, SlotKind, TransferState};
use crate::callno::{CallNumberPool, PeerCounts, MIN_REUSE_TIME};
use crate::calltoken::CallTokenGuard;
use crate::config::{CallNumberLimits, CallTokenPolicy, Config, RegistrationConfig};
use crate::error::{EngineError, EngineResult};
use crate::events::{ChannelEvents, NullEvents, Transport};
use crate::registry::{MemoryStore, Registry, RegistryStore};
use crate::sched::{Scheduler, TimerEvent};
use crate::trunk::{TrunkConfig, TrunkManager};

/// Everything a dial needs to know.
#[derive(Debug, Clone, Default)]
pub struct DialRequest {
    /// Named peer to call; its address and credentials apply.
    pub peer: Option<String>,
    /// Explicit destination when no peer is named.
    pub addr: Option<SocketAddr>,
    pub called_number: String,
    pub called_context: Option<String>,
    pub calling_number: Option<String>,
    pub calling_name: Option<String>,
    pub username: Option<String>,
    pub secret: Option<String>,
    pub language: Option<String>,
    /// Capability override; 0 uses the engine default.
    pub capability: u64,
}

pub struct Engine {
    pub(crate) config: Config,
    pub(crate) limits: CallNumberLimits,
    pub(crate) time: Arc<dyn TimeProvider>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) events: Arc<dyn ChannelEvents>,
    pub(crate) store: Arc<dyn RegistryStore>,
    pub(crate) keys: KeyStore,
    pub(crate) calls: CallTable,
    pub(crate) pool: CallNumberPool,
    pub(crate) counts: PeerCounts,
    pub(crate) registry: Registry,
    pub(crate) tokens: CallTokenGuard,
    pub(crate) trunks: TrunkManager,
    pub(crate) sched: Scheduler,
    pub(crate) rng: Mutex<StdRng>,
    shutdown: AtomicBool,
}

pub struct EngineBuilder {
    config: Config,
    limits: CallNumberLimits,
    time: Arc<dyn TimeProvider>,
    transport: Arc<dyn Transport>,
    events: Arc<dyn ChannelEvents>,
    store: Arc<dyn RegistryStore>,
    keys: KeyStore,
    rng_seed: Option<u64>,
}

impl EngineBuilder {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            config: Config::default(),
            limits: CallNumberLimits::default(),
            time: Arc::new(SystemTimeProvider),
            transport,
            events: Arc::new(NullEvents),
            store: Arc::new(MemoryStore::default()),
            keys: KeyStore::new(),
            rng_seed: None,
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn limits(mut self, limits: CallNumberLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn time(mut self, time: Arc<dyn TimeProvider>) -> Self {
        self.time = time;
        self
    }

    pub fn events(mut self, events: Arc<dyn ChannelEvents>) -> Self {
        self.events = events;
        self
    }

    pub fn store(mut self, store: Arc<dyn RegistryStore>) -> Self {
        self.store = store;
        self
    }

    pub fn keys(mut self, keys: KeyStore) -> Self {
        self.keys = keys;
        self
    }

    /// Pins the RNG for reproducible tests.
    pub fn rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    pub fn build(self) -> Arc<Engine> {
        let mut rng = match self.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let mut config = self.config;
        if config.calltoken_secret == [0; 16] {
            rng.fill_bytes(&mut config.calltoken_secret);
        }

        let now = self.time.now_instant();
        let tokens = CallTokenGuard::new(config.calltoken_secret, config.max_calltoken_delay);
        let trunks = TrunkManager::new(
            TrunkConfig {
                mtu: config.trunk_mtu,
                max_size: config.trunk_max_size,
                timestamps: config.trunk_timestamps,
            },
            now,
        );
        let counts = PeerCounts::new(config.max_call_numbers_nonvalidated);

        let engine = Arc::new(Engine {
            tokens,
            trunks,
            counts,
            config,
            limits: self.limits,
            time: self.time,
            transport: self.transport,
            events: self.events,
            store: self.store,
            keys: self.keys,
            calls: CallTable::new(),
            pool: CallNumberPool::new(),
            registry: Registry::new(),
            sched: Scheduler::new(),
            rng: Mutex::new(rng),
            shutdown: AtomicBool::new(false),
        });

        // The trunk drain and reap cycle runs for the engine's whole life.
        engine
            .sched
            .schedule(now + engine.config.trunk_freq, TimerEvent::TrunkTick);
        engine
    }
}

impl Engine {
    pub fn builder(transport: Arc<dyn Transport>) -> EngineBuilder {
        EngineBuilder::new(transport)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Stops timers from rescheduling and tears down every live call.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("engine shutting down");
        for callno in self.calls.live_callnos() {
            let _ = self.hangup(callno, Some("shutdown"), Some(cause::NORMAL_CLEARING));
            self.destroy_call(callno, false);
        }
    }

    pub(crate) fn now(&self) -> Instant {
        self.time.now_instant()
    }

    /// Resolves the per-remote call-number cap: config ranges first, then a
    /// named peer's own cap, then the global default.
    pub(crate) fn callno_limit_for(&self, addr: SocketAddr, peer: Option<&str>) -> u32 {
        if let Some(limit) = self.limits.limit_for(addr.ip()) {
            return limit;
        }
        if let Some(name) = peer {
            if let Some(peer) = self.registry.peer(name) {
                if let Some(limit) = peer.lock().config.max_call_numbers {
                    return limit;
                }
            }
        }
        self.config.max_call_numbers
    }

    /// Allocates a call number plus its quota charge and installs a fresh
    /// slot. The quarantine return is scheduled when the slot dies.
    pub(crate) fn allocate_slot(
        &self,
        addr: SocketAddr,
        direction: Direction,
        kind: SlotKind,
        trunk: bool,
        validated: bool,
        peer: Option<&str>,
    ) -> EngineResult<u16> {
        let limit = self.callno_limit_for(addr, peer);
        self.counts.acquire(addr.ip(), limit, validated)?;

        let callno = {
            let mut rng = self.rng.lock();
            match self.pool.allocate(trunk, &mut *rng) {
                Ok(n) => n,
                Err(e) => {
                    self.counts.release(addr.ip(), validated);
                    return Err(e);
                }
            }
        };

        let now = self.now();
        let mut slot = CallSlot::new(callno, addr, direction, kind, now);
        slot.trunk = trunk;
        slot.validated = validated;
        slot.capability = self.config.capability;
        if self.config.jitterbuffer && kind == SlotKind::Call {
            slot.enable_jitterbuffer(self.config.jitter);
        }
        self.calls.insert(slot);
        debug!(callno, %addr, ?kind, "slot allocated");
        Ok(callno)
    }

    /// Tears a slot down: cancels its timers, unlinks it and schedules the
    /// quarantined return of its number. `notify` delivers the hangup to the
    /// PBX when the slot carried a real call.
    pub(crate) fn destroy_call(&self, callno: u16, notify: bool) {
        let Some(mut slot) = self.calls.take(callno) else {
            return;
        };
        slot.destroy_initiated = true;
        for id in slot.timers.drain() {
            self.sched.cancel(id);
        }
        if slot.authreq_charged {
            if let Some(name) = &slot.remote_identity {
                self.registry.end_authreq(name);
            }
        }
        let now = self.now();
        self.sched.schedule(
            now + MIN_REUSE_TIME,
            TimerEvent::ReturnCallno {
                callno,
                ip: slot.addr.ip(),
                validated: slot.validated,
                charged: true,
            },
        );
        debug!(callno, "slot destroyed");
        if notify && slot.kind == SlotKind::Call {
            self.events.on_hangup(
                callno,
                slot.hangup_cause.as_deref(),
                slot.hangup_causecode,
            );
        }
    }

    // ---- Host call-control API -------------------------------------------

    /// Places an outgoing call. Returns the local call number.
    pub fn dial(&self, req: DialRequest) -> EngineResult<u16> {
        if self.is_shutting_down() {
            return Err(EngineError::Shutdown);
        }

        let mut trunk = false;
        let mut secret = req.secret.clone();
        let mut username = req.username.clone();
        let mut outkey = None;
        let mut enc_offer = self.config.encryption;
        let mut force_enc = self.config.force_encryption;
        let addr = match (&req.peer, req.addr) {
            (Some(name), _) => {
                let peer = self
                    .registry
                    .peer(name)
                    .ok_or_else(|| EngineError::UnknownPeer(name.clone()))?;
                let peer = peer.lock();
                trunk = peer.config.trunk;
                if secret.is_none() {
                    secret = peer.config.credentials.secret.clone();
                }
                if username.is_none() {
                    username = Some(peer.config.name.clone());
                }
                outkey = peer.config.credentials.outkey.clone();
                if peer.config.encryption != 0 {
                    enc_offer = peer.config.encryption;
                }
                force_enc |= peer.config.force_encryption;
                peer.addr.ok_or_else(|| {
                    warn!(peer = %name, "dial to unregistered dynamic peer");
                    EngineError::UnknownPeer(name.clone())
                })?
            }
            (None, Some(addr)) => addr,
            (None, None) => {
                return Err(EngineError::UnknownPeer("(no destination)".into()));
            }
        };

        let callno = self.allocate_slot(
            addr,
            Direction::Outbound,
            SlotKind::Call,
            trunk,
            true,
            req.peer.as_deref(),
        )?;

        let capability = if req.capability != 0 {
            req.capability
        } else {
            self.config.capability
        };

        let now = self.now();
        self.calls.with_slot(callno, |slot| {
            slot.state = CallState::WaitAccept;
            slot.capability = capability;
            slot.username = username.clone();
            slot.secret = secret.clone();
            slot.outkey = outkey.clone();
            slot.remote_identity = req.peer.clone();
            slot.enc_offered = enc_offer;
            slot.force_encryption = force_enc;
            slot.caller.called_number = Some(req.called_number.clone());
            slot.caller.called_context = req.called_context.clone();
            slot.caller.calling_number = req.calling_number.clone();
            slot.caller.calling_name = req.calling_name.clone();
            slot.caller.language = req.language.clone();
            slot.timers.maxtime = Some(self.sched.schedule(
                now + self.config.max_time,
                TimerEvent::MaxTimeExpired(callno),
            ));
        });

        self.send_new(callno)?;
        Ok(callno)
    }

    /// Answers an inbound call that was left ringing.
    pub fn answer(&self, callno: u16) -> EngineResult<()> {
        self.send_control(callno, ControlKind::Answer)
    }

    /// Hangs up a call; the final frame lingers until acked.
    pub fn hangup(
        &self,
        callno: u16,
        cause_text: Option<&str>,
        code: Option<u8>,
    ) -> EngineResult<()> {
        let mut ies = Vec::new();
        if let Some(text) = cause_text {
            ies.push(Ie::Cause(text.to_string()));
        }
        if let Some(code) = code {
            ies.push(Ie::CauseCode(code));
        }
        self.calls
            .with_slot(callno, |slot| {
                slot.hangup_cause = cause_text.map(str::to_string);
                slot.hangup_causecode = code;
            })
            .ok_or(EngineError::NoSuchCall(callno))?;
        self.send_command_final(callno, IaxCommand::Hangup, ies)
    }

    /// Sends voice for an up call: a mini frame normally, a trunk entry for
    /// trunked calls, a full frame whenever the compressed timestamp would
    /// lose information or the codec changed.
    pub fn send_voice(&self, callno: u16, payload: &[u8], frame_ms: u32) -> EngineResult<()> {
        let now = self.now();

        enum Plan {
            Mini {
                addr: SocketAddr,
                scallno: u16,
                ts16: u16,
            },
            Trunk {
                addr: SocketAddr,
                scallno: u16,
                ts16: u16,
            },
            Full(u64, u32),
        }

        let plan = self
            .calls
            .with_slot(callno, |slot| {
                if !slot.is_up() {
                    return Err(EngineError::BadCallState(callno));
                }
                if slot.quelched {
                    return Ok(None);
                }
                let ts = slot.tx_clock.voice_ts(now, frame_ms);
                let format = slot.format;
                let needs_full = slot.last_voice_format != format
                    || slot
                        .last_full_voice_ts
                        .map(|full| full & 0xFFFF_0000 != ts & 0xFFFF_0000)
                        .unwrap_or(true);
                if slot.trunk && !needs_full {
                    return Ok(Some(Plan::Trunk {
                        addr: slot.media_addr(),
                        scallno: slot.callno,
                        ts16: ts as u16,
                    }));
                }
                if needs_full {
                    Ok(Some(Plan::Full(format, ts)))
                } else {
                    Ok(Some(Plan::Mini {
                        addr: slot.media_addr(),
                        scallno: slot.callno,
                        ts16: ts as u16,
                    }))
                }
            })
            .ok_or(EngineError::NoSuchCall(callno))??;

        match plan {
            None => Ok(()),
            Some(Plan::Full(format, ts)) => self.send_full_voice(callno, format, ts, payload),
            Some(Plan::Mini {
                addr,
                scallno,
                ts16,
            }) => {
                let frame = iax2_proto::MiniFrame {
                    scallno,
                    ts: ts16,
                    payload: payload.to_vec(),
                };
                self.transport.send_to(&frame.encode(), addr)?;
                Ok(())
            }
            Some(Plan::Trunk {
                addr,
                scallno,
                ts16,
            }) => {
                if let Some(flush) = self.trunks.queue(addr, scallno, ts16, payload, now) {
                    self.transport.send_to(&flush.data, flush.addr)?;
                }
                Ok(())
            }
        }
    }

    /// Sends a video frame (15-bit timestamp plus mark).
    pub fn send_video(&self, callno: u16, payload: &[u8], mark: bool) -> EngineResult<()> {
        let now = self.now();
        let (addr, scallno, ts) = self
            .calls
            .with_slot(callno, |slot| {
                if !slot.is_up() {
                    return Err(EngineError::BadCallState(callno));
                }
                let ts = slot.tx_clock.nonvoice_ts(now);
                Ok((slot.media_addr(), slot.callno, ts))
            })
            .ok_or(EngineError::NoSuchCall(callno))??;
        let frame = iax2_proto::VideoFrame {
            scallno,
            ts: (ts & 0x7FFF) as u16,
            mark,
            payload: payload.to_vec(),
        };
        self.transport.send_to(&frame.encode(), addr)?;
        Ok(())
    }

    /// Sends a whitelisted control frame.
    pub fn send_control(&self, callno: u16, kind: ControlKind) -> EngineResult<()> {
        if !kind.allowed_on_wire() {
            debug!(?kind, "control kind dropped at the boundary");
            return Ok(());
        }
        self.send_full_frame(callno, FrameType::Control as u8, kind as u8, Vec::new(), &[])
    }

    pub fn send_dtmf(&self, callno: u16, digit: char) -> EngineResult<()> {
        self.send_full_frame(
            callno,
            FrameType::DtmfEnd as u8,
            digit as u8,
            Vec::new(),
            &[],
        )
    }

    pub fn send_text(&self, callno: u16, text: &str) -> EngineResult<()> {
        self.send_full_frame(callno, FrameType::Text as u8, 0, Vec::new(), text.as_bytes())
    }

    /// Reads jitter-buffered media for an up call.
    pub fn read_media(
        &self,
        callno: u16,
        interp_ms: u32,
    ) -> EngineResult<iax2_transport::JitterVerdict> {
        let now = self.now();
        self.calls
            .with_slot(callno, |slot| match slot.jb.as_mut() {
                Some(jb) => Ok(jb.get(now, interp_ms)),
                None => Ok(iax2_transport::JitterVerdict::Empty),
            })
            .ok_or(EngineError::NoSuchCall(callno))?
    }

    /// Registers an outbound registration target and kicks off the first
    /// REGREQ.
    pub fn add_registration(&self, config: RegistrationConfig) -> usize {
        let index = self.registry.add_registration(config);
        self.sched
            .schedule(self.now(), TimerEvent::RegRefresh(index));
        index
    }

    /// Starts qualify pokes for a configured peer.
    pub fn start_qualify(&self, peer_name: &str) {
        if let Some(peer) = self.registry.peer(peer_name) {
            let maxms = peer.lock().config.maxms;
            if maxms > 0 {
                self.sched
                    .schedule(self.now(), TimerEvent::QualifyPoke(peer_name.to_string()));
            }
        }
    }

    /// Moves an up call onto a trunk call number. Both slot locks are taken
    /// in ascending order for the move.
    pub fn make_trunk(&self, callno: u16) -> EngineResult<u16> {
        if CallNumberPool::is_trunk_callno(callno) {
            return Ok(callno);
        }
        let addr = self
            .calls
            .with_slot(callno, |slot| slot.addr)
            .ok_or(EngineError::NoSuchCall(callno))?;

        let new_callno = {
            let mut rng = self.rng.lock();
            self.pool.allocate(true, &mut *rng)?
        };
        if !self.calls.move_slot(callno, new_callno) {
            self.pool.release(new_callno);
            return Err(EngineError::NoSuchCall(callno));
        }
        let now = self.now();
        self.calls.with_slot(new_callno, |slot| {
            slot.trunk = true;
            // Timers scheduled under the old number would fire into a void;
            // rearm everything against the new one.
            for id in slot.timers.drain() {
                self.sched.cancel(id);
            }
            self.start_call_timers(slot, now);
            self.arm_retrans_timer(slot);
        });

        // The old number takes the usual quarantined path home; its quota
        // charge moves with the slot, so only the number returns.
        self.sched.schedule(
            now + MIN_REUSE_TIME,
            TimerEvent::ReturnCallno {
                callno,
                ip: addr.ip(),
                validated: true,
                charged: false,
            },
        );
        info!(callno, new_callno, "call moved to trunk");
        Ok(new_callno)
    }

    /// Starts a native transfer between two locally bridged calls.
    pub fn begin_transfer(&self, a: u16, b: u16) -> EngineResult<()> {
        let transfer_id = self.rng.lock().next_u32();
        let (addr_a, peer_a) = self
            .calls
            .with_slot(a, |s| (s.addr, s.peer_callno))
            .ok_or(EngineError::NoSuchCall(a))?;
        let (addr_b, peer_b) = self
            .calls
            .with_slot(b, |s| (s.addr, s.peer_callno))
            .ok_or(EngineError::NoSuchCall(b))?;

        self.calls.with_two_slots(a, b, |sa, sb| {
            sa.transfer = TransferState::Begin;
            sb.transfer = TransferState::Begin;
            sa.transfer_id = transfer_id;
            sb.transfer_id = transfer_id;
            sa.bridged_with = Some(sb.callno);
            sb.bridged_with = Some(sa.callno);
        });

        // Tell each endpoint where the other lives.
        self.send_command(
            a,
            IaxCommand::TxReq,
            vec![
                Ie::TransferId(transfer_id),
                Ie::ApparentAddr(addr_b),
                Ie::CallNo(peer_b),
            ],
        )?;
        self.send_command(
            b,
            IaxCommand::TxReq,
            vec![
                Ie::TransferId(transfer_id),
                Ie::ApparentAddr(addr_a),
                Ie::CallNo(peer_a),
            ],
        )?;
        Ok(())
    }

    // ---- Introspection ---------------------------------------------------

    /// Call numbers with live slots.
    pub fn live_calls(&self) -> Vec<u16> {
        self.calls.live_callnos()
    }

    pub fn call_state(&self, callno: u16) -> Option<CallState> {
        self.calls.with_slot(callno, |slot| slot.state)
    }

    /// Whether the slot's creator completed a call-token round trip.
    pub fn call_validated(&self, callno: u16) -> Option<bool> {
        self.calls.with_slot(callno, |slot| slot.validated)
    }

    pub fn call_format(&self, callno: u16) -> Option<u64> {
        self.calls.with_slot(callno, |slot| slot.format)
    }

    /// Call numbers currently charged to unvalidated senders.
    pub fn nonvalidated_in_use(&self) -> u32 {
        self.counts.nonvalidated_in_use()
    }

    /// Effective call-token policy for a source address, named identity
    /// overrides considered.
    pub(crate) fn token_policy_for(&self, name: Option<&str>) -> CallTokenPolicy {
        if let Some(name) = name {
            if let Some(user) = self.registry.user(name) {
                if let Some(p) = user.calltoken_policy {
                    return p;
                }
            }
            if let Some(peer) = self.registry.peer(name) {
                if let Some(p) = peer.lock().config.calltoken_policy {
                    return p;
                }
            }
        }
        self.config.calltoken_policy
    }

    pub(crate) fn token_ignores(&self) -> &Acl {
        &self.config.calltoken_ignores
    }
}
