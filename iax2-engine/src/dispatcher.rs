//! The worker pool that runs received datagrams to completion.
//!
//! A fixed pool of threads waits on a rendezvous channel; when every worker
//! is busy, dynamic workers spawn up to a cap and retire after 30 seconds
//! idle. When even that fails the datagram is dropped and the protocol's
//! retransmission covers the loss.
//!
//! Ordering: while a worker is processing a **full** frame for one
//! (address, call) pair, further full frames for that pair are deferred into
//! a queue drained by the same worker in sequence-number order. Mini, video
//! and meta frames never defer.

use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{debug, info, trace, warn};

use iax2_proto::constants::FLAG_FULL;

use crate::engine::Engine;

/// How long a dynamic worker lingers before retiring.
const DYNAMIC_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

type CallKey = (SocketAddr, u16);

struct Job {
    data: Vec<u8>,
    from: SocketAddr,
    /// Set when this job claimed the per-call in-flight entry and must
    /// drain the deferred queue before releasing it.
    claimed: Option<CallKey>,
}

#[derive(Default)]
struct Deferred {
    /// Sequence number of the frame currently being processed; the drain
    /// picks the closest follower.
    last_oseqno: u8,
    frames: SmallVec<[(u8, Vec<u8>); 4]>,
}

struct Shared {
    engine: Arc<Engine>,
    inflight: Mutex<HashMap<CallKey, Deferred>>,
    dynamic_count: AtomicUsize,
    shutdown: AtomicBool,
}

pub struct Dispatcher {
    shared: Arc<Shared>,
    tx: Option<Sender<Job>>,
    rx: Receiver<Job>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    max_dynamic: usize,
}

impl Dispatcher {
    /// Creates the pool with the engine's configured thread counts.
    pub fn start(engine: Arc<Engine>) -> Arc<Dispatcher> {
        let pool_size = engine.config().thread_count.max(1);
        let max_dynamic = engine
            .config()
            .max_thread_count
            .saturating_sub(pool_size);

        let (tx, rx) = bounded::<Job>(0);
        let shared = Arc::new(Shared {
            engine,
            inflight: Mutex::new(HashMap::new()),
            dynamic_count: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
        });

        let dispatcher = Arc::new(Dispatcher {
            shared: shared.clone(),
            tx: Some(tx),
            rx: rx.clone(),
            workers: Mutex::new(Vec::new()),
            max_dynamic,
        });

        let mut workers = dispatcher.workers.lock();
        for idx in 0..pool_size {
            let shared = shared.clone();
            let rx = rx.clone();
            workers.push(
                std::thread::Builder::new()
                    .name(format!("iax2-worker-{idx}"))
                    .spawn(move || pooled_worker(shared, rx))
                    .expect("worker thread spawn"),
            );
        }
        drop(workers);
        info!(pool_size, max_dynamic, "dispatcher started");
        dispatcher
    }

    /// Routes one datagram. Called from the network thread; never blocks.
    pub fn dispatch(&self, data: Vec<u8>, from: SocketAddr) {
        if self.shared.shutdown.load(Ordering::SeqCst) {
            return;
        }

        let claimed = match full_frame_key(&data, from) {
            Some((key, oseqno)) => {
                let mut inflight = self.shared.inflight.lock();
                if let Some(entry) = inflight.get_mut(&key) {
                    // Same call already on a worker: defer in oseqno order.
                    entry.frames.push((oseqno, data));
                    trace!(?key, oseqno, "full frame deferred");
                    return;
                }
                inflight.insert(
                    key,
                    Deferred {
                        last_oseqno: oseqno,
                        frames: SmallVec::new(),
                    },
                );
                Some(key)
            }
            None => None,
        };

        let job = Job {
            data,
            from,
            claimed,
        };
        let Some(tx) = &self.tx else { return };
        match tx.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(job)) => self.spawn_dynamic_or_drop(job),
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// All pooled workers are busy; add a dynamic one or shed load.
    fn spawn_dynamic_or_drop(&self, job: Job) {
        let count = self.shared.dynamic_count.load(Ordering::SeqCst);
        if count >= self.max_dynamic {
            debug!("no worker available, dropping datagram");
            if let Some(key) = job.claimed {
                self.shared.inflight.lock().remove(&key);
            }
            return;
        }
        self.shared.dynamic_count.fetch_add(1, Ordering::SeqCst);
        let shared = self.shared.clone();
        let rx = self.rx.clone();
        let spawned = std::thread::Builder::new()
            .name("iax2-worker-dyn".into())
            .spawn(move || dynamic_worker(shared, rx, job));
        if let Err(e) = spawned {
            warn!(error = %e, "dynamic worker spawn failed, dropping datagram");
            self.shared.dynamic_count.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Stops the pool: no new jobs, workers drain and exit, threads join.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        for handle in self.workers.lock().drain(..) {
            let _ = handle.join();
        }
    }

    /// Live dynamic worker count, for observability and tests.
    pub fn dynamic_workers(&self) -> usize {
        self.shared.dynamic_count.load(Ordering::SeqCst)
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.tx.take();
        self.shutdown();
    }
}

/// Claim key and oseqno when the datagram is a full frame.
fn full_frame_key(data: &[u8], from: SocketAddr) -> Option<(CallKey, u8)> {
    if data.len() < 12 {
        return None;
    }
    let word0 = u16::from_be_bytes([data[0], data[1]]);
    if word0 & FLAG_FULL == 0 {
        return None;
    }
    Some(((from, word0 & !FLAG_FULL), data[8]))
}

fn pooled_worker(shared: Arc<Shared>, rx: Receiver<Job>) {
    loop {
        if shared.shutdown.load(Ordering::SeqCst) {
            return;
        }
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(job) => run_job(&shared, job),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
        }
    }
}

fn dynamic_worker(shared: Arc<Shared>, rx: Receiver<Job>, first: Job) {
    run_job(&shared, first);
    loop {
        if shared.shutdown.load(Ordering::SeqCst) {
            break;
        }
        match rx.recv_timeout(DYNAMIC_IDLE_TIMEOUT) {
            Ok(job) => run_job(&shared, job),
            Err(_) => break,
        }
    }
    shared.dynamic_count.fetch_sub(1, Ordering::SeqCst);
    trace!("dynamic worker retired");
}

/// Processes one job and, for full frames, drains everything that was
/// deferred onto this call while we worked.
fn run_job(shared: &Shared, job: Job) {
    let Job {
        mut data,
        from,
        claimed,
    } = job;

    let Some(key) = claimed else {
        shared.engine.handle_datagram(&data, from);
        return;
    };

    loop {
        shared.engine.handle_datagram(&data, from);

        let next = {
            let mut inflight = shared.inflight.lock();
            let Some(entry) = inflight.get_mut(&key) else {
                break;
            };
            if entry.frames.is_empty() {
                inflight.remove(&key);
                break;
            }
            // Closest follower of the frame just processed, modulo 256.
            let last = entry.last_oseqno;
            let Some(idx) = entry
                .frames
                .iter()
                .enumerate()
                .min_by_key(|(_, (oseq, _))| oseq.wrapping_sub(last))
                .map(|(i, _)| i)
            else {
                inflight.remove(&key);
                break;
            };
            let (oseq, frame) = entry.frames.swap_remove(idx);
            entry.last_oseqno = oseq;
            frame
        };
        data = next;
    }
}

/// The network thread: owns the socket, reads datagrams, hands them to the
/// dispatcher. Never touches call state.
pub struct NetRunner {
    handle: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl NetRunner {
    pub fn spawn(socket: UdpSocket, dispatcher: Arc<Dispatcher>) -> std::io::Result<NetRunner> {
        socket.set_read_timeout(Some(Duration::from_millis(200)))?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        let handle = std::thread::Builder::new()
            .name("iax2-net".into())
            .spawn(move || {
                let mut buf = vec![0u8; 65536];
                loop {
                    if flag.load(Ordering::SeqCst) {
                        return;
                    }
                    match socket.recv_from(&mut buf) {
                        Ok((len, from)) => {
                            dispatcher.dispatch(buf[..len].to_vec(), from);
                        }
                        Err(e)
                            if e.kind() == std::io::ErrorKind::WouldBlock
                                || e.kind() == std::io::ErrorKind::TimedOut =>
                        {
                            continue;
                        }
                        Err(e) => {
                            warn!(error = %e, "socket receive failed");
                            return;
                        }
                    }
                }
            })?;
        Ok(NetRunner {
            handle: Some(handle),
            shutdown,
        })
    }

    pub fn stop(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// The timer pump thread: sleeps until the scheduler's next deadline and
/// runs what is due. Only meaningful with the system clock.
pub struct TimerRunner {
    handle: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl TimerRunner {
    pub fn spawn(engine: Arc<Engine>) -> TimerRunner {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        let handle = std::thread::Builder::new()
            .name("iax2-sched".into())
            .spawn(move || loop {
                if flag.load(Ordering::SeqCst) {
                    return;
                }
                engine.poll_timers();
                let sleep = engine
                    .next_timer_deadline()
                    .map(|at| {
                        at.saturating_duration_since(std::time::Instant::now())
                            .min(Duration::from_millis(100))
                    })
                    .unwrap_or(Duration::from_millis(100));
                std::thread::sleep(sleep.max(Duration::from_millis(1)));
            })
            .expect("scheduler thread spawn");
        TimerRunner {
            handle: Some(handle),
            shutdown,
        }
    }

    pub fn stop(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
