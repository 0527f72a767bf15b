//! Blocking hostname resolution on a worker pool.
//!
//! The reactor never calls `getaddrinfo` itself: it enqueues a
//! [`Resolution`] and goes back to polling. A fixed pool of workers takes
//! jobs from a mutex-and-condvar FIFO, consults a thread-local address
//! cache, falls back to the blocking system resolver, then posts the job on
//! the answer FIFO and wakes the reactor through its [`Waker`].
//!
//! A `Resolution` is shared between the session that asked for it and the
//! worker that serves it. Cancellation is a flag: tearing down a session
//! marks its pending job canceled and whichever side drops the last handle
//! frees it. Workers re-check the flag before resolving and again before
//! publishing, the reactor re-checks it when popping an answer, so a late
//! result can never touch a dead or recycled session slot.

use std::collections::VecDeque;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use lru::LruCache;
use mio::{Token, Waker};
use tracing::{debug, warn};

use crate::cache::DNS_CACHE_ENTRIES;

pub const DEFAULT_WORKERS: usize = 4;

/// One pending lookup, shared between a session and the worker pool.
pub struct Resolution {
    host: String,
    port: u16,
    token: Token,
    canceled: AtomicBool,
    addr: Mutex<Option<SocketAddr>>,
}

impl Resolution {
    pub fn new(host: String, port: u16, token: Token) -> Resolution {
        Resolution {
            host,
            port,
            token,
            canceled: AtomicBool::new(false),
            addr: Mutex::new(None),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Token of the session that asked for this lookup.
    pub fn token(&self) -> Token {
        self.token
    }

    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    /// `None` after the worker ran means the lookup failed.
    pub fn addr(&self) -> Option<SocketAddr> {
        *self.addr.lock().expect("resolution lock poisoned")
    }

    fn set_addr(&self, addr: SocketAddr) {
        *self.addr.lock().expect("resolution lock poisoned") = Some(addr);
    }
}

struct WorkQueue {
    jobs: VecDeque<Arc<Resolution>>,
    shutdown: bool,
}

struct Shared {
    queue: Mutex<WorkQueue>,
    available: Condvar,
    answers: Mutex<VecDeque<Arc<Resolution>>>,
    waker: Waker,
}

/// Handle on the worker threads, owned by the server.
pub struct ResolverPool {
    shared: Arc<Shared>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl ResolverPool {
    pub fn new(worker_count: usize, waker: Waker) -> ResolverPool {
        let shared = Arc::new(Shared {
            queue: Mutex::new(WorkQueue {
                jobs: VecDeque::new(),
                shutdown: false,
            }),
            available: Condvar::new(),
            answers: Mutex::new(VecDeque::new()),
            waker,
        });

        let workers = (0..worker_count.max(1))
            .map(|id| {
                let shared = shared.clone();
                thread::Builder::new()
                    .name(format!("resolver-{id}"))
                    .spawn(move || worker_loop(shared, id))
                    .expect("could not spawn resolver worker")
            })
            .collect();

        ResolverPool { shared, workers }
    }

    /// Hand a lookup to the pool.
    pub fn submit(&self, resolution: Arc<Resolution>) {
        let mut queue = self.shared.queue.lock().expect("resolver queue poisoned");
        queue.jobs.push_back(resolution);
        self.shared.available.notify_one();
    }

    /// Take every answer posted since the last wake. The waker coalesces
    /// notifications, so the reactor must drain the whole queue per wake.
    pub fn drain_answers(&self) -> Vec<Arc<Resolution>> {
        let mut answers = self.shared.answers.lock().expect("resolver answers poisoned");
        answers.drain(..).collect()
    }
}

impl Drop for ResolverPool {
    fn drop(&mut self) {
        {
            let mut queue = self.shared.queue.lock().expect("resolver queue poisoned");
            queue.shutdown = true;
        }
        self.shared.available.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_loop(shared: Arc<Shared>, id: usize) {
    let mut cache: LruCache<String, SocketAddr> =
        LruCache::new(NonZeroUsize::new(DNS_CACHE_ENTRIES).expect("dns cache capacity"));

    loop {
        let job = {
            let mut queue = shared.queue.lock().expect("resolver queue poisoned");
            loop {
                if queue.shutdown {
                    return;
                }
                if let Some(job) = queue.jobs.pop_front() {
                    break job;
                }
                queue = shared
                    .available
                    .wait(queue)
                    .expect("resolver queue poisoned");
            }
        };

        if job.is_canceled() {
            continue;
        }

        let key = format!("{}:{}", job.host(), job.port());
        match cache.get(&key) {
            Some(addr) => {
                debug!("resolver-{id}: cache hit for {key}");
                job.set_addr(*addr);
            }
            None => match lookup(job.host(), job.port()) {
                Ok(addr) => {
                    cache.put(key, addr);
                    job.set_addr(addr);
                }
                Err(error) => {
                    warn!("resolver-{id}: could not resolve {key}: {error}");
                }
            },
        }

        if job.is_canceled() {
            continue;
        }

        shared
            .answers
            .lock()
            .expect("resolver answers poisoned")
            .push_back(job);
        if let Err(error) = shared.waker.wake() {
            warn!("resolver-{id}: could not wake the event loop: {error}");
        }
    }
}

/// Blocking `getaddrinfo`, preferring an IPv4 record like the rest of the
/// proxy's v4 listener setup.
fn lookup(host: &str, port: u16) -> io::Result<SocketAddr> {
    let addrs: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address records"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn pool_with_waker() -> (mio::Poll, ResolverPool) {
        let poll = mio::Poll::new().unwrap();
        let waker = Waker::new(poll.registry(), Token(1)).unwrap();
        let pool = ResolverPool::new(1, waker);
        (poll, pool)
    }

    fn wait_for_answers(pool: &ResolverPool) -> Vec<Arc<Resolution>> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            let answers = pool.drain_answers();
            if !answers.is_empty() {
                return answers;
            }
            thread::sleep(Duration::from_millis(10));
        }
        Vec::new()
    }

    #[test]
    fn numeric_host_resolves() {
        let (_poll, pool) = pool_with_waker();
        let job = Arc::new(Resolution::new("127.0.0.1".to_string(), 8080, Token(3)));
        pool.submit(job);

        let answers = wait_for_answers(&pool);
        assert_eq!(answers.len(), 1);
        let addr = answers[0].addr().expect("numeric lookup succeeds");
        assert_eq!(addr, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(answers[0].token(), Token(3));
    }

    #[test]
    fn failed_lookup_is_answered_without_address() {
        let (_poll, pool) = pool_with_waker();
        let job = Arc::new(Resolution::new(
            "does-not-exist.invalid".to_string(),
            80,
            Token(3),
        ));
        pool.submit(job);

        let answers = wait_for_answers(&pool);
        assert_eq!(answers.len(), 1);
        assert!(answers[0].addr().is_none());
    }

    #[test]
    fn canceled_job_is_never_answered() {
        let (_poll, pool) = pool_with_waker();
        let job = Arc::new(Resolution::new("127.0.0.1".to_string(), 80, Token(3)));
        job.cancel();
        pool.submit(job);

        thread::sleep(Duration::from_millis(200));
        assert!(pool.drain_answers().is_empty());
    }
}
