//! Bounded-concurrency fetcher for external, rate-limited services.
//!
//! Every download gets a [`DownloadTicket`] in arrival order and waits for a
//! slot from a fixed-size pool. The pool is backed by a fair semaphore, so
//! first attempts are admitted strictly FIFO. A slot is only held while a
//! request is paced and on the wire; backoff sleeps happen outside the pool
//! so a throttled ticket never blocks the ones queued behind it.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use notesync_core::{DownloadTicket, TicketState};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::retry::{classify_reqwest_error, classify_status, RetryDisposition, RetryPolicy};

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub retry_after: Option<Duration>,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    fn disposition(&self) -> RetryDisposition {
        match self {
            TransportError::Reqwest(err) => classify_reqwest_error(err),
            TransportError::Timeout(_) | TransportError::Other(_) => RetryDisposition::Retryable,
        }
    }
}

/// One GET against an external service. Abstracted so the fetcher's
/// admission and retry logic can be exercised without a network.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &str) -> Result<TransportResponse, TransportError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(config: &HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(&self, url: &str) -> Result<TransportResponse, TransportError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        let retry_after = parse_retry_after(resp.headers());
        let body = if status.is_success() {
            resp.bytes().await?.to_vec()
        } else {
            Vec::new()
        };
        Ok(TransportResponse {
            status,
            final_url,
            retry_after,
            body,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

/// Request pacing on top of the concurrency ceiling, for services that
/// publish a request-rate budget. Tokens accrue one per `refill_every` up to
/// `capacity`; a partial interval carries over to the next take.
#[derive(Debug)]
struct TokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    accrued_until: Instant,
}

impl TokenBucket {
    fn new(config: TokenBucketConfig) -> Self {
        let capacity = config.capacity.max(1);
        Self {
            capacity,
            refill_every: config.refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                accrued_until: Instant::now(),
            }),
        }
    }

    /// Time until the next token, or `None` once one has been taken.
    fn try_take(&self, state: &mut TokenBucketState, now: Instant) -> Option<Duration> {
        let pending = now.saturating_duration_since(state.accrued_until);
        let earned = pending.as_nanos() / self.refill_every.as_nanos();
        if earned > 0 {
            let room = self.capacity - state.tokens;
            if earned >= u128::from(room) {
                // Full bucket: nothing accrues past capacity.
                state.tokens = self.capacity;
                state.accrued_until = now;
            } else {
                let earned = earned as u32;
                state.tokens += earned;
                state.accrued_until += self.refill_every * earned;
            }
        }

        if state.tokens > 0 {
            state.tokens -= 1;
            return None;
        }
        Some(self.refill_every.saturating_sub(now.saturating_duration_since(state.accrued_until)))
    }

    async fn take(&self) {
        if self.refill_every.is_zero() {
            return;
        }
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                match self.try_take(&mut state, Instant::now()) {
                    None => return,
                    Some(wait) => wait,
                }
            };
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Ceiling of requests on the wire at once (slot pool size).
    pub max_in_flight: usize,
    pub retry: RetryPolicy,
    pub breaker: BreakerConfig,
    /// Upper bound for one attempt, pacing wait included. A slot lease older
    /// than this belongs to a holder that stopped making progress and is
    /// reclaimed.
    pub lease_timeout: Duration,
    pub pacing: Option<TokenBucketConfig>,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 8,
            retry: RetryPolicy::default(),
            breaker: BreakerConfig::default(),
            lease_timeout: Duration::from_secs(300),
            pacing: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Fetched {
    pub ticket: DownloadTicket,
    pub status: u16,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("retries exhausted for {} after {attempts} attempts: {last_error}", .ticket.resource)]
    Exhausted {
        ticket: DownloadTicket,
        attempts: u32,
        last_error: String,
    },
    #[error("http status {status} for {url}")]
    HttpStatus {
        ticket: DownloadTicket,
        status: u16,
        url: String,
    },
    #[error("request for {} failed: {message}", .ticket.resource)]
    Request {
        ticket: DownloadTicket,
        message: String,
    },
}

impl FetchError {
    pub fn ticket(&self) -> &DownloadTicket {
        match self {
            FetchError::Exhausted { ticket, .. }
            | FetchError::HttpStatus { ticket, .. }
            | FetchError::Request { ticket, .. } => ticket,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, FetchError::Exhausted { .. })
    }
}

#[derive(Debug)]
struct LeaseEntry {
    ticket: u64,
    acquired_at: Instant,
}

/// Fixed-size pool of exclusively-owned request slots.
#[derive(Debug)]
struct SlotPool {
    semaphore: Arc<Semaphore>,
    leases: StdMutex<HashMap<u64, LeaseEntry>>,
    reclaimed: StdMutex<HashSet<u64>>,
    next_lease: AtomicU64,
}

impl SlotPool {
    fn new(size: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(size.max(1))),
            leases: StdMutex::new(HashMap::new()),
            reclaimed: StdMutex::new(HashSet::new()),
            next_lease: AtomicU64::new(0),
        }
    }

    /// `None` once the pool's semaphore has been closed.
    async fn acquire(self: &Arc<Self>, ticket: u64) -> Option<SlotLease> {
        let permit = Arc::clone(&self.semaphore).acquire_owned().await.ok()?;
        let lease_id = self.next_lease.fetch_add(1, Ordering::SeqCst);
        lock(&self.leases).insert(
            lease_id,
            LeaseEntry {
                ticket,
                acquired_at: Instant::now(),
            },
        );
        Some(SlotLease {
            pool: Arc::clone(self),
            lease_id,
            permit: Some(permit),
        })
    }

    /// Frees slots whose holder has been silent for longer than `max_age`.
    /// Returns the ticket orders whose leases were reclaimed.
    fn reclaim_stale(&self, max_age: Duration) -> Vec<u64> {
        let now = Instant::now();
        let mut leases = lock(&self.leases);
        let stale: Vec<u64> = leases
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.acquired_at) > max_age)
            .map(|(id, _)| *id)
            .collect();
        let mut tickets = Vec::with_capacity(stale.len());
        let mut reclaimed = lock(&self.reclaimed);
        for id in stale {
            if let Some(entry) = leases.remove(&id) {
                reclaimed.insert(id);
                tickets.push(entry.ticket);
                self.semaphore.add_permits(1);
            }
        }
        tickets
    }

    fn finish(&self, lease_id: u64) -> bool {
        lock(&self.leases).remove(&lease_id);
        lock(&self.reclaimed).remove(&lease_id)
    }

    fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[derive(Debug)]
struct SlotLease {
    pool: Arc<SlotPool>,
    lease_id: u64,
    permit: Option<OwnedSemaphorePermit>,
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        let reclaimed = self.pool.finish(self.lease_id);
        if let Some(permit) = self.permit.take() {
            if reclaimed {
                // Capacity was already handed back by reclaim_stale.
                permit.forget();
            }
        }
    }
}

type Ledger = StdMutex<BTreeMap<u64, DownloadTicket>>;

/// Keeps one ticket listed while its fetch is alive. When the fetch ends,
/// however it ends, the ticket leaves the ledger unless it failed and waits
/// for an `ack`.
struct LedgerEntry<'a> {
    ledger: &'a Ledger,
    order: u64,
}

impl Drop for LedgerEntry<'_> {
    fn drop(&mut self) {
        let mut ledger = lock(self.ledger);
        if ledger
            .get(&self.order)
            .is_some_and(|ticket| ticket.state != TicketState::Failed)
        {
            ledger.remove(&self.order);
        }
    }
}

fn lock<T>(m: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

enum Attempt {
    Done(Fetched),
    Fatal(FetchError),
    Retry {
        wait: Duration,
        outcome: &'static str,
        error: String,
    },
}

pub struct RateLimitedFetcher {
    name: String,
    transport: Arc<dyn Transport>,
    slots: Arc<SlotPool>,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    lease_timeout: Duration,
    pacing: Option<TokenBucket>,
    next_order: AtomicU64,
    ledger: Ledger,
}

impl std::fmt::Debug for RateLimitedFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitedFetcher")
            .field("name", &self.name)
            .field("available_slots", &self.slots.available())
            .field("breaker", &self.breaker.phase())
            .finish()
    }
}

impl RateLimitedFetcher {
    pub fn new(
        name: impl Into<String>,
        transport: Arc<dyn Transport>,
        config: FetcherConfig,
    ) -> Self {
        let name = name.into();
        Self {
            breaker: CircuitBreaker::new(name.clone(), config.breaker),
            name,
            transport,
            slots: Arc::new(SlotPool::new(config.max_in_flight)),
            retry: config.retry,
            lease_timeout: config.lease_timeout,
            pacing: config.pacing.map(TokenBucket::new),
            next_order: AtomicU64::new(0),
            ledger: StdMutex::new(BTreeMap::new()),
        }
    }

    pub fn with_http(
        name: impl Into<String>,
        http: &HttpClientConfig,
        config: FetcherConfig,
    ) -> anyhow::Result<Self> {
        let transport = ReqwestTransport::new(http)?;
        Ok(Self::new(name, Arc::new(transport), config))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn available_slots(&self) -> usize {
        self.slots.available()
    }

    /// Live tickets, queued/active ones plus exhausted ones not yet acknowledged.
    pub fn tickets(&self) -> Vec<DownloadTicket> {
        lock(&self.ledger).values().cloned().collect()
    }

    pub fn failed_tickets(&self) -> Vec<DownloadTicket> {
        lock(&self.ledger)
            .values()
            .filter(|t| t.state == TicketState::Failed)
            .cloned()
            .collect()
    }

    /// Acknowledges a failed ticket so it leaves the ledger.
    pub fn ack(&self, order: u64) -> Option<DownloadTicket> {
        let mut ledger = lock(&self.ledger);
        match ledger.get(&order) {
            Some(ticket) if ticket.state == TicketState::Failed => ledger.remove(&order),
            _ => None,
        }
    }

    pub fn reclaim_stale(&self) -> Vec<u64> {
        let reclaimed = self.slots.reclaim_stale(self.lease_timeout);
        if !reclaimed.is_empty() {
            warn!(fetcher = %self.name, tickets = ?reclaimed, "reclaimed stale slot leases");
        }
        reclaimed
    }

    fn update_ticket(&self, order: u64, f: impl FnOnce(&mut DownloadTicket)) -> DownloadTicket {
        let mut ledger = lock(&self.ledger);
        match ledger.get_mut(&order) {
            Some(ticket) => {
                f(ticket);
                ticket.clone()
            }
            None => {
                let mut ticket = DownloadTicket {
                    resource: String::new(),
                    order,
                    state: TicketState::Queued,
                    retries: 0,
                };
                f(&mut ticket);
                ticket
            }
        }
    }

    fn settle(&self, order: u64, state: TicketState) -> DownloadTicket {
        self.update_ticket(order, |t| t.state = state)
    }

    /// Fatal failures are returned to the caller, not parked for an `ack`.
    fn discard(&self, order: u64) {
        lock(&self.ledger).remove(&order);
    }

    pub async fn fetch(&self, resource: &str) -> Result<Fetched, FetchError> {
        let order = self.next_order.fetch_add(1, Ordering::SeqCst);
        lock(&self.ledger).insert(
            order,
            DownloadTicket {
                resource: resource.to_string(),
                order,
                state: TicketState::Queued,
                retries: 0,
            },
        );

        let _entry = LedgerEntry {
            ledger: &self.ledger,
            order,
        };

        let span = info_span!("fetch", fetcher = %self.name, ticket = order, resource);
        self.run_ticket(order, resource).instrument(span).await
    }

    async fn run_ticket(&self, order: u64, resource: &str) -> Result<Fetched, FetchError> {
        let max_attempts = self.retry.max_retries.saturating_add(1);
        let mut last_error = String::new();

        for attempt in 0..max_attempts {
            if attempt > 0 {
                self.update_ticket(order, |t| {
                    t.retries = attempt;
                    t.state = TicketState::Queued;
                });
            }

            match self.attempt(order, resource, attempt).await {
                Attempt::Done(fetched) => {
                    info!(
                        attempt = attempt + 1,
                        wait_ms = 0u64,
                        outcome = "ok",
                        bytes = fetched.body.len()
                    );
                    return Ok(fetched);
                }
                Attempt::Fatal(err) => {
                    warn!(attempt = attempt + 1, wait_ms = 0u64, outcome = "failed", error = %err);
                    return Err(err);
                }
                Attempt::Retry {
                    wait,
                    outcome,
                    error,
                } => {
                    last_error = error;
                    if attempt + 1 >= max_attempts {
                        break;
                    }
                    warn!(
                        attempt = attempt + 1,
                        wait_ms = wait.as_millis() as u64,
                        outcome,
                        error = %last_error,
                        "retrying"
                    );
                    tokio::time::sleep(wait).await;
                }
            }
        }

        let ticket = self.settle(order, TicketState::Failed);
        warn!(
            attempt = max_attempts,
            wait_ms = 0u64,
            outcome = "exhausted",
            error = %last_error
        );
        Err(FetchError::Exhausted {
            ticket,
            attempts: max_attempts,
            last_error,
        })
    }

    async fn attempt(&self, order: u64, resource: &str, attempt: u32) -> Attempt {
        self.reclaim_stale();
        let Some(lease) = self.slots.acquire(order).await else {
            return Attempt::Retry {
                wait: self.retry.jittered_delay(attempt),
                outcome: "slot_pool_closed",
                error: format!("slot pool closed for {}", self.name),
            };
        };
        self.update_ticket(order, |t| t.state = TicketState::Active);

        let permit = match self.breaker.enter() {
            Ok(permit) => permit,
            Err(wait) => {
                drop(lease);
                return Attempt::Retry {
                    wait,
                    outcome: "circuit_open",
                    error: format!("circuit open for {}", self.name),
                };
            }
        };

        let bounded = tokio::time::timeout(self.lease_timeout, self.send(resource, attempt));
        let result = match bounded.await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(self.lease_timeout)),
        };
        drop(lease);

        match result {
            Ok(resp) if resp.status.is_success() => {
                permit.success();
                let ticket = self.settle(order, TicketState::Done);
                Attempt::Done(Fetched {
                    ticket,
                    status: resp.status.as_u16(),
                    final_url: resp.final_url,
                    body: resp.body,
                })
            }
            Ok(resp) => match classify_status(resp.status) {
                RetryDisposition::NonRetryable => {
                    // The service answered; the resource itself is the problem.
                    permit.success();
                    let ticket = self.settle(order, TicketState::Failed);
                    self.discard(order);
                    Attempt::Fatal(FetchError::HttpStatus {
                        ticket,
                        status: resp.status.as_u16(),
                        url: resp.final_url,
                    })
                }
                disposition => {
                    permit.failure();
                    let outcome = if disposition == RetryDisposition::RateLimited {
                        "rate_limited"
                    } else {
                        "retry"
                    };
                    Attempt::Retry {
                        wait: self.retry.wait_before_retry(attempt, resp.retry_after),
                        outcome,
                        error: format!(
                            "http status {} for {}",
                            resp.status.as_u16(),
                            resp.final_url
                        ),
                    }
                }
            },
            Err(err) => {
                permit.failure();
                match err.disposition() {
                    RetryDisposition::NonRetryable => {
                        let ticket = self.settle(order, TicketState::Failed);
                        self.discard(order);
                        Attempt::Fatal(FetchError::Request {
                            ticket,
                            message: err.to_string(),
                        })
                    }
                    _ => Attempt::Retry {
                        wait: self.retry.wait_before_retry(attempt, None),
                        outcome: "retry",
                        error: err.to_string(),
                    },
                }
            }
        }
    }

    /// Pacing wait plus the request itself; bounded by `lease_timeout`.
    async fn send(
        &self,
        resource: &str,
        attempt: u32,
    ) -> Result<TransportResponse, TransportError> {
        if let Some(bucket) = &self.pacing {
            bucket.take().await;
        }
        debug!(attempt = attempt + 1, "sending request");
        self.transport.get(resource).await
    }
}
