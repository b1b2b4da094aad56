//! SIP Transaction Layer
//!
//! Client-side transaction tracking (RFC 3261 Section 17.1) for an engine that
//! owns a single socket. Each outbound request is keyed by Call-ID, CSeq number
//! and method. Unacknowledged requests are retransmitted with exponential
//! backoff; a provisional response stops retransmission but not the timeout.
//!
//! The tracker does no I/O and never reads the clock itself. The owner feeds
//! it `now`, sends whatever [`TimerOutcome::Retransmit`] asks for, and sleeps
//! until [`TransactionTracker::next_deadline`].

use super::message::{SipMethod, SipRequest, SipResponse};
use super::transport::OutgoingMessage;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Number of finished transactions remembered to recognise late duplicates
const COMPLETED_HISTORY: usize = 32;

/// Transaction ID - the Via branch of a request
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct TransactionId(pub String);

impl TransactionId {
    /// Create transaction ID from branch parameter
    pub fn from_branch(branch: impl Into<String>) -> Self {
        Self(branch.into())
    }

    /// Generate a new transaction ID
    pub fn generate() -> Self {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let random: u64 = rng.gen();
        Self(format!("z9hG4bK{:x}", random))
    }
}

/// Matching key for responses
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct TransactionKey {
    pub call_id: String,
    pub seq: u32,
    pub method: SipMethod,
}

impl TransactionKey {
    pub fn new(call_id: impl Into<String>, seq: u32, method: SipMethod) -> Self {
        Self {
            call_id: call_id.into(),
            seq,
            method,
        }
    }

    pub fn for_request(request: &SipRequest) -> Option<Self> {
        let (seq, method) = request.cseq()?;
        Some(Self::new(request.call_id()?, seq, method))
    }

    pub fn for_response(response: &SipResponse) -> Option<Self> {
        let (seq, method) = response.cseq()?;
        Some(Self::new(response.call_id()?, seq, method))
    }
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.seq, self.method, self.call_id)
    }
}

/// SIP Timers (RFC 3261 Section 17.1.1.1)
#[derive(Debug, Clone, Copy)]
pub struct SipTimers {
    /// T1: initial retransmit interval (default 500ms)
    pub t1: Duration,
    /// Retransmissions before a transaction times out
    pub max_retries: u32,
}

impl Default for SipTimers {
    fn default() -> Self {
        Self {
            t1: Duration::from_millis(500),
            max_retries: 6,
        }
    }
}

impl SipTimers {
    /// Time from first transmission until timeout
    pub fn timeout_budget(&self) -> Duration {
        (0..=self.max_retries).map(|n| self.t1 * 2u32.pow(n)).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Sent, nothing heard yet
    Trying,
    /// Provisional response received
    Proceeding,
}

#[derive(Debug)]
struct ClientTransaction<C> {
    id: TransactionId,
    request: Bytes,
    destination: SocketAddr,
    state: ClientState,
    interval: Duration,
    retransmits: u32,
    deadline: Instant,
    context: C,
}

/// Something the owner must do after [`TransactionTracker::poll`]
#[derive(Debug)]
pub enum TimerOutcome<C> {
    Retransmit {
        key: TransactionKey,
        message: OutgoingMessage,
    },
    TimedOut {
        key: TransactionKey,
        context: C,
    },
}

/// How an inbound response relates to tracked transactions
#[derive(Debug)]
pub enum ResponseMatch<C> {
    /// 1xx for a pending transaction
    Provisional { key: TransactionKey, context: C },
    /// Final response; the transaction is finished
    Final { key: TransactionKey, context: C },
    /// Another final for a transaction that already finished
    Duplicate { key: TransactionKey },
    Unmatched,
}

/// Pending client transactions, each carrying the caller's context `C`
#[derive(Debug)]
pub struct TransactionTracker<C> {
    timers: SipTimers,
    pending: HashMap<TransactionKey, ClientTransaction<C>>,
    completed: VecDeque<TransactionKey>,
}

impl<C: Clone> TransactionTracker<C> {
    pub fn new(timers: SipTimers) -> Self {
        Self {
            timers,
            pending: HashMap::new(),
            completed: VecDeque::new(),
        }
    }

    /// Track `request` and return the first transmission for the caller to send
    pub fn start(
        &mut self,
        request: &SipRequest,
        destination: SocketAddr,
        context: C,
        now: Instant,
    ) -> Option<(TransactionKey, OutgoingMessage)> {
        let key = TransactionKey::for_request(request)?;
        let id = request
            .branch()
            .map(TransactionId::from_branch)
            .unwrap_or_else(TransactionId::generate);
        let data = request.to_bytes();

        debug!("Transaction {} started for {}", id.0, key);

        let transaction = ClientTransaction {
            id,
            request: data.clone(),
            destination,
            state: ClientState::Trying,
            interval: self.timers.t1,
            retransmits: 0,
            deadline: now + self.timers.t1,
            context,
        };
        if let Some(previous) = self.pending.insert(key.clone(), transaction) {
            warn!("Transaction {} replaced by a request with the same key", previous.id.0);
        }

        Some((
            key,
            OutgoingMessage {
                data,
                destination,
            },
        ))
    }

    /// Classify an inbound response
    pub fn on_response(&mut self, response: &SipResponse) -> ResponseMatch<C> {
        let Some(key) = TransactionKey::for_response(response) else {
            return ResponseMatch::Unmatched;
        };

        if response.is_provisional() {
            return match self.pending.get_mut(&key) {
                Some(tx) => {
                    if tx.state == ClientState::Trying {
                        debug!("Transaction {} proceeding", tx.id.0);
                    }
                    tx.state = ClientState::Proceeding;
                    ResponseMatch::Provisional {
                        key,
                        context: tx.context.clone(),
                    }
                }
                None => ResponseMatch::Unmatched,
            };
        }

        match self.pending.remove(&key) {
            Some(tx) => {
                debug!(
                    "Transaction {} completed with {}",
                    tx.id.0,
                    response.status_code()
                );
                self.remember(key.clone());
                ResponseMatch::Final {
                    key,
                    context: tx.context,
                }
            }
            None if self.completed.contains(&key) => ResponseMatch::Duplicate { key },
            None => ResponseMatch::Unmatched,
        }
    }

    /// Fire every timer due at `now`
    pub fn poll(&mut self, now: Instant) -> Vec<TimerOutcome<C>> {
        let due: Vec<TransactionKey> = self
            .pending
            .iter()
            .filter(|(_, tx)| tx.deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();

        let mut outcomes = Vec::new();
        for key in due {
            let Some(tx) = self.pending.get_mut(&key) else {
                continue;
            };

            if tx.retransmits >= self.timers.max_retries {
                if let Some(tx) = self.pending.remove(&key) {
                    warn!("Transaction {} timed out ({})", tx.id.0, key);
                    self.remember(key.clone());
                    outcomes.push(TimerOutcome::TimedOut {
                        key,
                        context: tx.context,
                    });
                }
                continue;
            }

            tx.retransmits += 1;
            tx.interval *= 2;
            tx.deadline += tx.interval;

            if tx.state == ClientState::Trying {
                debug!(
                    "Transaction {} retransmit #{} ({})",
                    tx.id.0, tx.retransmits, key
                );
                outcomes.push(TimerOutcome::Retransmit {
                    key,
                    message: OutgoingMessage {
                        data: tx.request.clone(),
                        destination: tx.destination,
                    },
                });
            }
        }

        outcomes
    }

    /// Drop a transaction whose transmission failed
    pub fn abandon(&mut self, key: &TransactionKey) -> Option<C> {
        let tx = self.pending.remove(key)?;
        debug!("Transaction {} abandoned", tx.id.0);
        Some(tx.context)
    }

    /// Earliest pending timer, if any
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|tx| tx.deadline).min()
    }

    pub fn state(&self, key: &TransactionKey) -> Option<ClientState> {
        self.pending.get(key).map(|tx| tx.state)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Forget everything; no timer fires afterwards
    pub fn clear(&mut self) {
        self.pending.clear();
        self.completed.clear();
    }

    fn remember(&mut self, key: TransactionKey) {
        if self.completed.len() == COMPLETED_HISTORY {
            self.completed.pop_front();
        }
        self.completed.push_back(key);
    }
}
