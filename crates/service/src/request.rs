use std::{
    net::SocketAddr,
    time::{Duration, Instant},
};

use bytes::Bytes;

/// How often a request is sent to a silent UDP upstream before the
/// slot is given up.
pub const REQUEST_RETRIES: u8 = 3;

/// How long a slot lives without an answer, across all tries.
pub const REQUEST_EXPIRY: Duration = Duration::from_secs(20);

/// Pause between Status-Server probes to an upstream.
pub const STATUS_SERVER_PERIOD: Duration = Duration::from_secs(25);

/// One slot per RADIUS id, so the table size is the id space.
pub const TABLE_SIZE: usize = 256;

/// Identifies a client instance for the lifetime of the process. Keys
/// are never reused, which makes the slot's back reference safe to
/// hold after the client is gone.
pub type ClientKey = u64;

/// Everything needed to turn an upstream reply back into the answer
/// the original client expects.
#[derive(Debug, Clone)]
pub struct RequestOrigin {
    /// Index of the client config the request was accepted under.
    pub client: usize,
    pub key: ClientKey,
    /// Datagram source, which is also where the reply goes for UDP.
    pub source: SocketAddr,
    /// Id the client chose.
    pub id: u8,
    /// Request authenticator as the client sent it.
    pub authenticator: [u8; 16],
    /// Pre-rewrite User-Name, when a rewrite applied.
    pub username: Option<Vec<u8>>,
}

struct Slot {
    /// The packet as sent upstream. `Some` means the slot is in use.
    buf: Option<Bytes>,
    /// Cleared when the originating client goes away; the reply is
    /// then unroutable and gets dropped on arrival.
    origin: Option<RequestOrigin>,
    tries: u8,
    max_tries: u8,
    interval: Duration,
    expiry: Instant,
    received: bool,
    status: bool,
}

/// Work for one writer wake: packets to (re)send and statistics about
/// slots that ran out of tries.
pub struct SweepOutcome {
    pub pending: Vec<(u8, Bytes)>,
    pub next_deadline: Option<Instant>,
    /// `(id, was_status_probe)` per slot given up this wake.
    pub expired: Vec<(u8, bool)>,
}

/// Per-upstream table of in-flight requests, addressed by the 8 bit
/// id assigned to outbound packets.
pub struct RequestTable {
    slots: Vec<Slot>,
    next_id: u8,
}

impl Default for RequestTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestTable {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            slots: (0..TABLE_SIZE)
                .map(|_| Slot {
                    buf: None,
                    origin: None,
                    tries: 0,
                    max_tries: 0,
                    interval: Duration::ZERO,
                    expiry: now,
                    received: false,
                    status: false,
                })
                .collect(),
            next_id: 0,
        }
    }

    /// Whether an unanswered request from the same client instance,
    /// source address, and original id is already in flight.
    pub fn contains(&self, key: ClientKey, source: SocketAddr, id: u8) -> bool {
        self.slots.iter().any(|slot| {
            slot.buf.is_some()
                && !slot.received
                && slot
                    .origin
                    .as_ref()
                    .map(|it| it.key == key && it.source == source && it.id == id)
                    .unwrap_or(false)
        })
    }

    /// Pick a free id, scanning forward from the allocation hint and
    /// wrapping once.
    pub fn free_id(&self) -> Option<u8> {
        let start = self.next_id as usize;
        (start..TABLE_SIZE)
            .chain(0..start)
            .find(|&it| self.slots[it].buf.is_none())
            .map(|it| it as u8)
    }

    /// Park a request in the given slot. The expiry is set to `now`
    /// so the next writer wake performs the first send.
    #[allow(clippy::too_many_arguments)]
    pub fn insert(
        &mut self,
        id: u8,
        origin: Option<RequestOrigin>,
        status: bool,
        buf: Bytes,
        now: Instant,
        max_tries: u8,
        interval: Duration,
    ) {
        let slot = &mut self.slots[id as usize];
        slot.buf = Some(buf);
        slot.origin = origin;
        slot.tries = 0;
        slot.max_tries = max_tries;
        slot.interval = interval;
        slot.expiry = now;
        slot.received = false;
        slot.status = status;

        self.next_id = id.wrapping_add(1);
    }

    /// Authenticator of the packet sitting in the slot, if it is
    /// still waiting for an answer.
    pub fn sent_authenticator(&self, id: u8) -> Option<[u8; 16]> {
        let slot = &self.slots[id as usize];
        if slot.received {
            return None;
        }

        slot.buf
            .as_ref()
            .map(|it| it[codec::AUTHENTICATOR_RANGE].try_into().unwrap())
    }

    /// Claim the slot for a validated reply. Exactly one of any
    /// concurrent callers gets the origin back; the slot itself is
    /// recycled by the next sweep.
    pub fn complete(&mut self, id: u8) -> Option<(Option<RequestOrigin>, bool)> {
        let slot = &mut self.slots[id as usize];
        if slot.buf.is_none() || slot.received {
            return None;
        }

        slot.received = true;
        Some((slot.origin.take(), slot.status))
    }

    /// Walk the table once: recycle answered slots, retransmit due
    /// ones, give up on exhausted ones, and report the nearest
    /// deadline among the rest.
    pub fn sweep(&mut self, now: Instant) -> SweepOutcome {
        let mut outcome = SweepOutcome {
            pending: Vec::new(),
            next_deadline: None,
            expired: Vec::new(),
        };

        for index in 0..TABLE_SIZE {
            let slot = &mut self.slots[index];
            let Some(buf) = &slot.buf else {
                continue;
            };

            if slot.received {
                slot.buf = None;
                slot.origin = None;
                slot.received = false;
                continue;
            }

            if now < slot.expiry {
                outcome.next_deadline = Some(match outcome.next_deadline {
                    Some(deadline) => deadline.min(slot.expiry),
                    None => slot.expiry,
                });

                continue;
            }

            if slot.tries >= slot.max_tries {
                outcome.expired.push((index as u8, slot.status));
                slot.buf = None;
                slot.origin = None;
                continue;
            }

            slot.tries += 1;
            slot.expiry = now + slot.interval;
            outcome.pending.push((index as u8, buf.clone()));
            outcome.next_deadline = Some(match outcome.next_deadline {
                Some(deadline) => deadline.min(slot.expiry),
                None => slot.expiry,
            });
        }

        outcome
    }

    /// Null out the client back reference of every slot belonging to
    /// a departed client, returning how many were touched. The slots
    /// themselves age out normally.
    pub fn purge_client(&mut self, key: ClientKey) -> usize {
        let mut purged = 0;
        for slot in &mut self.slots {
            if slot.buf.is_some()
                && slot
                    .origin
                    .as_ref()
                    .map(|it| it.key == key)
                    .unwrap_or(false)
            {
                slot.origin = None;
                purged += 1;
            }
        }

        purged
    }

    pub fn in_use(&self) -> usize {
        self.slots.iter().filter(|it| it.buf.is_some()).count()
    }
}
