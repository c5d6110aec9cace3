use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Wall-clock access, injected so tests can run with a fixed or
/// fast-forwarding clock instead of `Utc::now()`.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The real clock. Used by every non-test composition root.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Fixed clock for deterministic tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Identifier generation for the UUID-keyed entities (transaction groups,
/// settlements, refunds, refund reserves). Dense integer ids (wallets,
/// ledger entries) are assigned by the store itself, not by this port,
/// since they need to stay dense and gap-free per store.
pub trait IdGenerator: Send + Sync {
    fn new_id(&self) -> Uuid;
}

/// `Uuid::now_v7`-backed generator, time-ordered so index locality on the
/// UUID-keyed tables stays good as rows accumulate.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidV7Generator;

impl IdGenerator for UuidV7Generator {
    fn new_id(&self) -> Uuid {
        Uuid::now_v7()
    }
}
