use crate::ids::ClientId;
use crate::timestamp::Timestamp;

/// Lamport-style clock for one client.
///
/// `next_timestamp` does not advance the clock on its own: the tick moves when a
/// commit is observed, so a cancelled transaction never burns a tick.
#[derive(Debug, Clone)]
pub struct LogicalClock {
    tick: u64,
    client_id: ClientId,
}

impl LogicalClock {
    pub fn new(client_id: ClientId) -> Self {
        Self { tick: 0, client_id }
    }

    pub fn with_tick(client_id: ClientId, tick: u64) -> Self {
        Self { tick, client_id }
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn current_timestamp(&self) -> Timestamp {
        Timestamp::new(self.tick, self.client_id.clone())
    }

    pub fn next_timestamp(&self) -> Timestamp {
        Timestamp::new(self.tick + 1, self.client_id.clone())
    }

    pub fn set_tick(&mut self, tick: u64) {
        self.tick = tick;
    }

    /// Raise the tick to at least `timestamp.tick()`. Returns true if it moved.
    pub fn observe(&mut self, timestamp: &Timestamp) -> bool {
        if timestamp.tick() > self.tick {
            self.tick = timestamp.tick();
            true
        } else {
            false
        }
    }

    /// Start over with a new identity, as after a store clear.
    pub fn reset(&mut self, client_id: ClientId) {
        self.tick = 0;
        self.client_id = client_id;
    }
}
