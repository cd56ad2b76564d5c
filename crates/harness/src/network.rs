use tracing::debug;
use trinity_engine::EngineError;

use crate::TestPeer;

/// Peers exchanging triples by state vector.
pub struct TestNetwork {
    peers: Vec<TestPeer>,
}

impl Default for TestNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl TestNetwork {
    pub fn new() -> Self {
        Self { peers: Vec::new() }
    }

    pub fn add_peer(&mut self, name: &str) -> Result<usize, EngineError> {
        let peer = TestPeer::new(name)?;
        let index = self.peers.len();
        self.peers.push(peer);
        Ok(index)
    }

    pub fn peer(&self, index: usize) -> &TestPeer {
        &self.peers[index]
    }

    pub fn peer_mut(&mut self, index: usize) -> &mut TestPeer {
        &mut self.peers[index]
    }

    /// Ship every triple `to` has not seen from `from`. Returns how many moved.
    pub fn sync(&mut self, from: usize, to: usize) -> Result<usize, EngineError> {
        let since = self.peers[to].db.state_vector()?;
        let triples = self.peers[from].db.triples_since(&since)?;
        let count = triples.len();
        self.peers[to].db.apply_remote(triples)?;
        debug!(from = %self.peers[from].name, to = %self.peers[to].name, count, "synced");
        Ok(count)
    }

    /// Sync every ordered pair until a full round moves nothing.
    pub fn sync_all(&mut self) -> Result<(), EngineError> {
        loop {
            let mut moved = 0;
            for from in 0..self.peers.len() {
                for to in 0..self.peers.len() {
                    if from != to {
                        moved += self.sync(from, to)?;
                    }
                }
            }
            if moved == 0 {
                return Ok(());
            }
        }
    }
}
