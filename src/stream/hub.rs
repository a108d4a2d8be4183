use anyhow::{anyhow, Result};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use super::encode::StreamChunk;

/// Latest published stream part, shared with every HTTP client.
///
/// The producer publishes once per frame; clients wait for a generation
/// newer than the one they last wrote. Slow clients skip parts instead of
/// queueing them.
#[derive(Debug, Default)]
pub struct StreamHub {
    state: Mutex<HubState>,
    changed: Condvar,
}

#[derive(Debug, Default)]
struct HubState {
    latest: Option<Arc<StreamChunk>>,
    generation: u64,
    closed: bool,
}

/// Outcome of waiting on the hub.
#[derive(Debug)]
pub enum HubEvent {
    Chunk(u64, Arc<StreamChunk>),
    Timeout,
    Closed,
}

impl StreamHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, chunk: StreamChunk) -> Result<()> {
        let mut state = self.lock()?;
        state.latest = Some(Arc::new(chunk));
        state.generation += 1;
        self.changed.notify_all();
        Ok(())
    }

    pub fn latest(&self) -> Result<Option<Arc<StreamChunk>>> {
        Ok(self.lock()?.latest.clone())
    }

    pub fn generation(&self) -> Result<u64> {
        Ok(self.lock()?.generation)
    }

    /// Wait up to `timeout` for a part newer than `seen`.
    pub fn wait_newer(&self, seen: u64, timeout: Duration) -> Result<HubEvent> {
        let state = self.lock()?;
        let (state, _) = self
            .changed
            .wait_timeout_while(state, timeout, |s| !s.closed && s.generation <= seen)
            .map_err(|_| anyhow!("stream hub lock poisoned"))?;
        if state.closed {
            return Ok(HubEvent::Closed);
        }
        match &state.latest {
            Some(chunk) if state.generation > seen => {
                Ok(HubEvent::Chunk(state.generation, chunk.clone()))
            }
            _ => Ok(HubEvent::Timeout),
        }
    }

    /// Wake every waiting client and refuse further waits.
    pub fn close(&self) -> Result<()> {
        let mut state = self.lock()?;
        state.closed = true;
        self.changed.notify_all();
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, HubState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("stream hub lock poisoned"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waiters_see_only_newer_parts() -> Result<()> {
        let hub = Arc::new(StreamHub::new());
        assert!(matches!(
            hub.wait_newer(0, Duration::from_millis(10))?,
            HubEvent::Timeout
        ));

        let waiter = {
            let hub = hub.clone();
            std::thread::spawn(move || hub.wait_newer(0, Duration::from_secs(5)))
        };
        std::thread::sleep(Duration::from_millis(20));
        hub.publish(StreamChunk::new(3, &[0xFF, 0xD8, 0xFF, 0xD9]))?;

        match waiter.join().unwrap()? {
            HubEvent::Chunk(generation, chunk) => {
                assert_eq!(generation, 1);
                assert_eq!(chunk.frame_index, 3);
            }
            other => panic!("expected chunk, got {:?}", other),
        }
        assert!(matches!(
            hub.wait_newer(1, Duration::from_millis(10))?,
            HubEvent::Timeout
        ));
        Ok(())
    }

    #[test]
    fn close_wakes_waiters() -> Result<()> {
        let hub = Arc::new(StreamHub::new());
        let waiter = {
            let hub = hub.clone();
            std::thread::spawn(move || hub.wait_newer(0, Duration::from_secs(5)))
        };
        std::thread::sleep(Duration::from_millis(20));
        hub.close()?;
        assert!(matches!(waiter.join().unwrap()?, HubEvent::Closed));
        Ok(())
    }
}
