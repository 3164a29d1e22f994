// Live TCP links to backend workers and the outbound selection policy.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex,
};

use rand::{seq::SliceRandom, Rng};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::GatewayResult;

/// Write side of a backend connection.
pub type LinkWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub struct BackendLink {
    id: u64,
    remote_addr: String,
    alive: AtomicBool,
    writer: tokio::sync::Mutex<LinkWriter>,
}

impl BackendLink {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Write one already-framed line. Concurrent senders are serialized so
    /// lines never interleave on the wire.
    pub async fn send_line(&self, line: &[u8]) -> GatewayResult<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(line).await?;
        writer.flush().await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.alive.store(false, Ordering::Release);
        let _ = self.writer.lock().await.shutdown().await;
    }
}

/// The set of live backend links. One coarse lock guards the whole set.
#[derive(Default)]
pub struct LinkRegistry {
    links: Mutex<Vec<Arc<BackendLink>>>,
    next_id: AtomicU64,
}

impl LinkRegistry {
    pub fn insert(&self, remote_addr: impl Into<String>, writer: LinkWriter) -> Arc<BackendLink> {
        let link = Arc::new(BackendLink {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            remote_addr: remote_addr.into(),
            alive: AtomicBool::new(true),
            writer: tokio::sync::Mutex::new(writer),
        });
        self.lock().push(Arc::clone(&link));
        link
    }

    /// Remove a link from the active set. Idempotent.
    pub fn remove(&self, id: u64) -> Option<Arc<BackendLink>> {
        let mut links = self.lock();
        let index = links.iter().position(|link| link.id == id)?;
        let link = links.swap_remove(index);
        link.alive.store(false, Ordering::Release);
        Some(link)
    }

    /// Uniformly random choice among live links, re-evaluated on every call.
    pub fn select(&self) -> Option<Arc<BackendLink>> {
        self.select_with(&mut rand::thread_rng())
    }

    pub fn select_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<Arc<BackendLink>> {
        let links = self.lock();
        let live: Vec<&Arc<BackendLink>> = links.iter().filter(|link| link.is_alive()).collect();
        live.choose(rng).map(|link| Arc::clone(link))
    }

    pub fn len(&self) -> usize {
        self.lock().iter().filter(|link| link.is_alive()).count()
    }

    /// Take every link out of the registry, marking each one dead.
    pub fn drain(&self) -> Vec<Arc<BackendLink>> {
        let drained: Vec<_> = self.lock().drain(..).collect();
        for link in &drained {
            link.alive.store(false, Ordering::Release);
        }
        drained
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Arc<BackendLink>>> {
        self.links.lock().expect("backend link registry lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use rand::{rngs::StdRng, SeedableRng};
    use tokio::io::AsyncReadExt;

    use super::*;

    fn sink() -> LinkWriter {
        Box::new(tokio::io::sink())
    }

    #[test]
    fn select_returns_none_without_links() {
        let registry = LinkRegistry::default();
        assert!(registry.select().is_none());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn selection_is_roughly_uniform() {
        let registry = LinkRegistry::default();
        let ids: Vec<u64> =
            (0..4).map(|n| registry.insert(format!("10.0.0.{n}:9000"), sink()).id()).collect();

        let mut rng = StdRng::seed_from_u64(7);
        let mut hits: HashMap<u64, usize> = HashMap::new();
        let draws = 40_000;
        for _ in 0..draws {
            let link = registry.select_with(&mut rng).expect("a link should be selected");
            *hits.entry(link.id()).or_default() += 1;
        }

        let expected = draws / ids.len();
        for id in ids {
            let count = hits.get(&id).copied().unwrap_or_default();
            let deviation = count.abs_diff(expected) as f64 / expected as f64;
            assert!(deviation < 0.05, "link {id} drawn {count} times, expected ~{expected}");
        }
    }

    #[test]
    fn removed_links_are_never_selected() {
        let registry = LinkRegistry::default();
        let kept = registry.insert("a", sink());
        let removed = registry.insert("b", sink());

        assert!(registry.remove(removed.id()).is_some());
        assert!(registry.remove(removed.id()).is_none());
        assert!(!removed.is_alive());

        for _ in 0..100 {
            assert_eq!(registry.select().expect("kept link").id(), kept.id());
        }
    }

    #[test]
    fn drain_empties_registry_and_marks_links_dead() {
        let registry = LinkRegistry::default();
        let first = registry.insert("a", sink());
        registry.insert("b", sink());

        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert!(!first.is_alive());
        assert!(registry.select().is_none());
    }

    #[tokio::test]
    async fn send_line_writes_through_to_transport() {
        let (writer, mut reader) = tokio::io::duplex(1024);
        let registry = LinkRegistry::default();
        let link = registry.insert("backend", Box::new(writer));

        link.send_line(b"{\"a\":1}\n").await.expect("write should succeed");
        link.close().await;

        let mut received = String::new();
        reader.read_to_string(&mut received).await.expect("read should succeed");
        assert_eq!(received, "{\"a\":1}\n");
    }
}
