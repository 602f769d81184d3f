use crate::logger::dump_candidate;
use crate::peer::handle::PeerHandle;
use crate::peer::types::IceCandidate;
use std::collections::VecDeque;
use tracing::{debug, warn};

/// Кандидаты, полученные до установки remote description.
///
/// Принадлежит одной сессии: очищается при teardown и никогда не
/// переносится на другой handle.
#[derive(Debug, Default)]
pub struct PendingCandidates {
    queue: VecDeque<IceCandidate>,
}

impl PendingCandidates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, candidate: IceCandidate) {
        self.queue.push_back(candidate);
    }

    /// Забирает все кандидаты в порядке поступления
    pub fn take_all(&mut self) -> Vec<IceCandidate> {
        self.queue.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Применяет кандидата; ошибка одного кандидата сессию не рушит
pub async fn apply_candidate(peer: &dyn PeerHandle, candidate: IceCandidate) -> bool {
    dump_candidate("REMOTE", &candidate);
    match peer.add_ice_candidate(candidate).await {
        Ok(()) => true,
        Err(e) => {
            warn!(class = e.class(), "Failed to add ICE candidate: {e}");
            false
        }
    }
}

/// Применяет все отложенные кандидаты после установки remote description
pub async fn apply_pending_candidates(peer: &dyn PeerHandle, pending: &mut PendingCandidates) {
    let candidates = pending.take_all();
    if candidates.is_empty() {
        return;
    }
    debug!("Applying {} pending candidates", candidates.len());

    for candidate in candidates {
        apply_candidate(peer, candidate).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_all_preserves_arrival_order() {
        let mut pending = PendingCandidates::new();
        for i in 0..5 {
            pending.push(IceCandidate::new(format!("candidate:{i} 1 udp 1 10.0.0.{i} 5000 typ host")));
        }
        assert_eq!(pending.len(), 5);

        let drained = pending.take_all();
        let ids: Vec<_> = drained
            .iter()
            .map(|c| c.candidate.split(' ').next().unwrap().to_string())
            .collect();
        assert_eq!(
            ids,
            vec!["candidate:0", "candidate:1", "candidate:2", "candidate:3", "candidate:4"]
        );
        assert!(pending.is_empty());
        assert!(pending.take_all().is_empty());
    }

    #[test]
    fn test_clear() {
        let mut pending = PendingCandidates::new();
        pending.push(IceCandidate::new("candidate:0 1 udp 1 10.0.0.1 5000 typ host"));
        pending.clear();
        assert!(pending.is_empty());
    }
}
