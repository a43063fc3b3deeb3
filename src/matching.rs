//! Cosine-similarity matching of a query embedding against the identity store.

use std::time::{Duration, Instant};

use crate::identity::{Embedding, IdentityStore};
use crate::lock::DoorLock;

/// Reference recognition threshold.
pub const DEFAULT_RECOGNITION_THRESHOLD: f32 = 0.5;

/// `dot(a, b) / (|a| * |b|)`, clamped to `[-1, 1]`.
///
/// Length mismatch or a zero-norm input yields 0.0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom <= f32::EPSILON || !denom.is_finite() {
        return 0.0;
    }
    let score = dot / denom;
    if score.is_finite() {
        score.clamp(-1.0, 1.0)
    } else {
        0.0
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum MatchDecision {
    Recognized { name: String, score: f32 },
    /// `best_score` is `None` only for an empty store.
    Unknown { best_score: Option<f32> },
}

impl MatchDecision {
    pub fn is_recognized(&self) -> bool {
        matches!(self, MatchDecision::Recognized { .. })
    }
}

#[derive(Clone, Copy, Debug)]
pub struct MatchingEngine {
    threshold: f32,
}

impl MatchingEngine {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Highest per-identity similarity in the store.
    ///
    /// Identities are scanned in enrollment order; a later identity replaces
    /// the current best only when strictly greater.
    pub fn best_candidate<'a>(
        &self,
        query: &Embedding,
        store: &'a IdentityStore,
    ) -> Option<(&'a str, f32)> {
        let mut best: Option<(&'a str, f32)> = None;
        for identity in store.iter() {
            let score = identity
                .embeddings()
                .iter()
                .map(|e| query.similarity(e))
                .fold(f32::NEG_INFINITY, f32::max);
            match best {
                Some((_, current)) if score <= current => {}
                _ => best = Some((identity.name(), score)),
            }
        }
        best
    }

    pub fn match_embedding(&self, query: &Embedding, store: &IdentityStore) -> MatchDecision {
        match self.best_candidate(query, store) {
            Some((name, score)) if score >= self.threshold => MatchDecision::Recognized {
                name: name.to_string(),
                score,
            },
            Some((_, score)) => MatchDecision::Unknown {
                best_score: Some(score),
            },
            None => MatchDecision::Unknown { best_score: None },
        }
    }
}

impl Default for MatchingEngine {
    fn default() -> Self {
        Self::new(DEFAULT_RECOGNITION_THRESHOLD)
    }
}

/// One recognition activation: a bounded window in which the door may be
/// unlocked at most once.
#[derive(Debug)]
pub struct ActivationWindow {
    deadline: Instant,
    unlocked: bool,
}

impl ActivationWindow {
    pub fn open(now: Instant, duration: Duration) -> Self {
        Self {
            deadline: now + duration,
            unlocked: false,
        }
    }

    pub fn is_open(&self, now: Instant) -> bool {
        !self.unlocked && now < self.deadline
    }

    pub fn unlocked(&self) -> bool {
        self.unlocked
    }

    /// Invoke the lock unless this window already did. Returns true when the
    /// unlock was invoked by this call.
    pub fn unlock_once(&mut self, lock: &dyn DoorLock) -> bool {
        if self.unlocked {
            return false;
        }
        self.unlocked = true;
        if let Err(err) = lock.unlock() {
            log::error!("door unlock failed: {:#}", err);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use anyhow::Result;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec()).unwrap()
    }

    fn store_of(entries: Vec<(&str, Vec<Vec<f32>>)>) -> IdentityStore {
        let mut store = IdentityStore::new();
        for (name, vectors) in entries {
            let embeddings = vectors.into_iter().map(|v| Embedding::new(v).unwrap()).collect();
            store.insert(Identity::new(name, embeddings).unwrap()).unwrap();
        }
        store
    }

    #[derive(Default)]
    struct CountingLock(AtomicUsize);

    impl DoorLock for CountingLock {
        fn unlock(&self) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn similarity_is_symmetric_and_one_on_self() {
        let a = [0.3, -1.2, 4.0, 0.01];
        let b = [1.0, 0.5, -0.25, 2.0];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&a, &b), cosine_similarity(&b, &a));
    }

    #[test]
    fn degenerate_inputs_score_zero() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn empty_store_is_unknown_without_score() {
        let engine = MatchingEngine::default();
        assert_eq!(
            engine.match_embedding(&emb(&[1.0, 0.0]), &IdentityStore::new()),
            MatchDecision::Unknown { best_score: None }
        );
    }

    #[test]
    fn exact_query_is_recognized_and_unlocks_once() {
        let a: &[f32] = &[0.2, 0.4, 0.9];
        let store = store_of(vec![("alice", vec![a.to_vec()])]);
        let engine = MatchingEngine::new(0.5);
        let lock = CountingLock::default();
        let mut window = ActivationWindow::open(Instant::now(), Duration::from_secs(30));

        for _ in 0..3 {
            if let MatchDecision::Recognized { name, score } = engine.match_embedding(&emb(a), &store)
            {
                assert_eq!(name, "alice");
                assert!((score - 1.0).abs() < 1e-6);
                window.unlock_once(&lock);
            }
        }
        assert_eq!(lock.0.load(Ordering::SeqCst), 1);
        assert!(!window.is_open(Instant::now()));
    }

    #[test]
    fn below_threshold_is_unknown_with_score() {
        let store = store_of(vec![("alice", vec![vec![1.0, 0.0]])]);
        let engine = MatchingEngine::new(0.5);
        match engine.match_embedding(&emb(&[0.0, 1.0]), &store) {
            MatchDecision::Unknown { best_score: Some(score) } => assert!(score.abs() < 1e-6),
            other => panic!("unexpected decision {:?}", other),
        }
    }

    #[test]
    fn global_maximum_wins_across_identities() {
        let store = store_of(vec![
            ("alice", vec![vec![1.0, 0.0, 0.0], vec![0.0, 0.0, 1.0]]),
            ("bob", vec![vec![0.6, 0.8, 0.0]]),
        ]);
        let engine = MatchingEngine::new(0.5);
        let decision = engine.match_embedding(&emb(&[0.5, 0.85, 0.0]), &store);
        assert!(matches!(decision, MatchDecision::Recognized { ref name, .. } if name == "bob"));
    }

    #[test]
    fn ties_go_to_earlier_enrollment() {
        let v: &[f32] = &[1.0, 1.0];
        let store = store_of(vec![("first", vec![v.to_vec()]), ("second", vec![v.to_vec()])]);
        let engine = MatchingEngine::new(0.5);
        let decision = engine.match_embedding(&emb(v), &store);
        assert!(matches!(decision, MatchDecision::Recognized { ref name, .. } if name == "first"));
    }

    #[test]
    fn window_closes_at_deadline() {
        let t0 = Instant::now();
        let window = ActivationWindow::open(t0, Duration::from_millis(50));
        assert!(window.is_open(t0));
        assert!(!window.is_open(t0 + Duration::from_millis(50)));
    }
}
