//! Enrollment of a new identity from a short capture window.
//!
//! `EnrollmentSession` only decides; it never touches the stream or the disk.
//! `Intercom::learn_new_face` feeds it frames and commits the result.

use anyhow::Result;
use std::time::{Duration, Instant};

use crate::identity::{Embedding, Identity, IdentityStore};

/// Reference near-duplicate threshold.
pub const DEFAULT_DEDUP_THRESHOLD: f32 = 0.7;

/// Local-time identifier used when no name is supplied.
pub fn default_name() -> String {
    chrono::Local::now().format("%Y-%m-%d_%H-%M-%S").to_string()
}

#[derive(Clone, Debug, PartialEq)]
pub enum OfferResult {
    Accepted,
    /// Too close to an embedding of an enrolled identity.
    KnownIdentity { name: String, similarity: f32 },
    /// Too close to an embedding already collected in this session.
    DuplicateInSession { similarity: f32 },
}

#[derive(Debug)]
pub enum SessionOutcome {
    Collected(Identity),
    Empty { name: String },
}

/// Result reported to the caller of `learn_new_face`.
#[derive(Clone, Debug, PartialEq)]
pub enum EnrollmentOutcome {
    Enrolled {
        name: String,
        embeddings: usize,
        persisted: bool,
    },
    /// Nothing collected, or the name was already taken. Not an error.
    Inconclusive { name: String },
    StreamUnavailable,
    /// No face detector/recognizer is configured; nothing was attempted.
    RecognitionDisabled,
}

#[derive(Debug)]
pub struct EnrollmentSession {
    name: String,
    deadline: Instant,
    dedup_threshold: f32,
    accepted: Vec<Embedding>,
}

impl EnrollmentSession {
    pub fn new(name: Option<String>, window: Duration, dedup_threshold: f32) -> Self {
        Self::starting_at(name, Instant::now(), window, dedup_threshold)
    }

    pub fn starting_at(
        name: Option<String>,
        now: Instant,
        window: Duration,
        dedup_threshold: f32,
    ) -> Self {
        let name = name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(default_name);
        Self {
            name,
            deadline: now + window,
            dedup_threshold,
            accepted: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn accepted(&self) -> &[Embedding] {
        &self.accepted
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    /// Consider one embedding for this session.
    pub fn offer(&mut self, embedding: Embedding, store: &IdentityStore) -> OfferResult {
        for identity in store.iter() {
            for known in identity.embeddings() {
                let similarity = embedding.similarity(known);
                if similarity > self.dedup_threshold {
                    return OfferResult::KnownIdentity {
                        name: identity.name().to_string(),
                        similarity,
                    };
                }
            }
        }
        for collected in &self.accepted {
            let similarity = embedding.similarity(collected);
            if similarity > self.dedup_threshold {
                return OfferResult::DuplicateInSession { similarity };
            }
        }
        self.accepted.push(embedding);
        OfferResult::Accepted
    }

    pub fn finish(self) -> Result<SessionOutcome> {
        if self.accepted.is_empty() {
            return Ok(SessionOutcome::Empty { name: self.name });
        }
        Ok(SessionOutcome::Collected(Identity::new(
            self.name,
            self.accepted,
        )?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec()).unwrap()
    }

    #[test]
    fn near_duplicate_in_session_keeps_first() {
        let mut session =
            EnrollmentSession::new(Some("dave".into()), Duration::from_secs(5), 0.7);
        let store = IdentityStore::new();
        let first = emb(&[1.0, 0.0]);
        // cos = 0.9 against the first.
        let second = emb(&[0.9, (1.0f32 - 0.81).sqrt()]);
        assert!((first.similarity(&second) - 0.9).abs() < 1e-5);

        assert_eq!(session.offer(first.clone(), &store), OfferResult::Accepted);
        assert!(matches!(
            session.offer(second, &store),
            OfferResult::DuplicateInSession { .. }
        ));
        assert_eq!(session.accepted(), &[first]);
    }

    #[test]
    fn known_identity_is_rejected() {
        let mut store = IdentityStore::new();
        store
            .insert(Identity::new("alice", vec![emb(&[0.0, 1.0])]).unwrap())
            .unwrap();
        let mut session = EnrollmentSession::new(None, Duration::from_secs(5), 0.7);
        match session.offer(emb(&[0.05, 1.0]), &store) {
            OfferResult::KnownIdentity { name, .. } => assert_eq!(name, "alice"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(session.accepted().is_empty());
    }

    #[test]
    fn accepted_set_never_holds_close_pairs() {
        let store = IdentityStore::new();
        let mut session = EnrollmentSession::new(None, Duration::from_secs(5), 0.7);
        for step in 0..72 {
            let angle = (step as f32) * 5.0f32.to_radians();
            session.offer(emb(&[angle.cos(), angle.sin()]), &store);
        }
        let accepted = session.accepted();
        assert!(accepted.len() > 1);
        for (i, a) in accepted.iter().enumerate() {
            for b in &accepted[i + 1..] {
                assert!(a.similarity(b) <= 0.7);
            }
        }
    }

    #[test]
    fn empty_session_finishes_inconclusive() {
        let session = EnrollmentSession::new(Some("erin".into()), Duration::from_secs(5), 0.7);
        match session.finish().unwrap() {
            SessionOutcome::Empty { name } => assert_eq!(name, "erin"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn collected_session_builds_identity() {
        let mut session =
            EnrollmentSession::new(Some("frank".into()), Duration::from_secs(5), 0.7);
        session.offer(emb(&[1.0, 0.0]), &IdentityStore::new());
        match session.finish().unwrap() {
            SessionOutcome::Collected(identity) => {
                assert_eq!(identity.name(), "frank");
                assert_eq!(identity.embeddings().len(), 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn blank_name_falls_back_to_timestamp() {
        let session = EnrollmentSession::new(Some("   ".into()), Duration::from_secs(5), 0.7);
        let name = session.name();
        assert_eq!(name.len(), "2024-01-01_00-00-00".len());
        assert_eq!(&name[4..5], "-");
        assert_eq!(&name[10..11], "_");
    }

    #[test]
    fn expiry_follows_window() {
        let t0 = Instant::now();
        let session =
            EnrollmentSession::starting_at(None, t0, Duration::from_millis(20), 0.7);
        assert!(!session.is_expired(t0));
        assert!(session.is_expired(t0 + Duration::from_millis(20)));
    }
}
