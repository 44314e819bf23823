//! # Routing Transcripts
//!
//! An authenticated search carries a [`RoutingTranscript`] from hop to hop.
//! Each visited node appends one [`Hop`] and signs the transcript prefix that
//! ends with its own entry, then forwards. The terminal node asks its guards
//! to sign the finished transcript; the result is a [`SignedTranscript`].
//!
//! ## Encodings
//!
//! All signed payloads use a manual length-prefixed little-endian encoding
//! rather than bincode so the bytes stay stable across serde versions.
//!
//! | payload | covers | domain |
//! |---------|--------|--------|
//! | `step_payload(i)` | target, hop bodies `0..=i` | [`STEP_SIGNATURE_DOMAIN`] |
//! | `canonical_bytes()` | target, every hop body and step signature | [`GUARD_SIGNATURE_DOMAIN`] |
//!
//! ## Hop semantics
//!
//! `level` is the level at which the node made its routing decision and
//! `direction` is where it forwarded the request. The terminal hop has no
//! direction. Along a valid transcript levels never increase and every hop
//! moves strictly towards the target.

use serde::{Deserialize, Serialize};

use crate::crypto::{
    self, GUARD_SIGNATURE_DOMAIN, IdentitySignature, PrivateKey, PublicParameters,
    STEP_SIGNATURE_DOMAIN,
};
use crate::error::{SkipGraphError, SkipGraphResult};
use crate::identity::{Direction, Level, NodeInfo, NumId, encode_direction};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hop {
    pub node: NodeInfo,
    pub level: Level,
    pub direction: Option<Direction>,
    pub step_signature: Option<IdentitySignature>,
}

impl Hop {
    fn encode_body(&self, out: &mut Vec<u8>) {
        self.node.encode_into(out);
        out.extend_from_slice(&(self.level as u64).to_le_bytes());
        encode_direction(out, self.direction);
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingTranscript {
    pub target: NumId,
    pub hops: Vec<Hop>,
}

fn invalid(msg: impl Into<String>) -> SkipGraphError {
    SkipGraphError::InvalidTranscript(msg.into())
}

impl RoutingTranscript {
    pub fn new(target: NumId) -> Self {
        Self {
            target,
            hops: Vec::new(),
        }
    }

    pub fn origin(&self) -> Option<&Hop> {
        self.hops.first()
    }

    pub fn terminal(&self) -> Option<&Hop> {
        self.hops.last()
    }

    pub fn len(&self) -> usize {
        self.hops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    /// Appends the hop for `node` and step-signs it with `key`.
    pub fn record_hop(
        &mut self,
        node: &NodeInfo,
        level: Level,
        direction: Option<Direction>,
        key: &PrivateKey,
    ) {
        self.hops.push(Hop {
            node: node.clone(),
            level,
            direction,
            step_signature: None,
        });
        let index = self.hops.len() - 1;
        let signature = crypto::sign(key, STEP_SIGNATURE_DOMAIN, &self.step_payload(index));
        self.hops[index].step_signature = Some(signature);
    }

    /// Bytes step-signed by the node at `index`.
    pub fn step_payload(&self, index: usize) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.target.to_le_bytes());
        let end = (index + 1).min(self.hops.len());
        out.extend_from_slice(&(end as u32).to_le_bytes());
        for hop in &self.hops[..end] {
            hop.encode_body(&mut out);
        }
        out
    }

    /// Bytes signed by guards.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.target.to_le_bytes());
        out.extend_from_slice(&(self.hops.len() as u32).to_le_bytes());
        for hop in &self.hops {
            hop.encode_body(&mut out);
            match &hop.step_signature {
                Some(sig) => {
                    out.push(1);
                    out.extend_from_slice(&sig.public_key);
                    out.extend_from_slice(&(sig.certificate.len() as u32).to_le_bytes());
                    out.extend_from_slice(&sig.certificate);
                    out.extend_from_slice(&(sig.signature.len() as u32).to_le_bytes());
                    out.extend_from_slice(&sig.signature);
                }
                None => out.push(0),
            }
        }
        out
    }

    /// Checks hop ordering and every step signature. Does not look at guards.
    pub fn verify_steps(&self, params: &PublicParameters) -> SkipGraphResult<()> {
        let terminal = self.terminal().ok_or_else(|| invalid("transcript has no hops"))?;
        if terminal.direction.is_some() {
            return Err(invalid("terminal hop still names a forwarding direction"));
        }

        for (i, pair) in self.hops.windows(2).enumerate() {
            let (from, to) = (&pair[0], &pair[1]);
            let direction = from
                .direction
                .ok_or_else(|| invalid(format!("hop {i} has no forwarding direction")))?;
            if Direction::towards(from.node.num_id, self.target) != Some(direction) {
                return Err(invalid(format!("hop {i} forwarded away from the target")));
            }
            if Direction::towards(from.node.num_id, to.node.num_id) != Some(direction) {
                return Err(invalid(format!("hop {} is not {direction} of hop {i}", i + 1)));
            }
            if to.level > from.level {
                return Err(invalid(format!("level increased at hop {}", i + 1)));
            }
        }

        for (i, hop) in self.hops.iter().enumerate() {
            let sig = hop
                .step_signature
                .as_ref()
                .ok_or_else(|| invalid(format!("hop {i} is not step-signed")))?;
            crypto::verify(&hop.node, params, STEP_SIGNATURE_DOMAIN, &self.step_payload(i), sig)
                .map_err(|e| invalid(format!("step signature of hop {i} ({}): {e}", hop.node.num_id)))?;
        }
        Ok(())
    }
}

/// One guard's attestation of a complete transcript.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardSignature {
    pub guard: NodeInfo,
    pub signature: IdentitySignature,
}

impl GuardSignature {
    pub fn sign(guard: &NodeInfo, key: &PrivateKey, transcript: &RoutingTranscript) -> Self {
        Self {
            guard: guard.clone(),
            signature: crypto::sign(key, GUARD_SIGNATURE_DOMAIN, &transcript.canonical_bytes()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTranscript {
    transcript: RoutingTranscript,
    guard_signatures: Vec<GuardSignature>,
}

impl SignedTranscript {
    pub fn new(transcript: RoutingTranscript, guard_signatures: Vec<GuardSignature>) -> Self {
        Self {
            transcript,
            guard_signatures,
        }
    }

    pub fn transcript(&self) -> &RoutingTranscript {
        &self.transcript
    }

    pub fn guard_signatures(&self) -> &[GuardSignature] {
        &self.guard_signatures
    }

    /// Full check of a search outcome: the transcript must end at `result`,
    /// `result` must hold the target, every step must verify and every guard
    /// signature must verify over the canonical encoding.
    pub fn verify(&self, params: &PublicParameters, result: &NodeInfo) -> SkipGraphResult<()> {
        let transcript = &self.transcript;
        let terminal = transcript
            .terminal()
            .ok_or_else(|| invalid("transcript has no hops"))?;
        if &terminal.node != result {
            return Err(invalid(format!(
                "transcript terminates at {} but result is {}",
                terminal.node, result
            )));
        }
        if result.num_id != transcript.target {
            return Err(invalid(format!(
                "result {} does not hold target {}",
                result.num_id, transcript.target
            )));
        }
        transcript.verify_steps(params)?;

        if self.guard_signatures.is_empty() {
            return Err(invalid("transcript carries no guard signature"));
        }
        let canonical = transcript.canonical_bytes();
        for (i, attestation) in self.guard_signatures.iter().enumerate() {
            if attestation.guard.same_node(result) {
                return Err(invalid("terminal node cannot guard its own transcript"));
            }
            if self.guard_signatures[..i]
                .iter()
                .any(|g| g.guard.same_node(&attestation.guard))
            {
                return Err(invalid(format!("guard {} signed twice", attestation.guard.num_id)));
            }
            crypto::verify(
                &attestation.guard,
                params,
                GUARD_SIGNATURE_DOMAIN,
                &canonical,
                &attestation.signature,
            )
            .map_err(|e| {
                invalid(format!("guard signature of {}: {e}", attestation.guard.num_id))
            })?;
        }
        Ok(())
    }

    /// [`SignedTranscript::verify`] for a search started at `origin`, which
    /// must also be the first hop.
    pub fn verify_from(
        &self,
        params: &PublicParameters,
        origin: &NodeInfo,
        result: &NodeInfo,
    ) -> SkipGraphResult<()> {
        match self.transcript.origin() {
            Some(hop) if &hop.node == origin => {}
            Some(hop) => {
                return Err(invalid(format!(
                    "transcript starts at {} but the search started at {origin}",
                    hop.node
                )));
            }
            None => return Err(invalid("transcript has no hops")),
        }
        self.verify(params, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::MasterKey;
    use crate::identity::NameId;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    struct Fixture {
        master: MasterKey,
        nodes: Vec<(NodeInfo, PrivateKey)>,
    }

    impl Fixture {
        fn new() -> Self {
            let master = MasterKey::generate(&mut StdRng::seed_from_u64(42));
            let nodes = [(3u64, "01"), (5, "00"), (9, "10"), (12, "11")]
                .into_iter()
                .map(|(num, bits)| {
                    let node = NodeInfo::new(num, NameId::new(bits).unwrap(), format!("n{num}"));
                    let key = master.issue(&node);
                    (node, key)
                })
                .collect();
            Self { master, nodes }
        }

        fn params(&self) -> PublicParameters {
            self.master.public_parameters()
        }

        /// 3 -> 5 -> 9 at level 0, guarded by 12.
        fn signed(&self) -> (SignedTranscript, NodeInfo) {
            let mut t = RoutingTranscript::new(9);
            let (n3, k3) = &self.nodes[0];
            let (n5, k5) = &self.nodes[1];
            let (n9, k9) = &self.nodes[2];
            t.record_hop(n3, 1, Some(Direction::Right), k3);
            t.record_hop(n5, 0, Some(Direction::Right), k5);
            t.record_hop(n9, 0, None, k9);
            let (g, gk) = &self.nodes[3];
            let sig = GuardSignature::sign(g, gk, &t);
            (SignedTranscript::new(t, vec![sig]), n9.clone())
        }
    }

    #[test]
    fn well_formed_transcript_verifies() {
        let fx = Fixture::new();
        let (signed, result) = fx.signed();
        assert_eq!(signed.verify(&fx.params(), &result), Ok(()));
        assert_eq!(signed.transcript().len(), 3);
    }

    #[test]
    fn result_must_match_terminal_hop() {
        let fx = Fixture::new();
        let (signed, _) = fx.signed();
        let other = fx.nodes[1].0.clone();
        assert!(matches!(
            signed.verify(&fx.params(), &other),
            Err(SkipGraphError::InvalidTranscript(_))
        ));
    }

    #[test]
    fn transcript_must_start_at_the_searcher() {
        let fx = Fixture::new();
        let (signed, result) = fx.signed();
        let (n3, _) = &fx.nodes[0];
        let (n5, _) = &fx.nodes[1];
        assert_eq!(signed.verify_from(&fx.params(), n3, &result), Ok(()));

        // Fully signed, but for a search someone else ran.
        assert_eq!(signed.verify(&fx.params(), &result), Ok(()));
        assert!(matches!(
            signed.verify_from(&fx.params(), n5, &result),
            Err(SkipGraphError::InvalidTranscript(_))
        ));
    }

    #[test]
    fn tampered_hop_breaks_signatures() {
        let fx = Fixture::new();
        let (signed, result) = fx.signed();
        let mut transcript = signed.transcript().clone();
        transcript.hops[1].level = 1;
        let tampered = SignedTranscript::new(transcript, signed.guard_signatures().to_vec());
        assert!(tampered.verify(&fx.params(), &result).is_err());
    }

    #[test]
    fn dropped_hop_is_detected() {
        let fx = Fixture::new();
        let (signed, result) = fx.signed();
        let mut transcript = signed.transcript().clone();
        transcript.hops.remove(1);
        // A guard willing to sign anything still cannot launder a broken chain.
        let (g, gk) = &fx.nodes[3];
        let sig = GuardSignature::sign(g, gk, &transcript);
        let forged = SignedTranscript::new(transcript, vec![sig]);
        assert!(matches!(
            forged.verify(&fx.params(), &result),
            Err(SkipGraphError::InvalidTranscript(_))
        ));
    }

    #[test]
    fn missing_or_foreign_guard_signature_fails() {
        let fx = Fixture::new();
        let (signed, result) = fx.signed();

        let unsigned = SignedTranscript::new(signed.transcript().clone(), Vec::new());
        assert!(unsigned.verify(&fx.params(), &result).is_err());

        let foreign = MasterKey::generate(&mut StdRng::seed_from_u64(7));
        assert!(signed.verify(&foreign.public_parameters(), &result).is_err());
    }

    #[test]
    fn terminal_cannot_self_guard() {
        let fx = Fixture::new();
        let (signed, result) = fx.signed();
        let (n9, k9) = &fx.nodes[2];
        let self_sig = GuardSignature::sign(n9, k9, signed.transcript());
        let forged = SignedTranscript::new(signed.transcript().clone(), vec![self_sig]);
        assert!(forged.verify(&fx.params(), &result).is_err());
    }

    #[test]
    fn step_payload_is_a_prefix_commitment() {
        let fx = Fixture::new();
        let (signed, _) = fx.signed();
        let t = signed.transcript();
        let p0 = t.step_payload(0);
        let p2 = t.step_payload(2);
        assert_ne!(p0, p2);
        assert_eq!(t.step_payload(2), t.step_payload(10));
        assert!(t.verify_steps(&fx.params()).is_ok());
    }
}
