//! # Wire Protocol Messages
//!
//! Every datagram or frame the seed node exchanges is one signed [`Envelope`]:
//!
//! | Request | Reply | Purpose |
//! |---------|-------|---------|
//! | `Probe` | `ProbeAck` | Liveness and round-trip time |
//! | `NeighborQuery { target }` | `NeighborReply { peers }` | Closest known peers to `target` |
//!
//! A reply carries the [`Token`] of the request it answers. Envelopes are
//! serialized with bincode under a hard size limit, and a receiver checks the
//! app protocol version, the sender's address derivation and the Ed25519
//! signature before anything else looks at the message.

use bincode::Options;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{ENVELOPE_SIGNATURE_DOMAIN, SignatureError, sign_with_domain, verify_with_domain};
use crate::identity::{Address, Keypair, Peer};
use crate::routing::BUCKET_SIZE;

/// Largest encoded envelope accepted from the network.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Upper bound on peers in a single neighbor reply.
pub const MAX_NEIGHBORS: usize = BUCKET_SIZE;

/// Correlation token binding a reply to its request.
pub type Token = [u8; 16];

/// Generate an unpredictable correlation token.
pub fn fresh_token() -> Token {
    let mut token = [0u8; 16];
    OsRng.fill_bytes(&mut token);
    token
}

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_FRAME_SIZE as u64)
        .with_fixint_encoding()
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("frame of {0} bytes exceeds limit")]
    TooLarge(usize),
    #[error("app protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u32, actual: u32 },
    #[error("sender address does not match its public key")]
    AddressMismatch,
    #[error("neighbor reply carries {0} peers")]
    TooManyPeers(usize),
    #[error(transparent)]
    Signature(#[from] SignatureError),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Probe,
    ProbeAck,
    NeighborQuery { target: Address },
    NeighborReply { peers: Vec<Peer> },
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Probe => "probe",
            Message::ProbeAck => "probe_ack",
            Message::NeighborQuery { .. } => "neighbor_query",
            Message::NeighborReply { .. } => "neighbor_reply",
        }
    }

    /// Replies complete a pending request; everything else is unsolicited.
    pub fn is_reply(&self) -> bool {
        matches!(self, Message::ProbeAck | Message::NeighborReply { .. })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u32,
    pub token: Token,
    pub sender: Peer,
    pub message: Message,
    pub signature: Vec<u8>,
}

#[derive(Serialize)]
struct SignedFields<'a> {
    version: u32,
    token: &'a Token,
    sender: &'a Peer,
    message: &'a Message,
}

fn signed_bytes(
    version: u32,
    token: &Token,
    sender: &Peer,
    message: &Message,
) -> Result<Vec<u8>, EnvelopeError> {
    let fields = SignedFields { version, token, sender, message };
    Ok(bincode_options().serialize(&fields)?)
}

impl Envelope {
    /// Build and sign an envelope. `sender` must describe `keypair`'s identity.
    pub fn seal(
        keypair: &Keypair,
        version: u32,
        token: Token,
        sender: Peer,
        message: Message,
    ) -> Result<Self, EnvelopeError> {
        let bytes = signed_bytes(version, &token, &sender, &message)?;
        let signature = sign_with_domain(keypair, ENVELOPE_SIGNATURE_DOMAIN, &bytes);
        Ok(Self { version, token, sender, message, signature })
    }

    /// Check version, sender derivation, payload bounds and signature.
    pub fn verify(&self, expected_version: u32) -> Result<(), EnvelopeError> {
        if self.version != expected_version {
            return Err(EnvelopeError::VersionMismatch {
                expected: expected_version,
                actual: self.version,
            });
        }
        if !self.sender.is_consistent() {
            return Err(EnvelopeError::AddressMismatch);
        }
        if let Message::NeighborReply { peers } = &self.message
            && peers.len() > MAX_NEIGHBORS
        {
            return Err(EnvelopeError::TooManyPeers(peers.len()));
        }
        let bytes = signed_bytes(self.version, &self.token, &self.sender, &self.message)?;
        verify_with_domain(&self.sender.identity, ENVELOPE_SIGNATURE_DOMAIN, &bytes, &self.signature)?;
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        let bytes = bincode_options().serialize(self)?;
        if bytes.len() > MAX_FRAME_SIZE {
            return Err(EnvelopeError::TooLarge(bytes.len()));
        }
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        if bytes.len() > MAX_FRAME_SIZE {
            return Err(EnvelopeError::TooLarge(bytes.len()));
        }
        Ok(bincode_options().deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VERSION: u32 = 7;

    fn sealed(kp: &Keypair, message: Message) -> Envelope {
        let sender = Peer::new(kp.identity(), "127.0.0.1:9000");
        Envelope::seal(kp, VERSION, fresh_token(), sender, message).unwrap()
    }

    #[test]
    fn sealed_envelope_survives_the_wire() {
        let kp = Keypair::generate();
        let target = Keypair::generate().address();
        let env = sealed(&kp, Message::NeighborQuery { target });

        let decoded = Envelope::decode(&env.encode().unwrap()).unwrap();
        assert!(decoded.verify(VERSION).is_ok());
        assert_eq!(decoded.token, env.token);
        assert_eq!(decoded.message, Message::NeighborQuery { target });
    }

    #[test]
    fn tampered_message_fails_verification() {
        let kp = Keypair::generate();
        let mut env = sealed(&kp, Message::Probe);
        env.message = Message::ProbeAck;
        assert!(matches!(env.verify(VERSION), Err(EnvelopeError::Signature(_))));
    }

    #[test]
    fn other_version_rejected() {
        let kp = Keypair::generate();
        let env = sealed(&kp, Message::Probe);
        assert!(matches!(
            env.verify(VERSION + 1),
            Err(EnvelopeError::VersionMismatch { expected: 8, actual: 7 })
        ));
    }

    #[test]
    fn sender_claiming_foreign_key_rejected() {
        let kp = Keypair::generate();
        let victim = Keypair::generate();
        let sender = Peer::new(victim.identity(), "127.0.0.1:9000");
        let env = Envelope::seal(&kp, VERSION, fresh_token(), sender, Message::Probe).unwrap();
        assert!(matches!(env.verify(VERSION), Err(EnvelopeError::Signature(_))));
    }

    #[test]
    fn oversized_neighbor_reply_rejected() {
        let kp = Keypair::generate();
        let peers = (0..MAX_NEIGHBORS + 1)
            .map(|_| Peer::new(Keypair::generate().identity(), "127.0.0.1:1"))
            .collect();
        let env = sealed(&kp, Message::NeighborReply { peers });
        assert!(matches!(env.verify(VERSION), Err(EnvelopeError::TooManyPeers(17))));
    }

    #[test]
    fn garbage_and_oversized_frames_rejected() {
        assert!(Envelope::decode(&[0xFF; 8]).is_err());
        assert!(matches!(
            Envelope::decode(&vec![0u8; MAX_FRAME_SIZE + 1]),
            Err(EnvelopeError::TooLarge(_))
        ));
    }

    #[test]
    fn tokens_are_unique() {
        assert_ne!(fresh_token(), fresh_token());
    }

    #[test]
    fn reply_classification() {
        assert!(Message::ProbeAck.is_reply());
        assert!(Message::NeighborReply { peers: vec![] }.is_reply());
        assert!(!Message::Probe.is_reply());
        assert_eq!(Message::Probe.kind(), "probe");
    }
}
