// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Key agreement and the per-session cipher state.
//!
//! One cleartext round trip exchanges `(ephemeral_pubkey, static_pubkey)`
//! in each direction. Three X25519 outputs (ephemeral-ephemeral plus both
//! ephemeral-static pairings) feed HKDF-SHA256 with the `entgldb-v1`
//! context and a transcript-hash salt, yielding one 32-byte key per
//! direction. Frames are then sealed with ChaCha20-Poly1305 under a
//! monotonic per-direction 96-bit nonce; a received nonce that is not the
//! next expected one is fatal, and a sender approaching nonce exhaustion
//! must close the session.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncWrite};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{NetError, Result};
use crate::frame::{read_frame, write_frame, MsgType};

/// HKDF context string; changing it breaks compatibility on purpose.
pub const HKDF_CONTEXT: &[u8] = b"entgldb-v1";

/// Leave headroom so the close happens before the counter can wrap.
const NONCE_LIMIT: u64 = u64::MAX - 1024;

/// This node's long-lived X25519 identity.
pub struct NodeKeys {
    secret: StaticSecret,
}

impl NodeKeys {
    /// Generates a fresh keypair.
    pub fn generate() -> Self {
        NodeKeys { secret: StaticSecret::random_from_rng(OsRng) }
    }

    pub fn public(&self) -> PublicKey {
        PublicKey::from(&self.secret)
    }
}

impl Default for NodeKeys {
    fn default() -> Self {
        Self::generate()
    }
}

/// Directional AEAD state for one session.
pub struct CipherState {
    send: ChaCha20Poly1305,
    recv: ChaCha20Poly1305,
    send_nonce: u64,
    recv_nonce: u64,
}

impl std::fmt::Debug for CipherState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherState")
            .field("send_nonce", &self.send_nonce)
            .field("recv_nonce", &self.recv_nonce)
            .finish()
    }
}

fn nonce_bytes(counter: u64) -> Nonce {
    let mut bytes = [0u8; 12];
    bytes[4..].copy_from_slice(&counter.to_be_bytes());
    Nonce::from(bytes)
}

impl CipherState {
    pub fn new(send_key: &[u8; 32], recv_key: &[u8; 32]) -> Self {
        CipherState {
            send: ChaCha20Poly1305::new(Key::from_slice(send_key)),
            recv: ChaCha20Poly1305::new(Key::from_slice(recv_key)),
            send_nonce: 0,
            recv_nonce: 0,
        }
    }

    /// Encrypts, producing `nonce(12) || ciphertext || tag(16)`.
    pub fn seal(&mut self, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        if self.send_nonce >= NONCE_LIMIT {
            return Err(NetError::NonceExhausted);
        }
        let nonce = nonce_bytes(self.send_nonce);
        self.send_nonce += 1;

        let ciphertext = self
            .send
            .encrypt(&nonce, Payload { msg: plaintext, aad })
            .map_err(|_| NetError::Decrypt)?;

        let mut out = Vec::with_capacity(12 + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Verifies the nonce sequence and decrypts.
    pub fn open(&mut self, aad: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < 12 + 16 {
            return Err(NetError::Protocol("encrypted payload too short".into()));
        }
        let (nonce, ciphertext) = data.split_at(12);

        let expected = nonce_bytes(self.recv_nonce);
        if nonce != expected.as_slice() {
            // Replayed or reordered nonce within a session is fatal.
            return Err(NetError::Protocol("nonce out of sequence".into()));
        }
        self.recv_nonce += 1;

        self.recv
            .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
            .map_err(|_| NetError::Decrypt)
    }
}

fn public_from_slice(bytes: &[u8]) -> Result<PublicKey> {
    let array: [u8; 32] = bytes
        .try_into()
        .map_err(|_| NetError::Handshake("public key must be 32 bytes".into()))?;
    Ok(PublicKey::from(array))
}

/// Derives the two directional keys.
///
/// Both sides compute the DH outputs in the initiator's order, so the key
/// material is identical; only the send/recv assignment differs.
fn derive_keys(
    dh_ee: &[u8; 32],
    dh_is_er: &[u8; 32],
    dh_ei_rs: &[u8; 32],
    initiator_eph: &PublicKey,
    initiator_static: &PublicKey,
    responder_eph: &PublicKey,
    responder_static: &PublicKey,
) -> Result<([u8; 32], [u8; 32])> {
    let mut ikm = Vec::with_capacity(96);
    ikm.extend_from_slice(dh_ee);
    ikm.extend_from_slice(dh_is_er);
    ikm.extend_from_slice(dh_ei_rs);

    let mut transcript = Sha256::new();
    transcript.update(initiator_eph.as_bytes());
    transcript.update(initiator_static.as_bytes());
    transcript.update(responder_eph.as_bytes());
    transcript.update(responder_static.as_bytes());
    let salt = transcript.finalize();

    let hkdf = Hkdf::<Sha256>::new(Some(&salt), &ikm);
    let mut okm = [0u8; 64];
    hkdf.expand(HKDF_CONTEXT, &mut okm)
        .map_err(|_| NetError::Handshake("hkdf expand failed".into()))?;

    let mut client_to_server = [0u8; 32];
    let mut server_to_client = [0u8; 32];
    client_to_server.copy_from_slice(&okm[..32]);
    server_to_client.copy_from_slice(&okm[32..]);
    Ok((client_to_server, server_to_client))
}

fn handshake_payload(ephemeral: &PublicKey, stat: &PublicKey) -> Vec<u8> {
    let mut payload = Vec::with_capacity(64);
    payload.extend_from_slice(ephemeral.as_bytes());
    payload.extend_from_slice(stat.as_bytes());
    payload
}

fn split_handshake_payload(payload: &[u8]) -> Result<(PublicKey, PublicKey)> {
    if payload.len() != 64 {
        return Err(NetError::Handshake(format!(
            "handshake payload must be 64 bytes, got {}",
            payload.len()
        )));
    }
    Ok((public_from_slice(&payload[..32])?, public_from_slice(&payload[32..])?))
}

/// Client half of the handshake.
pub async fn initiate<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    keys: &NodeKeys,
    max_frame: usize,
) -> Result<CipherState> {
    let ephemeral = StaticSecret::random_from_rng(OsRng);
    let ephemeral_pub = PublicKey::from(&ephemeral);
    let static_pub = keys.public();

    write_frame(
        stream,
        None,
        MsgType::Handshake,
        &handshake_payload(&ephemeral_pub, &static_pub),
        max_frame,
    )
    .await?;

    let (msg_type, payload) = read_frame(stream, None, max_frame).await?;
    if msg_type != MsgType::Handshake {
        return Err(NetError::Handshake("expected handshake response".into()));
    }
    let (responder_eph, responder_static) = split_handshake_payload(&payload)?;

    let dh_ee = ephemeral.diffie_hellman(&responder_eph);
    let dh_is_er = keys.secret.diffie_hellman(&responder_eph);
    let dh_ei_rs = ephemeral.diffie_hellman(&responder_static);

    let (client_to_server, server_to_client) = derive_keys(
        dh_ee.as_bytes(),
        dh_is_er.as_bytes(),
        dh_ei_rs.as_bytes(),
        &ephemeral_pub,
        &static_pub,
        &responder_eph,
        &responder_static,
    )?;
    Ok(CipherState::new(&client_to_server, &server_to_client))
}

/// Server half of the handshake.
pub async fn respond<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    keys: &NodeKeys,
    max_frame: usize,
) -> Result<CipherState> {
    let (msg_type, payload) = read_frame(stream, None, max_frame).await?;
    if msg_type != MsgType::Handshake {
        return Err(NetError::Handshake("expected handshake initiation".into()));
    }
    let (initiator_eph, initiator_static) = split_handshake_payload(&payload)?;

    let ephemeral = StaticSecret::random_from_rng(OsRng);
    let ephemeral_pub = PublicKey::from(&ephemeral);
    let static_pub = keys.public();

    write_frame(
        stream,
        None,
        MsgType::Handshake,
        &handshake_payload(&ephemeral_pub, &static_pub),
        max_frame,
    )
    .await?;

    let dh_ee = ephemeral.diffie_hellman(&initiator_eph);
    let dh_is_er = ephemeral.diffie_hellman(&initiator_static);
    let dh_ei_rs = keys.secret.diffie_hellman(&initiator_eph);

    let (client_to_server, server_to_client) = derive_keys(
        dh_ee.as_bytes(),
        dh_is_er.as_bytes(),
        dh_ei_rs.as_bytes(),
        &initiator_eph,
        &initiator_static,
        &ephemeral_pub,
        &static_pub,
    )?;
    // The responder sends server-to-client and receives client-to-server.
    Ok(CipherState::new(&server_to_client, &client_to_server))
}

#[cfg(test)]
#[path = "handshake_tests.rs"]
mod tests;
