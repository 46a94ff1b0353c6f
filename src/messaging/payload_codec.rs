use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use aes_gcm::{Aes256Gcm, KeyInit};
use aes_gcm::aead::{Aead, Nonce, OsRng};
use anyhow::{anyhow, bail};
use bytes::BufMut;
use rustc_hash::FxHashMap;
use tracing::{debug, info};

/// Encryption of message payloads, per peer. This is applied to the payload of `text` frames only:
///  the frame header stays in plain text so that sequencing works without keys.
pub trait PayloadCodec: Send + Sync + 'static {
    fn encrypt(&self, peer: SocketAddr, plaintext: &[u8]) -> anyhow::Result<Vec<u8>>;

    fn decrypt(&self, peer: SocketAddr, ciphertext: &[u8]) -> anyhow::Result<Vec<u8>>;
}

pub struct NoEncryption;
impl PayloadCodec for NoEncryption {
    fn encrypt(&self, _peer: SocketAddr, plaintext: &[u8]) -> anyhow::Result<Vec<u8>> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, _peer: SocketAddr, ciphertext: &[u8]) -> anyhow::Result<Vec<u8>> {
        Ok(ciphertext.to_vec())
    }
}

struct SessionCipher {
    cipher: Aes256Gcm,
    nonce_fixed: u32,
    nonce_incremented: AtomicU64,
}

impl SessionCipher {
    fn new(key: &[u8; 32]) -> anyhow::Result<SessionCipher> {
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| anyhow!("invalid AES key: {}", e))?;

        Ok(SessionCipher {
            cipher,
            nonce_fixed: rand::random(),
            nonce_incremented: AtomicU64::new(0),
        })
    }

    fn next_nonce(&self) -> [u8; Aes256GcmCodec::NONCE_LEN] {
        let mut result = [0u8; Aes256GcmCodec::NONCE_LEN];
        let mut buf = &mut result[..];
        buf.put_u32(self.nonce_fixed);
        buf.put_u64(self.nonce_incremented.fetch_add(1, Ordering::AcqRel));
        result
    }
}

/// AES-256-GCM with a separate session key per peer. The session key is agreed on outside this
///  crate (by a key exchange handshake) and installed via [Aes256GcmCodec::install_session_key].
///
/// Encrypted payloads have the layout `nonce (12 bytes) | ciphertext | tag (16 bytes)`. The nonce
///  is a random 32 bit prefix per session followed by a 64 bit counter, so it is never reused for
///  a given key.
#[derive(Default)]
pub struct Aes256GcmCodec {
    sessions: RwLock<FxHashMap<SocketAddr, Arc<SessionCipher>>>,
}

impl Aes256GcmCodec {
    pub const NONCE_LEN: usize = 12;
    pub const TAG_LEN: usize = 16;

    pub fn new() -> Aes256GcmCodec {
        Default::default()
    }

    pub fn generate_session_key() -> [u8; 32] {
        let key = Aes256Gcm::generate_key(OsRng);
        let mut result = [0u8; 32];
        result.copy_from_slice(key.as_slice());
        result
    }

    pub fn install_session_key(&self, peer: SocketAddr, key: &[u8; 32]) -> anyhow::Result<()> {
        let session = Arc::new(SessionCipher::new(key)?);
        self.sessions.write()
            .map_err(|_| anyhow!("session key map is poisoned"))?
            .insert(peer, session);
        info!("installed session key for {:?}", peer);
        Ok(())
    }

    pub fn remove_session_key(&self, peer: SocketAddr) -> anyhow::Result<bool> {
        let removed = self.sessions.write()
            .map_err(|_| anyhow!("session key map is poisoned"))?
            .remove(&peer)
            .is_some();
        Ok(removed)
    }

    fn session(&self, peer: SocketAddr) -> anyhow::Result<Arc<SessionCipher>> {
        let sessions = self.sessions.read()
            .map_err(|_| anyhow!("session key map is poisoned"))?;
        match sessions.get(&peer) {
            Some(session) => Ok(session.clone()),
            None => bail!("no session key for peer {:?}", peer),
        }
    }
}

impl PayloadCodec for Aes256GcmCodec {
    fn encrypt(&self, peer: SocketAddr, plaintext: &[u8]) -> anyhow::Result<Vec<u8>> {
        let session = self.session(peer)?;
        let nonce_buf = session.next_nonce();
        let nonce = Nonce::<Aes256Gcm>::from_slice(&nonce_buf);

        let ciphertext = session.cipher.encrypt(nonce, plaintext)
            .map_err(|e| anyhow!("encryption error: {}", e))?;

        let mut result = Vec::with_capacity(Self::NONCE_LEN + ciphertext.len());
        result.put_slice(&nonce_buf);
        result.put_slice(&ciphertext);
        Ok(result)
    }

    fn decrypt(&self, peer: SocketAddr, ciphertext: &[u8]) -> anyhow::Result<Vec<u8>> {
        if ciphertext.len() < Self::NONCE_LEN + Self::TAG_LEN {
            bail!("encrypted payload is too short: {} bytes", ciphertext.len());
        }

        let session = self.session(peer)?;
        let (nonce_buf, ciphertext) = ciphertext.split_at(Self::NONCE_LEN);
        let nonce = Nonce::<Aes256Gcm>::from_slice(nonce_buf);

        session.cipher.decrypt(nonce, ciphertext)
            .map_err(|e| {
                debug!("decryption of payload from {:?} failed", peer);
                anyhow!("decryption error: {}", e)
            })
    }
}
