//! Crypto Engine (C1).
//!
//! Hybrid construction used by every higher layer: an X25519 Diffie-Hellman
//! exchange derives a fresh AEAD key per layer, then XChaCha20-Poly1305 seals
//! the payload. A peer's long-term identity is an Ed25519 keypair (so it can
//! also sign elsewhere); the Montgomery-form conversion lets that same key
//! double as the long-term wrap key used here.
//!
//! Layer format: VERSION[1] | EPK[32] | NONCE[24] | CIPHERTEXT[..].
//! `build_onion` composes N such layers from the innermost (exit) outward;
//! `peel_layer` removes exactly one, in hop order.
//!
//! `seal_establishment`/`open_establishment` reuse the same layer format for
//! sealed addressing: the originator's public key travels inside the AEAD
//! plaintext instead of as a wire field, so the frame carries no addressing
//! information beyond what successfully decrypting it reveals.

use chacha20poly1305::{aead::Aead, AeadCore, KeyInit, XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroize;

const VERSION: u8 = 0x01;
const EPK_LEN: usize = 32;
const NONCE_LEN: usize = 24;
const TAG_LEN: usize = 16;
const MIN_LAYER_LEN: usize = 1 + EPK_LEN + NONCE_LEN + TAG_LEN;
const HKDF_INFO: &[u8] = b"circuit-core:onion:v1";

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("route must have at least one hop")]
    EmptyRoute,
    #[error("envelope too short or malformed")]
    InvalidEnvelope,
    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(u8),
    #[error("RSA/DH key wrap failed")]
    UnwrapFailed,
    #[error("AEAD tag did not verify — tampered or wrong key")]
    AuthTagInvalid,
    #[error("hardware RNG failure")]
    RngFailure,
}

/// A long-term or ephemeral X25519 keypair.
///
/// `secret` is zeroized on drop so it never lingers once a circuit (or a
/// `KeyPair` standing in for a peer's long-term identity) is discarded.
pub struct KeyPair {
    pub secret: StaticSecret,
    pub public: X25519Public,
}

impl KeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519Public::from(&secret);
        KeyPair { secret, public }
    }

    /// Derive a long-term X25519 keypair from a 32-byte Ed25519 seed, so a
    /// peer's announced identity key doubles as its circuit-wrap key.
    pub fn from_ed25519_seed(seed: &[u8; 32]) -> Self {
        let secret = ed25519_seed_to_x25519(seed);
        let public = X25519Public::from(&secret);
        KeyPair { secret, public }
    }
}

/// Convert a 32-byte Ed25519 seed to an X25519 static secret (RFC 7748 §5
/// clamping of the SHA-512 digest's first half — the standard birational map
/// between the Edwards and Montgomery forms of Curve25519).
pub fn ed25519_seed_to_x25519(seed: &[u8; 32]) -> StaticSecret {
    use sha2::Digest;
    let wide = sha2::Sha512::digest(seed);
    let mut key = [0u8; 32];
    key.copy_from_slice(&wide[..32]);
    key[0] &= 248;
    key[31] &= 127;
    key[31] |= 64;
    StaticSecret::from(key)
}

/// Convert a 32-byte Ed25519 compressed public key to its X25519 Montgomery form.
pub fn ed25519_pubkey_to_x25519(pubkey: &[u8; 32]) -> X25519Public {
    use curve25519_dalek::edwards::CompressedEdwardsY;
    let point = CompressedEdwardsY(*pubkey)
        .decompress()
        .unwrap_or_else(curve25519_dalek::EdwardsPoint::default);
    X25519Public::from(point.to_montgomery().to_bytes())
}

fn derive_aead_key(shared: &[u8; 32], salt: &[u8; 32], info: &[u8]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(Some(salt), shared);
    let mut key = [0u8; 32];
    hk.expand(info, &mut key)
        .expect("HKDF output length is always valid for a 32-byte key");
    key
}

/// `n` independent long-term-algorithm keypairs for a fresh circuit.
pub fn generate_circuit_keys(n: usize) -> Result<Vec<KeyPair>, CryptoError> {
    if n == 0 {
        return Err(CryptoError::EmptyRoute);
    }
    Ok((0..n).map(|_| KeyPair::generate()).collect())
}

/// One AEAD-sealed layer, plus the bookkeeping the receiver needs to undo it.
pub struct EncryptedLayer {
    pub ciphertext: Vec<u8>,
    pub wrapped_key: [u8; EPK_LEN],
    pub iv: [u8; NONCE_LEN],
}

/// Encrypt `data` for the holder of `pk`, generating a fresh ephemeral keypair
/// and nonce. `wrapped_key` carries the ephemeral public key — "wrapping" the
/// fresh symmetric key takes the form of an ECDH exchange rather than an RSA
/// envelope, per the crypto-agility note in §9 of the spec.
pub fn encrypt_layer(data: &[u8], pk: &X25519Public) -> Result<EncryptedLayer, CryptoError> {
    let ephemeral_secret = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = X25519Public::from(&ephemeral_secret);

    let shared = ephemeral_secret.diffie_hellman(pk);
    let aead_key = derive_aead_key(shared.as_bytes(), ephemeral_public.as_bytes(), HKDF_INFO);

    let cipher =
        XChaCha20Poly1305::new_from_slice(&aead_key).map_err(|_| CryptoError::RngFailure)?;
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, data)
        .map_err(|_| CryptoError::RngFailure)?;

    Ok(EncryptedLayer {
        ciphertext,
        wrapped_key: *ephemeral_public.as_bytes(),
        iv: nonce.into(),
    })
}

/// As `encrypt_layer`, but the caller supplies the ephemeral keypair rather
/// than minting a fresh one. A circuit reuses one ephemeral keypair per hop
/// across every send for that circuit's lifetime (§3's `ephemeral_keys`):
/// the derived AEAD key is then fixed per (circuit, hop) pair, and the
/// forward-secrecy property rests on that keypair's secret half being
/// zeroed when the circuit closes, not on per-message freshness.
pub fn encrypt_layer_with_ephemeral(
    data: &[u8],
    pk: &X25519Public,
    ephemeral: &KeyPair,
) -> Result<EncryptedLayer, CryptoError> {
    let shared = ephemeral.secret.diffie_hellman(pk);
    let aead_key = derive_aead_key(shared.as_bytes(), ephemeral.public.as_bytes(), HKDF_INFO);

    let cipher =
        XChaCha20Poly1305::new_from_slice(&aead_key).map_err(|_| CryptoError::RngFailure)?;
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, data)
        .map_err(|_| CryptoError::RngFailure)?;

    Ok(EncryptedLayer {
        ciphertext,
        wrapped_key: *ephemeral.public.as_bytes(),
        iv: nonce.into(),
    })
}

/// As `build_onion`, but wraps each layer under the circuit's own
/// already-established per-hop ephemeral keypair instead of minting one per
/// call — used by the Circuit Builder for every `send()` on a `Ready`
/// circuit, so every frame of that circuit carries the same `wrapped_key`
/// per hop and only the nonce varies.
pub fn build_onion_with_keys(
    data: &[u8],
    pks: &[X25519Public],
    ephemerals: &[KeyPair],
) -> Result<OnionEnvelope, CryptoError> {
    if pks.is_empty() || pks.len() != ephemerals.len() {
        return Err(CryptoError::EmptyRoute);
    }
    let n = pks.len();
    let mut wrapped_keys = vec![[0u8; EPK_LEN]; n];
    let mut ivs = vec![[0u8; NONCE_LEN]; n];

    let mut current = data.to_vec();
    for i in (0..n).rev() {
        let layer = encrypt_layer_with_ephemeral(&current, &pks[i], &ephemerals[i])?;
        wrapped_keys[i] = layer.wrapped_key;
        ivs[i] = layer.iv;
        current = layer.ciphertext;
    }

    Ok(OnionEnvelope {
        payload: current,
        wrapped_keys,
        ivs,
    })
}

/// Undo `encrypt_layer` with the recipient's long-term secret.
pub fn decrypt_layer(
    ciphertext: &[u8],
    wrapped_key: &[u8; EPK_LEN],
    iv: &[u8; NONCE_LEN],
    sk: &StaticSecret,
) -> Result<Vec<u8>, CryptoError> {
    let ephemeral_public = X25519Public::from(*wrapped_key);
    let shared = sk.diffie_hellman(&ephemeral_public);
    let aead_key = derive_aead_key(shared.as_bytes(), wrapped_key, HKDF_INFO);

    let cipher =
        XChaCha20Poly1305::new_from_slice(&aead_key).map_err(|_| CryptoError::UnwrapFailed)?;
    let nonce = XNonce::from_slice(iv);
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::AuthTagInvalid)
}

/// One peeled-or-final onion envelope.
#[derive(Clone, Debug)]
pub struct OnionEnvelope {
    pub payload: Vec<u8>,
    pub wrapped_keys: Vec<[u8; EPK_LEN]>,
    pub ivs: Vec<[u8; NONCE_LEN]>,
}

impl OnionEnvelope {
    /// Flatten to a single wire-ready byte string:
    /// VERSION[1] | hop_count[1] | (wrapped_key[32] | iv[24])×N | payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let n = self.wrapped_keys.len();
        let mut out = Vec::with_capacity(2 + n * (EPK_LEN + NONCE_LEN) + self.payload.len());
        out.push(VERSION);
        out.push(n as u8);
        for i in 0..n {
            out.extend_from_slice(&self.wrapped_keys[i]);
            out.extend_from_slice(&self.ivs[i]);
        }
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() < 2 {
            return Err(CryptoError::InvalidEnvelope);
        }
        if bytes[0] != VERSION {
            return Err(CryptoError::UnsupportedVersion(bytes[0]));
        }
        let n = bytes[1] as usize;
        let header_len = 2 + n * (EPK_LEN + NONCE_LEN);
        if bytes.len() < header_len {
            return Err(CryptoError::InvalidEnvelope);
        }
        let mut wrapped_keys = Vec::with_capacity(n);
        let mut ivs = Vec::with_capacity(n);
        let mut cursor = 2;
        for _ in 0..n {
            let mut wk = [0u8; EPK_LEN];
            wk.copy_from_slice(&bytes[cursor..cursor + EPK_LEN]);
            cursor += EPK_LEN;
            let mut iv = [0u8; NONCE_LEN];
            iv.copy_from_slice(&bytes[cursor..cursor + NONCE_LEN]);
            cursor += NONCE_LEN;
            wrapped_keys.push(wk);
            ivs.push(iv);
        }
        Ok(OnionEnvelope {
            payload: bytes[cursor..].to_vec(),
            wrapped_keys,
            ivs,
        })
    }
}

/// Encrypt from the innermost layer outward: the exit hop's key wraps first,
/// each subsequent iteration wraps the previous ciphertext under the next
/// hop's key working back to the entry. `wrapped_keys[i]`/`ivs[i]` correspond
/// to hop `i` (0 = entry) once the whole envelope is assembled.
pub fn build_onion(data: &[u8], pks: &[X25519Public]) -> Result<OnionEnvelope, CryptoError> {
    if pks.is_empty() {
        return Err(CryptoError::EmptyRoute);
    }
    let n = pks.len();
    let mut wrapped_keys = vec![[0u8; EPK_LEN]; n];
    let mut ivs = vec![[0u8; NONCE_LEN]; n];

    let mut current = data.to_vec();
    for i in (0..n).rev() {
        let layer = encrypt_layer(&current, &pks[i])?;
        wrapped_keys[i] = layer.wrapped_key;
        ivs[i] = layer.iv;
        current = layer.ciphertext;
    }

    Ok(OnionEnvelope {
        payload: current,
        wrapped_keys,
        ivs,
    })
}

/// Result of peeling one layer: either another envelope for the next hop, or
/// the plaintext delivered once the final layer comes off.
#[derive(Debug)]
pub enum Peeled {
    Forward(OnionEnvelope),
    Plaintext(Vec<u8>),
}

/// Remove exactly the outermost remaining layer, addressed by `hop_index`
/// into `frame`'s key/iv arrays. The hop cannot see past its own layer: it
/// gets back either a smaller `OnionEnvelope` (fewer keys/ivs, still
/// encrypted) or, once it was the last layer, plaintext.
pub fn peel_layer(
    frame: &OnionEnvelope,
    hop_index: usize,
    sk_for_this_hop: &StaticSecret,
) -> Result<Peeled, CryptoError> {
    if hop_index >= frame.wrapped_keys.len() {
        return Err(CryptoError::InvalidEnvelope);
    }
    let inner = decrypt_layer(
        &frame.payload,
        &frame.wrapped_keys[hop_index],
        &frame.ivs[hop_index],
        sk_for_this_hop,
    )?;

    let remaining = frame.wrapped_keys.len() - hop_index - 1;
    if remaining == 0 {
        return Ok(Peeled::Plaintext(inner));
    }

    Ok(Peeled::Forward(OnionEnvelope {
        payload: inner,
        wrapped_keys: frame.wrapped_keys[hop_index + 1..].to_vec(),
        ivs: frame.ivs[hop_index + 1..].to_vec(),
    }))
}

/// Seal bytes addressed to one recipient the way the donor's sealed-sender
/// envelope hides a gossip message's author: the originator's identity
/// public key travels *inside* the AEAD plaintext rather than in any
/// cleartext field, so the wire frame itself carries no addressing
/// information beyond what decrypting it reveals.
///
/// Wire format: VERSION[1] | EPK[32] | NONCE[24] | CIPHERTEXT, where
/// CIPHERTEXT decrypts to `originator_pk[32] || payload`. Used for the
/// circuit-establishment record (§4.4 step 4) so that a relay which isn't
/// the addressed hop — and so can't decrypt — learns nothing from the frame
/// about which circuit or which originator it belongs to.
pub fn seal_establishment(
    payload: &[u8],
    originator_pk: &[u8; 32],
    recipient_pk: &X25519Public,
    ephemeral: &KeyPair,
) -> Result<Vec<u8>, CryptoError> {
    let mut plaintext = Vec::with_capacity(32 + payload.len());
    plaintext.extend_from_slice(originator_pk);
    plaintext.extend_from_slice(payload);

    let layer = encrypt_layer_with_ephemeral(&plaintext, recipient_pk, ephemeral)?;

    let mut out = Vec::with_capacity(1 + EPK_LEN + NONCE_LEN + layer.ciphertext.len());
    out.push(VERSION);
    out.extend_from_slice(&layer.wrapped_key);
    out.extend_from_slice(&layer.iv);
    out.extend_from_slice(&layer.ciphertext);
    Ok(out)
}

/// Attempt to open a sealed envelope with this node's long-term secret.
/// Any node on the signaling channel can call this on any sealed envelope
/// it sees — the AEAD tag check is the only signal of whether the envelope
/// was addressed here, since the wire form carries no cleartext recipient
/// field. Returns the originator's public key and the enclosed payload.
pub fn open_establishment(
    envelope: &[u8],
    recipient_secret: &StaticSecret,
) -> Result<([u8; 32], Vec<u8>), CryptoError> {
    let header_len = 1 + EPK_LEN + NONCE_LEN;
    if envelope.len() < header_len + TAG_LEN {
        return Err(CryptoError::InvalidEnvelope);
    }
    if envelope[0] != VERSION {
        return Err(CryptoError::UnsupportedVersion(envelope[0]));
    }
    let mut wrapped_key = [0u8; EPK_LEN];
    wrapped_key.copy_from_slice(&envelope[1..1 + EPK_LEN]);
    let mut iv = [0u8; NONCE_LEN];
    iv.copy_from_slice(&envelope[1 + EPK_LEN..header_len]);
    let ciphertext = &envelope[header_len..];

    let plaintext = decrypt_layer(ciphertext, &wrapped_key, &iv, recipient_secret)?;
    if plaintext.len() < 32 {
        return Err(CryptoError::InvalidEnvelope);
    }
    let mut originator_pk = [0u8; 32];
    originator_pk.copy_from_slice(&plaintext[..32]);
    Ok((originator_pk, plaintext[32..].to_vec()))
}

/// Zero a secret's backing bytes explicitly (used when a circuit is torn
/// down and its ephemeral keys must not outlive the circuit — invariant vi).
pub fn zeroize_keypair(kp: &mut KeyPair) {
    let mut bytes = kp.secret.to_bytes();
    bytes.zeroize();
    kp.secret = StaticSecret::from(bytes);
}
