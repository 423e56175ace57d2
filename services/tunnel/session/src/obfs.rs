//! Salamander datagram obfuscation.
//!
//! Each datagram on the wire is `salt (8 bytes) | payload XOR keystream`,
//! where the keystream is BLAKE2b-256 of `password | salt` repeated over the
//! payload. There is no integrity check: a wrong password silently produces
//! garbage that the transport above will reject.

use async_trait::async_trait;
use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use rand::rngs::OsRng;
use rand::RngCore;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::transport::PacketSocket;

/// Obfuscation type name used in configuration
pub const OBFS_SALAMANDER: &str = "salamander";
/// Salt prefixed to every obfuscated datagram
pub const SALT_LEN: usize = 8;
/// Keystream block length (BLAKE2b-256 output)
pub const KEY_LEN: usize = 32;

type Blake2b256 = Blake2b<U32>;

fn keystream(password: &[u8], salt: &[u8]) -> [u8; KEY_LEN] {
    let mut hasher = Blake2b256::new();
    hasher.update(password);
    hasher.update(salt);
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&hasher.finalize());
    key
}

fn xor_in_place(data: &mut [u8], key: &[u8; KEY_LEN]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i % KEY_LEN];
    }
}

/// Scramble `payload` under `salt`; output is `salt | ciphertext`
pub fn obfuscate(password: &[u8], salt: &[u8; SALT_LEN], payload: &[u8]) -> Vec<u8> {
    let key = keystream(password, salt);
    let mut out = Vec::with_capacity(SALT_LEN + payload.len());
    out.extend_from_slice(salt);
    out.extend_from_slice(payload);
    xor_in_place(&mut out[SALT_LEN..], &key);
    out
}

/// Reverse [`obfuscate`]. Datagrams no longer than the salt are returned
/// unchanged.
pub fn deobfuscate(password: &[u8], datagram: &[u8]) -> Vec<u8> {
    let mut buf = datagram.to_vec();
    let n = deobfuscate_in_place(password, &mut buf);
    buf.truncate(n);
    buf
}

/// Decrypt `buf` in place, moving the payload to the front; returns its
/// length.
fn deobfuscate_in_place(password: &[u8], buf: &mut [u8]) -> usize {
    if buf.len() <= SALT_LEN {
        return buf.len();
    }
    let key = keystream(password, &buf[..SALT_LEN]);
    let len = buf.len() - SALT_LEN;
    buf.copy_within(SALT_LEN.., 0);
    xor_in_place(&mut buf[..len], &key);
    len
}

/// [`PacketSocket`] that obfuscates everything it sends and deobfuscates
/// everything it receives
pub struct SalamanderSocket {
    inner: Arc<dyn PacketSocket>,
    password: Vec<u8>,
}

impl SalamanderSocket {
    /// Wrap `inner` with `password`
    pub fn new(inner: Arc<dyn PacketSocket>, password: impl Into<Vec<u8>>) -> Self {
        Self {
            inner,
            password: password.into(),
        }
    }
}

#[async_trait]
impl PacketSocket for SalamanderSocket {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let datagram = obfuscate(&self.password, &salt, buf);
        self.inner.send_to(&datagram, target).await?;
        Ok(buf.len())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut raw = vec![0u8; buf.len() + SALT_LEN];
        let (n, from) = self.inner.recv_from(&mut raw).await?;
        let len = deobfuscate_in_place(&self.password, &mut raw[..n]);
        let len = len.min(buf.len());
        buf[..len].copy_from_slice(&raw[..len]);
        Ok((len, from))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    fn close(&self) {
        self.inner.close();
    }
}
