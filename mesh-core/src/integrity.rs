//! Content hashes shared by every node: ack tokens, dedup hashes, channel hashes.

use sha2::{Digest, Sha256};

/// Pre-shared key of the public channel every node listens on.
pub const PUBLIC_CHANNEL_PSK: [u8; 16] = [
    0x8b, 0x33, 0x87, 0xe9, 0xc5, 0xcd, 0xea, 0x6a, 0xc9, 0xe5, 0xed, 0xba, 0xa1, 0x15, 0xcd, 0x72,
];

fn prefix_u32(digest: &[u8]) -> u32 {
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Token the recipient echoes back to acknowledge a text message.
/// Must stay bit-compatible across nodes.
pub fn ack_token(timestamp: u32, attempt: u8, text: &str, sender_pub_key: &[u8; 32]) -> u32 {
    let mut hasher = Sha256::new();
    hasher.update(timestamp.to_le_bytes());
    hasher.update([attempt & 0x03]);
    hasher.update(text.as_bytes());
    hasher.update(sender_pub_key);
    prefix_u32(&hasher.finalize())
}

/// Dedup hash of a direct message: timestamp, sender, text.
pub fn direct_message_hash(timestamp: u32, sender_pub_key: &[u8; 32], text: &str) -> u32 {
    let mut hasher = Sha256::new();
    hasher.update(timestamp.to_le_bytes());
    hasher.update(sender_pub_key);
    hasher.update(text.as_bytes());
    prefix_u32(&hasher.finalize())
}

/// Dedup hash of a channel message: timestamp, channel, text.
pub fn channel_message_hash(timestamp: u32, channel_hash: u8, text: &str) -> u32 {
    let mut hasher = Sha256::new();
    hasher.update(timestamp.to_le_bytes());
    hasher.update([channel_hash]);
    hasher.update(text.as_bytes());
    prefix_u32(&hasher.finalize())
}

/// One-byte channel identifier derived from the channel secret.
pub fn channel_hash(secret: &[u8]) -> u8 {
    Sha256::digest(secret)[0]
}
