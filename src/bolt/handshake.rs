//! Protocol version negotiation.
//!
//! Before any message flows, client and server agree on a protocol version:
//! the client writes a 4-byte magic preamble followed by exactly four 4-byte
//! version proposals, highest first, and the server answers with the single
//! version it selected (all zeroes when nothing matched).
//!
//! A version is encoded big-endian as `[0, 0, minor, major]`. This driver
//! proposes major 5 only.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::error::{BoltError, BoltResult};

/// Magic preamble opening every Bolt connection.
pub const BOLT_MAGIC: [u8; 4] = [0x60, 0x60, 0xB0, 0x17];

/// Version proposals sent during the handshake, highest first.
pub const PROPOSED_VERSIONS: [BoltVersion; 4] = [
    BoltVersion::new(5, 4),
    BoltVersion::new(5, 2),
    BoltVersion::new(5, 1),
    BoltVersion::new(5, 0),
];

/// Size of the server's handshake reply.
pub const HANDSHAKE_RESPONSE_SIZE: usize = 4;

/// A negotiated protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct BoltVersion {
    /// Major version (fixed at 5 for this driver)
    pub major: u8,
    /// Minor version
    pub minor: u8,
}

impl BoltVersion {
    /// Create a version.
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Wire encoding: `[0, 0, minor, major]`.
    pub fn to_bytes(self) -> [u8; 4] {
        [0, 0, self.minor, self.major]
    }

    /// Parse a wire-encoded version. Returns `None` for the all-zero
    /// "no match" reply.
    pub fn from_bytes(bytes: [u8; 4]) -> Option<Self> {
        let (minor, major) = (bytes[2], bytes[3]);
        if major == 0 && minor == 0 {
            return None;
        }
        Some(Self { major, minor })
    }
}

impl std::fmt::Display for BoltVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Build the 20-byte handshake message (magic + four proposals).
pub fn handshake_request() -> [u8; 20] {
    let mut buf = [0u8; 20];
    buf[0..4].copy_from_slice(&BOLT_MAGIC);
    for (i, version) in PROPOSED_VERSIONS.iter().enumerate() {
        let offset = 4 + i * 4;
        buf[offset..offset + 4].copy_from_slice(&version.to_bytes());
    }
    buf
}

/// Run the handshake over a freshly opened transport.
///
/// Fails when the server selects nothing or answers outside major 5.
pub async fn negotiate<S>(stream: &mut S) -> BoltResult<BoltVersion>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .write_all(&handshake_request())
        .await
        .map_err(|e| BoltError::handshake(format!("write failed: {}", e)))?;
    stream
        .flush()
        .await
        .map_err(|e| BoltError::handshake(format!("flush failed: {}", e)))?;

    let mut reply = [0u8; HANDSHAKE_RESPONSE_SIZE];
    stream
        .read_exact(&mut reply)
        .await
        .map_err(|e| BoltError::handshake(format!("read failed: {}", e)))?;

    let version = BoltVersion::from_bytes(reply)
        .ok_or_else(|| BoltError::handshake("server supports none of the proposed versions"))?;
    if version.major != 5 {
        return Err(BoltError::handshake(format!(
            "server selected unsupported version {}",
            version
        )));
    }
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_roundtrip() {
        let v = BoltVersion::new(5, 3);
        assert_eq!(v.to_bytes(), [0, 0, 3, 5]);
        assert_eq!(BoltVersion::from_bytes([0, 0, 3, 5]), Some(v));
        assert_eq!(BoltVersion::from_bytes([0, 0, 0, 0]), None);
    }

    #[test]
    fn test_handshake_request_layout() {
        let buf = handshake_request();
        assert_eq!(&buf[0..4], &BOLT_MAGIC);
        // First proposal is the highest version
        assert_eq!(&buf[4..8], &[0, 0, 4, 5]);
        // Four proposals, all major 5, descending minors
        let minors: Vec<u8> = (0..4).map(|i| buf[4 + i * 4 + 2]).collect();
        assert_eq!(minors, vec![4, 2, 1, 0]);
        for i in 0..4 {
            assert_eq!(buf[4 + i * 4 + 3], 5);
        }
    }

    #[tokio::test]
    async fn test_negotiate_success() {
        let (mut client, mut server) = tokio::io::duplex(64);

        let server_task = tokio::spawn(async move {
            let mut req = [0u8; 20];
            server.read_exact(&mut req).await.unwrap();
            assert_eq!(&req[0..4], &BOLT_MAGIC);
            server.write_all(&[0, 0, 2, 5]).await.unwrap();
            server
        });

        let version = negotiate(&mut client).await.unwrap();
        assert_eq!(version, BoltVersion::new(5, 2));
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_negotiate_no_match() {
        let (mut client, mut server) = tokio::io::duplex(64);

        tokio::spawn(async move {
            let mut req = [0u8; 20];
            server.read_exact(&mut req).await.unwrap();
            server.write_all(&[0, 0, 0, 0]).await.unwrap();
            // Hold the server end open until the client is done
            let mut sink = [0u8; 1];
            let _ = server.read(&mut sink).await;
        });

        let err = negotiate(&mut client).await.unwrap_err();
        assert!(matches!(err, BoltError::Handshake(_)));
    }

    #[tokio::test]
    async fn test_negotiate_wrong_major() {
        let (mut client, mut server) = tokio::io::duplex(64);

        tokio::spawn(async move {
            let mut req = [0u8; 20];
            server.read_exact(&mut req).await.unwrap();
            server.write_all(&[0, 0, 4, 4]).await.unwrap();
            let mut sink = [0u8; 1];
            let _ = server.read(&mut sink).await;
        });

        let err = negotiate(&mut client).await.unwrap_err();
        assert!(matches!(err, BoltError::Handshake(_)));
    }
}
