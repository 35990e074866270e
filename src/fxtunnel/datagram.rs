use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::fxtunnel::protocol::ProtocolError;

/// Largest UDP payload that fits a single IPv4 datagram.
pub const MAX_DATAGRAM_BYTES: usize = 65_507;

/// Datagram framing over a tunnel stream: `u16be len` + `payload`.
///
/// Datagram boundaries must survive the byte-stream transport, so UDP
/// proxying cannot reuse the plain splice path. The pumps run on split stream
/// halves, hence free functions instead of a wrapper type.
pub async fn read_frame_into<R: AsyncRead + Unpin>(
    r: &mut R,
    buf: &mut Vec<u8>,
) -> Result<usize, ProtocolError> {
    let n = r.read_u16().await? as usize;
    if n > MAX_DATAGRAM_BYTES {
        return Err(ProtocolError::FrameTooLarge(n as u32));
    }
    if n > buf.len() {
        buf.resize(n, 0);
    }
    r.read_exact(&mut buf[..n]).await?;
    Ok(n)
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    w: &mut W,
    payload: &[u8],
) -> Result<(), ProtocolError> {
    if payload.len() > MAX_DATAGRAM_BYTES {
        return Err(ProtocolError::FrameTooLarge(payload.len() as u32));
    }
    w.write_u16(payload.len() as u16).await?;
    w.write_all(payload).await?;
    w.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(256 * 1024);

        write_frame(&mut a, b"Q").await.unwrap();
        write_frame(&mut a, &[7u8; 1200]).await.unwrap();

        let mut buf = vec![0u8; 64 * 1024];
        assert_eq!(read_frame_into(&mut b, &mut buf).await.unwrap(), 1);
        assert_eq!(&buf[..1], b"Q");
        assert_eq!(read_frame_into(&mut b, &mut buf).await.unwrap(), 1200);
        assert!(buf[..1200].iter().all(|&b| b == 7));
    }

    #[tokio::test]
    async fn max_size_accepted_one_over_rejected() {
        let (mut a, mut b) = tokio::io::duplex(256 * 1024);

        let max = vec![3u8; MAX_DATAGRAM_BYTES];
        write_frame(&mut a, &max).await.unwrap();
        let mut buf = Vec::new();
        assert_eq!(
            read_frame_into(&mut b, &mut buf).await.unwrap(),
            MAX_DATAGRAM_BYTES
        );

        let over = vec![0u8; MAX_DATAGRAM_BYTES + 1];
        match write_frame(&mut a, &over).await.unwrap_err() {
            ProtocolError::FrameTooLarge(n) => assert_eq!(n as usize, MAX_DATAGRAM_BYTES + 1),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_u16(u16::MAX).await.unwrap();

        let mut buf = Vec::new();
        match read_frame_into(&mut b, &mut buf).await.unwrap_err() {
            ProtocolError::FrameTooLarge(n) => assert_eq!(n, u16::MAX as u32),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
