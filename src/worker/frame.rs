//! Length-prefixed framing over the worker socket.
//!
//! One frame is a 4-byte big-endian body length followed by exactly that many
//! bytes. The same framing is used in both directions. Reads are incremental:
//! bytes of a frame that has not fully arrived stay buffered until the rest
//! shows up, so a short read is never mistaken for a message.

use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;

/// Size of the length prefix.
pub const HEADER_LEN: usize = 4;

/// Largest body accepted in either direction (64 MiB).
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Read chunk size (64KB).
const READ_CHUNK: usize = 64 * 1024;

/// Encode one frame: length prefix followed by the body.
pub fn encode_frame(body: &[u8]) -> io::Result<Vec<u8>> {
    if body.len() > MAX_FRAME_LEN {
        return Err(oversized(body.len()));
    }
    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(body);
    Ok(frame)
}

fn oversized(len: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("frame of {} bytes exceeds limit of {} bytes", len, MAX_FRAME_LEN),
    )
}

/// Incremental frame decoder.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    closed: bool,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes received from the channel.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet returned as a frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Whether the peer closed its end.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Pop the next complete frame body, if one is fully buffered.
    pub fn next_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&self.buf[..HEADER_LEN]);
        let len = u32::from_be_bytes(header) as usize;
        if len > MAX_FRAME_LEN {
            return Err(oversized(len));
        }
        if self.buf.len() < HEADER_LEN + len {
            return Ok(None);
        }
        let body = self.buf[HEADER_LEN..HEADER_LEN + len].to_vec();
        self.buf.drain(..HEADER_LEN + len);
        Ok(Some(body))
    }

    /// Read everything currently available from a non-blocking source.
    ///
    /// Stops at `WouldBlock` or EOF; EOF marks the buffer closed.
    pub fn fill_from<R: Read>(&mut self, src: &mut R) -> io::Result<()> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match src.read(&mut chunk) {
                Ok(0) => {
                    self.closed = true;
                    return Ok(());
                }
                Ok(n) => self.push(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }
}

/// One end of a bidirectional framed channel.
///
/// Writes never wait for the peer: a frame the socket cannot take in full is
/// queued and pushed out by later calls to [`flush`](Self::flush) or
/// [`try_recv`](Self::try_recv).
#[derive(Debug)]
pub struct Channel {
    stream: UnixStream,
    inbound: FrameBuffer,
    outbound: Vec<u8>,
    /// Peer stopped accepting writes.
    write_closed: bool,
}

impl Channel {
    /// Create a connected pair of channels (parent end, child end).
    pub fn pair() -> io::Result<(Channel, Channel)> {
        let (a, b) = UnixStream::pair()?;
        Ok((Self::new(a), Self::new(b)))
    }

    pub fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            inbound: FrameBuffer::new(),
            outbound: Vec::new(),
            write_closed: false,
        }
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        self.stream.set_nonblocking(nonblocking)
    }

    /// Whether the peer closed its end and every buffered frame was consumed.
    pub fn is_closed(&self) -> bool {
        self.inbound.is_closed() && self.inbound.pending() == 0
    }

    /// Bytes of a frame that has started to arrive but is not complete.
    pub fn pending_input(&self) -> usize {
        self.inbound.pending()
    }

    /// Bytes queued but not yet accepted by the socket.
    pub fn pending_output(&self) -> usize {
        self.outbound.len()
    }

    pub fn has_pending_output(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Queue one frame and write as much of it as the socket accepts.
    pub fn send(&mut self, body: &[u8]) -> io::Result<()> {
        if self.write_closed {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        let frame = encode_frame(body)?;
        self.outbound.extend_from_slice(&frame);
        self.flush()?;
        Ok(())
    }

    /// Write queued bytes until the socket is full. Returns `true` once the
    /// queue is empty.
    ///
    /// If the peer has gone away the queue is dropped: nobody is left to read it.
    pub fn flush(&mut self) -> io::Result<bool> {
        let mut written = 0;
        while written < self.outbound.len() {
            match (&self.stream).write(&self.outbound[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
                    ) =>
                {
                    self.write_closed = true;
                    self.outbound.clear();
                    return Ok(true);
                }
                Err(e) => {
                    self.outbound.drain(..written);
                    return Err(e);
                }
            }
        }
        self.outbound.drain(..written);
        Ok(self.outbound.is_empty())
    }

    /// Buffer whatever the peer has written so far, without decoding it.
    pub fn fill_inbound(&mut self) -> io::Result<()> {
        if !self.inbound.is_closed() {
            self.inbound.fill_from(&mut &self.stream)?;
        }
        Ok(())
    }

    /// Non-blocking receive of one frame.
    ///
    /// Flushes queued output first. Returns `None` when no complete frame is
    /// available yet. The channel must be in non-blocking mode.
    pub fn try_recv(&mut self) -> io::Result<Option<Vec<u8>>> {
        self.flush()?;
        if let Some(frame) = self.inbound.next_frame()? {
            return Ok(Some(frame));
        }
        self.fill_inbound()?;
        self.inbound.next_frame()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nonblocking_pair() -> (Channel, Channel) {
        let (a, b) = Channel::pair().expect("Failed to create socket pair");
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();
        (a, b)
    }

    #[test]
    fn test_header_is_big_endian_length() {
        let frame = encode_frame(b"hello").unwrap();
        assert_eq!(&frame[..HEADER_LEN], &[0, 0, 0, 5]);
        assert_eq!(&frame[HEADER_LEN..], b"hello");
    }

    #[test]
    fn test_channel_roundtrip() {
        let (mut parent, mut child) = nonblocking_pair();

        parent.send(b"first").unwrap();
        parent.send(b"").unwrap();
        parent.send(b"third").unwrap();

        assert_eq!(child.try_recv().unwrap(), Some(b"first".to_vec()));
        assert_eq!(child.try_recv().unwrap(), Some(Vec::new()));
        assert_eq!(child.try_recv().unwrap(), Some(b"third".to_vec()));
        assert_eq!(child.try_recv().unwrap(), None);
    }

    #[test]
    fn test_partial_frame_is_not_a_message() {
        let mut buffer = FrameBuffer::new();
        let frame = encode_frame(b"payload").unwrap();

        buffer.push(&frame[..2]);
        assert_eq!(buffer.next_frame().unwrap(), None);

        buffer.push(&frame[2..6]);
        assert_eq!(buffer.next_frame().unwrap(), None);

        buffer.push(&frame[6..]);
        assert_eq!(buffer.next_frame().unwrap(), Some(b"payload".to_vec()));
        assert_eq!(buffer.pending(), 0);
    }

    #[test]
    fn test_empty_channel_returns_none() {
        let (_parent, mut child) = nonblocking_pair();
        assert_eq!(child.try_recv().unwrap(), None);
        assert!(!child.is_closed());
    }

    #[test]
    fn test_closed_peer_is_detected() {
        let (mut parent, mut child) = nonblocking_pair();
        parent.send(b"bye").unwrap();
        drop(parent);

        // Buffered data is still delivered before the close is reported
        assert_eq!(child.try_recv().unwrap(), Some(b"bye".to_vec()));
        assert_eq!(child.try_recv().unwrap(), None);
        assert!(child.is_closed());
    }

    #[test]
    fn test_oversized_header_rejected() {
        let mut buffer = FrameBuffer::new();
        buffer.push(&u32::MAX.to_be_bytes());
        let err = buffer.next_frame().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_send_does_not_wait_for_reader() {
        let (mut parent, mut child) = nonblocking_pair();
        let body = vec![0xAB; 1024 * 1024];

        // Nobody reads yet: the frame is queued instead of blocking
        parent.send(&body).unwrap();
        parent.send(b"after").unwrap();
        assert!(parent.has_pending_output());

        let mut received = Vec::new();
        while received.len() < 2 {
            parent.flush().unwrap();
            match child.try_recv().unwrap() {
                Some(frame) => received.push(frame),
                None => std::thread::sleep(std::time::Duration::from_millis(1)),
            }
        }
        assert_eq!(received[0].len(), 1024 * 1024);
        assert_eq!(received[1], b"after".to_vec());
        assert!(!parent.has_pending_output());
    }

    #[test]
    fn test_send_to_closed_peer() {
        let (mut parent, child) = nonblocking_pair();
        drop(child);

        // The first write discovers the closed peer and drops the queue
        parent.send(&vec![0; 1024 * 1024]).unwrap();
        assert_eq!(parent.pending_output(), 0);
        let err = parent.send(b"again").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
