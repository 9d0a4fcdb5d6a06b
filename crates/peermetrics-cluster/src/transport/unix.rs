//! Cross-process transport over Unix stream sockets.
//!
//! Every member listens on `<socket_dir>/<topic>/<index>-<pid>.sock`.
//! Posting connects to every other socket in the topic directory and
//! writes the frame with a 4-byte big-endian length prefix, so a frame is
//! never split or truncated by the kernel. Sockets whose owner has exited
//! are unlinked on the first refused connection.

use std::io::ErrorKind;
use std::os::unix::net::UnixListener as StdListener;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::message::PeerIndex;
use crate::transport::{Incoming, Transport};

/// Largest frame accepted in either direction.
pub const MAX_FRAME: usize = 16 * 1024 * 1024;

pub struct UnixTransport {
    topic: String,
    dir: PathBuf,
    path: PathBuf,
    /// Bound listener, handed to the accept task on subscribe.
    listener: Mutex<Option<StdListener>>,
    closed: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl UnixTransport {
    /// Join `topic` under `socket_dir` as peer `index`.
    pub fn bind(socket_dir: &Path, topic: &str, index: PeerIndex) -> Result<Self, TransportError> {
        let dir = socket_dir.join(topic);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{index}-{}.sock", std::process::id()));
        if path.exists() {
            std::fs::remove_file(&path)?;
        }

        let listener = StdListener::bind(&path)?;
        listener.set_nonblocking(true)?;

        debug!(path = ?path, "unix transport bound");
        Ok(Self {
            topic: topic.to_string(),
            dir,
            path,
            listener: Mutex::new(Some(listener)),
            closed: AtomicBool::new(false),
            reader: Mutex::new(None),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.path
    }

    fn member_sockets(&self) -> Result<Vec<PathBuf>, TransportError> {
        let mut sockets = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path != self.path && path.extension().is_some_and(|ext| ext == "sock") {
                sockets.push(path);
            }
        }
        Ok(sockets)
    }
}

impl Transport for UnixTransport {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn post(&self, frame: Bytes) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        if frame.len() > MAX_FRAME {
            return Err(TransportError::FrameTooLarge {
                len: frame.len(),
                max: MAX_FRAME,
            });
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| TransportError::NoRuntime)?;
        for peer in self.member_sockets()? {
            runtime.spawn(send_frame(peer, frame.clone()));
        }
        Ok(())
    }

    fn subscribe(&self) -> Result<Incoming, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let std_listener = self
            .listener
            .lock()
            .take()
            .ok_or(TransportError::AlreadySubscribed)?;
        let listener = UnixListener::from_std(std_listener)?;

        let (out, incoming) = mpsc::unbounded_channel();
        let path = self.path.clone();
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        tokio::spawn(read_frames(stream, out.clone()));
                    }
                    Err(e) => {
                        warn!(path = ?path, error = %e, "unix transport accept failed");
                        break;
                    }
                }
                if out.is_closed() {
                    break;
                }
            }
        });
        *self.reader.lock() = Some(handle);
        Ok(incoming)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
        self.listener.lock().take();
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!(path = ?self.path, error = %e, "socket already gone");
        }
        debug!(path = ?self.path, "unix transport closed");
    }
}

impl Drop for UnixTransport {
    fn drop(&mut self) {
        self.close();
    }
}

async fn send_frame(peer: PathBuf, frame: Bytes) {
    match write_frame(&peer, &frame).await {
        Ok(()) => {}
        Err(e) if matches!(e.kind(), ErrorKind::ConnectionRefused | ErrorKind::NotFound) => {
            debug!(path = ?peer, "removing stale socket");
            let _ = tokio::fs::remove_file(&peer).await;
        }
        Err(e) => {
            warn!(path = ?peer, error = %e, bytes = frame.len(), "dropping frame");
        }
    }
}

async fn write_frame(peer: &Path, frame: &[u8]) -> std::io::Result<()> {
    let mut stream = UnixStream::connect(peer).await?;
    // Bounded by MAX_FRAME in post.
    stream.write_u32(frame.len() as u32).await?;
    stream.write_all(frame).await?;
    stream.shutdown().await
}

async fn read_frames(mut stream: UnixStream, out: mpsc::UnboundedSender<Bytes>) {
    loop {
        let len = match stream.read_u32().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => {
                debug!(error = %e, "unix transport read failed");
                break;
            }
        };
        if len > MAX_FRAME {
            warn!(len, max = MAX_FRAME, "oversized frame from peer, closing connection");
            break;
        }
        let mut buf = vec![0u8; len];
        if let Err(e) = stream.read_exact(&mut buf).await {
            debug!(error = %e, len, "truncated frame from peer");
            break;
        }
        if out.send(Bytes::from(buf)).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn recv(incoming: &mut Incoming) -> Bytes {
        tokio::time::timeout(Duration::from_secs(2), incoming.recv())
            .await
            .expect("no frame within 2s")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn frames_cross_sockets() {
        let dir = tempfile::tempdir().unwrap();
        let a = UnixTransport::bind(dir.path(), "cluster-test", 1).unwrap();
        // Same pid, so distinct indices keep the paths apart.
        let b = UnixTransport::bind(dir.path(), "cluster-test", 2).unwrap();
        let mut a_in = a.subscribe().unwrap();
        let mut b_in = b.subscribe().unwrap();

        a.post(Bytes::from_static(b"ping")).unwrap();
        assert_eq!(&recv(&mut b_in).await[..], b"ping");

        // b's answer is the next thing a sees, not its own ping.
        b.post(Bytes::from_static(b"pong")).unwrap();
        assert_eq!(&recv(&mut a_in).await[..], b"pong");
    }

    #[tokio::test]
    async fn large_frames_arrive_intact() {
        let dir = tempfile::tempdir().unwrap();
        let a = UnixTransport::bind(dir.path(), "t", 1).unwrap();
        let b = UnixTransport::bind(dir.path(), "t", 2).unwrap();
        let mut b_in = b.subscribe().unwrap();

        let payload: Vec<u8> = (0..4 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
        a.post(Bytes::from(payload.clone())).unwrap();
        let got = recv(&mut b_in).await;
        assert_eq!(got.len(), payload.len());
        assert_eq!(&got[..], &payload[..]);
    }

    #[tokio::test]
    async fn oversized_frame_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let a = UnixTransport::bind(dir.path(), "t", 1).unwrap();
        let err = a.post(Bytes::from(vec![0u8; MAX_FRAME + 1])).unwrap_err();
        assert!(matches!(err, TransportError::FrameTooLarge { len, max } if len == MAX_FRAME + 1 && max == MAX_FRAME));
    }

    #[test]
    fn post_needs_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let a = UnixTransport::bind(dir.path(), "t", 1).unwrap();
        assert!(matches!(a.post(Bytes::new()), Err(TransportError::NoRuntime)));
    }

    #[tokio::test]
    async fn close_unlinks_socket() {
        let dir = tempfile::tempdir().unwrap();
        let a = UnixTransport::bind(dir.path(), "t", 1).unwrap();
        let path = a.socket_path().to_path_buf();
        assert!(path.exists());
        a.close();
        assert!(!path.exists());
        assert!(matches!(a.post(Bytes::new()), Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn stale_sockets_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        let topic_dir = dir.path().join("t");
        std::fs::create_dir_all(&topic_dir).unwrap();
        let stale = topic_dir.join("9-1.sock");
        // Bind then drop: the file stays but nobody listens.
        drop(StdListener::bind(&stale).unwrap());

        let a = UnixTransport::bind(dir.path(), "t", 1).unwrap();
        a.post(Bytes::from_static(b"x")).unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while stale.exists() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("stale socket never removed");
    }

    #[tokio::test]
    async fn second_subscribe_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let a = UnixTransport::bind(dir.path(), "t", 1).unwrap();
        let _incoming = a.subscribe().unwrap();
        assert!(matches!(a.subscribe(), Err(TransportError::AlreadySubscribed)));
    }
}
