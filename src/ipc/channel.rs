// Alarm channel - ordered point-to-point transport between master and worker

use crate::error::{VigilError, Result};
use crate::ipc::protocol::AlarmMessage;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use std::os::unix::io::{FromRawFd, RawFd};
use std::os::unix::net::UnixStream as StdUnixStream;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::net::UnixStream;

/// Environment variable carrying the inherited channel descriptor in workers
pub const CHANNEL_FD_ENV: &str = "VIGIL_CHANNEL_FD";

/// Capacity of the in-memory pipe used by `AlarmChannel::pair`
const DUPLEX_BUFFER_SIZE: usize = 8 * 1024;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Sending half of an alarm channel
pub struct AlarmSender {
    writer: BoxedWriter,
}

impl AlarmSender {
    /// Send one message; messages arrive in the order they were sent
    pub async fn send(&mut self, message: AlarmMessage) -> Result<()> {
        let mut line = message.encode()?;
        line.push('\n');

        self.writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| VigilError::IpcError(format!("Failed to write message: {}", e)))?;

        self.writer
            .flush()
            .await
            .map_err(|e| VigilError::IpcError(format!("Failed to flush channel: {}", e)))?;

        Ok(())
    }
}

/// Receiving half of an alarm channel
pub struct AlarmReceiver {
    lines: Lines<BufReader<BoxedReader>>,
}

impl AlarmReceiver {
    /// Receive the next message.
    ///
    /// Returns `Ok(None)` once the peer has closed its end. A line that does
    /// not decode yields `ProtocolError` and leaves the channel usable.
    pub async fn recv(&mut self) -> Result<Option<AlarmMessage>> {
        loop {
            let line = self
                .lines
                .next_line()
                .await
                .map_err(|e| VigilError::IpcError(format!("Failed to read message: {}", e)))?;

            match line {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => return AlarmMessage::decode(&line).map(Some),
                None => return Ok(None),
            }
        }
    }
}

/// Bidirectional alarm channel over any async byte stream
pub struct AlarmChannel {
    sender: AlarmSender,
    receiver: AlarmReceiver,
}

impl AlarmChannel {
    pub fn new<T>(io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        let reader: BoxedReader = Box::new(reader);

        Self {
            sender: AlarmSender {
                writer: Box::new(writer),
            },
            receiver: AlarmReceiver {
                lines: BufReader::new(reader).lines(),
            },
        }
    }

    /// Two connected in-memory endpoints
    pub fn pair() -> (Self, Self) {
        let (a, b) = tokio::io::duplex(DUPLEX_BUFFER_SIZE);
        (Self::new(a), Self::new(b))
    }

    /// Wrap one end of a Unix socket pair
    pub fn from_std(stream: StdUnixStream) -> Result<Self> {
        stream
            .set_nonblocking(true)
            .map_err(|e| VigilError::IpcError(format!("Failed to configure channel: {}", e)))?;
        let stream = UnixStream::from_std(stream)
            .map_err(|e| VigilError::IpcError(format!("Failed to register channel: {}", e)))?;
        Ok(Self::new(stream))
    }

    /// Open the channel inherited from the master, if this process is a worker
    ///
    /// The environment is left untouched; the descriptor is marked
    /// close-on-exec so processes the worker runs do not inherit it.
    pub fn from_env() -> Result<Option<Self>> {
        let value = match std::env::var(CHANNEL_FD_ENV) {
            Ok(value) => value,
            Err(_) => return Ok(None),
        };

        let fd: RawFd = value.trim().parse().map_err(|e| {
            VigilError::IpcError(format!("Invalid {} value '{}': {}", CHANNEL_FD_ENV, value, e))
        })?;

        fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(|e| {
            VigilError::IpcError(format!("Failed to adopt channel descriptor {}: {}", fd, e))
        })?;

        // SAFETY: the master dup'ed its end of the socket pair onto this
        // descriptor right before exec, and nothing else in the worker owns it.
        let stream = unsafe { StdUnixStream::from_raw_fd(fd) };
        Self::from_std(stream).map(Some)
    }

    pub async fn send(&mut self, message: AlarmMessage) -> Result<()> {
        self.sender.send(message).await
    }

    pub async fn recv(&mut self) -> Result<Option<AlarmMessage>> {
        self.receiver.recv().await
    }

    pub fn into_split(self) -> (AlarmSender, AlarmReceiver) {
        (self.sender, self.receiver)
    }
}

impl std::fmt::Debug for AlarmChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlarmChannel").finish_non_exhaustive()
    }
}
