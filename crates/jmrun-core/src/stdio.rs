use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

type SharedWriter = Arc<Mutex<Box<dyn AsyncWrite + Unpin + Sync + Send>>>;

/// Destination for one of the engine's output streams
#[derive(Clone, derive_more::From)]
pub enum EngineStdio {
    Out(EngineStdOut),
    Err(EngineStdErr),
}

impl EngineStdio {
    pub fn inner(&self) -> SharedWriter {
        match self {
            EngineStdio::Out(out) => out.inner(),
            EngineStdio::Err(err) => err.inner(),
        }
    }
}

pub struct EngineStdOut(SharedWriter);

impl Clone for EngineStdOut {
    fn clone(&self) -> Self {
        EngineStdOut(self.0.clone())
    }
}

impl EngineStdOut {
    pub fn new(t: Box<dyn AsyncWrite + Unpin + Sync + Send>) -> EngineStdOut {
        EngineStdOut(Arc::new(Mutex::new(t)))
    }

    /// Forward to the host's stdout
    pub fn stdout() -> EngineStdOut {
        Self::new(Box::new(tokio::io::stdout()))
    }

    /// Discard everything
    pub fn sink() -> EngineStdOut {
        Self::new(Box::new(tokio::io::sink()))
    }

    pub fn inner(&self) -> SharedWriter {
        self.0.clone()
    }
}

pub struct EngineStdErr(SharedWriter);

impl Clone for EngineStdErr {
    fn clone(&self) -> Self {
        EngineStdErr(self.0.clone())
    }
}

impl EngineStdErr {
    pub fn new(t: Box<dyn AsyncWrite + Unpin + Sync + Send>) -> EngineStdErr {
        EngineStdErr(Arc::new(Mutex::new(t)))
    }

    /// Forward to the host's stderr
    pub fn stderr() -> EngineStdErr {
        Self::new(Box::new(tokio::io::stderr()))
    }

    pub fn sink() -> EngineStdErr {
        Self::new(Box::new(tokio::io::sink()))
    }

    pub fn inner(&self) -> SharedWriter {
        self.0.clone()
    }
}

/// Copy `reader` into `target` line by line until the stream closes.
///
/// Lines are written whole so output of the two engine streams does not
/// interleave mid-line.
pub fn forward_lines<R>(reader: R, target: impl Into<EngineStdio>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let target = target.into();
    tokio::spawn(async move {
        let writer = target.inner();
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let mut lock = writer.lock().await;
                    if lock.write_all(line.as_bytes()).await.is_err()
                        || lock.write_all(b"\n").await.is_err()
                    {
                        break;
                    }
                    let _ = lock.flush().await;
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(error = %e, "Engine output stream closed with error");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_forward_lines_keeps_order() {
        let (writer, mut reader) = tokio::io::duplex(1024);
        let out = EngineStdOut::new(Box::new(writer));

        let source: &[u8] = b"first\nsecond\nthird";
        forward_lines(source, out.clone()).await.unwrap();
        drop(out);

        let mut captured = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut reader, &mut captured)
            .await
            .unwrap();
        assert_eq!(captured, "first\nsecond\nthird\n");
    }
}
