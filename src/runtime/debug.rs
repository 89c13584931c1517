use std::io;

use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::unix::pipe;
use tokio::task::JoinHandle;

/// Writer receiving a program's debug output.
pub type DebugLog = Box<dyn AsyncWrite + Send + Unpin>;

/// Copies the program's debug pipe to `log` a line at a time until the
/// write end closes.
pub fn spawn_copier(reader: pipe::Receiver, mut log: DebugLog) -> JoinHandle<io::Result<()>> {
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut line = Vec::new();
        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line).await? == 0 {
                break;
            }
            log.write_all(&line).await?;
            log.flush().await?;
        }
        log.shutdown().await
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tokio::io::AsyncReadExt;

    use super::*;

    #[tokio::test]
    async fn test_copies_until_eof() {
        let (read_end, write_end) = nix::unistd::pipe().unwrap();
        let reader = pipe::Receiver::from_owned_fd(read_end).unwrap();
        let (log_tx, mut log_rx) = tokio::io::duplex(1024);

        let copier = spawn_copier(reader, Box::new(log_tx));

        let mut file = std::fs::File::from(write_end);
        file.write_all(b"first line\nsecond").unwrap();
        drop(file);

        copier.await.unwrap().unwrap();
        let mut out = String::new();
        log_rx.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "first line\nsecond");
    }
}
