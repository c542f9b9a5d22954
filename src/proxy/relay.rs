//! Bidirectional copy between a host-side stream and a tunnel-side stream.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::stack::tcp::VirtTcpStream;

/// Default copy buffer: 32 KiB per direction.
const BUF_SIZE: usize = 32 * 1024;
/// SOCKS5 connection buffers: 256 KiB per direction.
const SOCKS_BUF_SIZE: usize = 256 * 1024;
/// Buffers kept in each pool.
const POOL_MAX: usize = 128;

/// Fixed-size buffer pool to keep relay loops from allocating per
/// connection.
pub struct BufferPool {
    bufs: std::sync::Mutex<Vec<Vec<u8>>>,
    size: usize,
    max: usize,
}

impl BufferPool {
    pub fn new(size: usize, max: usize) -> Self {
        Self {
            bufs: std::sync::Mutex::new(Vec::new()),
            size,
            max,
        }
    }

    pub fn get(&self) -> Vec<u8> {
        if let Ok(mut bufs) = self.bufs.lock() {
            if let Some(buf) = bufs.pop() {
                return buf;
            }
        }
        vec![0u8; self.size]
    }

    pub fn put(&self, buf: Vec<u8>) {
        if buf.capacity() < self.size {
            return;
        }
        if let Ok(mut bufs) = self.bufs.lock() {
            if bufs.len() < self.max {
                bufs.push(buf);
            }
        }
    }
}

pub fn copy_pool() -> &'static BufferPool {
    static POOL: std::sync::OnceLock<BufferPool> = std::sync::OnceLock::new();
    POOL.get_or_init(|| BufferPool::new(BUF_SIZE, POOL_MAX))
}

pub fn socks_pool() -> &'static BufferPool {
    static POOL: std::sync::OnceLock<BufferPool> = std::sync::OnceLock::new();
    POOL.get_or_init(|| BufferPool::new(SOCKS_BUF_SIZE, POOL_MAX / 4))
}

/// Copy both directions between `local` and `remote` until either side
/// ends, then close both. The two unidirectional copies race in a select
/// loop; whichever terminates tears the pairing down, which is what
/// unblocks the other half.
///
/// Returns (local→remote bytes, remote→local bytes).
pub async fn splice<S>(local: S, remote: VirtTcpStream, pool: &'static BufferPool) -> (u64, u64)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut local_read, mut local_write) = tokio::io::split(local);
    let mut buf_up = pool.get();
    let mut buf_down = pool.get();
    let mut upload = 0u64;
    let mut download = 0u64;

    loop {
        tokio::select! {
            // local → remote
            result = local_read.read(&mut buf_up) => {
                let n = match result {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                if remote.write(&buf_up[..n]).await.is_err() {
                    break;
                }
                upload += n as u64;
            }
            // remote → local
            result = remote.read(&mut buf_down) => {
                let n = match result {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                if local_write.write_all(&buf_down[..n]).await.is_err() {
                    break;
                }
                download += n as u64;
            }
        }
    }

    remote.close().await;
    let _ = local_write.shutdown().await;
    pool.put(buf_up);
    pool.put(buf_down);

    debug!(upload = upload, download = download, "splice finished");
    (upload, download)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_recycles_buffers() {
        let pool = BufferPool::new(1024, 2);
        let buf = pool.get();
        assert_eq!(buf.len(), 1024);
        pool.put(buf);
        let again = pool.get();
        assert_eq!(again.len(), 1024);
    }

    #[test]
    fn pool_drops_undersized_buffers() {
        let pool = BufferPool::new(1024, 2);
        pool.put(vec![0u8; 16]);
        // The undersized buffer was not kept; a fresh one is allocated.
        assert_eq!(pool.get().len(), 1024);
    }

    #[test]
    fn pool_bounds_retention() {
        let pool = BufferPool::new(64, 1);
        pool.put(vec![0u8; 64]);
        pool.put(vec![0u8; 64]);
        let _ = pool.get();
        // Only one was retained; this one is fresh but still sized right.
        assert_eq!(pool.get().len(), 64);
    }

    #[test]
    fn global_pools_have_documented_sizes() {
        assert_eq!(copy_pool().get().len(), 32 * 1024);
        assert_eq!(socks_pool().get().len(), 256 * 1024);
    }
}
