use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgressEvent {
    /// Request body bytes handed to the transport.
    RequestBytesTransferred(u64),
    /// Bytes already reported for an attempt that is being replayed.
    RequestBytesReset(u64),
    RetryScheduled { attempt: usize, delay: Duration },
    ClientRequestSucceeded,
    ClientRequestFailed,
}

pub trait ProgressListener: Send + Sync {
    fn progress_changed(&self, event: ProgressEvent);
}

/// Wraps a request body so every read is reported to the listener.
pub(crate) struct ProgressReader<'a, R: ?Sized> {
    inner: &'a mut R,
    listener: Option<&'a Arc<dyn ProgressListener>>,
    transferred: u64,
}

impl<'a, R> ProgressReader<'a, R>
where
    R: Read + ?Sized,
{
    pub(crate) fn new(inner: &'a mut R, listener: Option<&'a Arc<dyn ProgressListener>>) -> Self {
        Self {
            inner,
            listener,
            transferred: 0,
        }
    }

    pub(crate) fn transferred(&self) -> u64 {
        self.transferred
    }
}

impl<R> Read for ProgressReader<'_, R>
where
    R: Read + ?Sized,
{
    fn read(&mut self, buffer: &mut [u8]) -> std::io::Result<usize> {
        let read = self.inner.read(buffer)?;
        if read > 0 {
            self.transferred = self.transferred.saturating_add(read as u64);
            if let Some(listener) = self.listener {
                listener.progress_changed(ProgressEvent::RequestBytesTransferred(read as u64));
            }
        }
        Ok(read)
    }
}
