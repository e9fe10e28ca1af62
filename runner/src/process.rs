use std::{
    io::{self, Read},
    thread::{self, JoinHandle},
};

/// Reads a child's pipe to the end on its own thread.
///
/// Has to be started right after spawning: a child writing more than the pipe
/// buffer holds blocks until someone reads, and would never exit otherwise.
pub(crate) struct PipeReader(Option<JoinHandle<io::Result<String>>>);

impl PipeReader {
    pub(crate) fn spawn<R: Read + Send + 'static>(pipe: Option<R>) -> Self {
        Self(pipe.map(|mut pipe| {
            thread::spawn(move || {
                let mut buffer = String::new();
                pipe.read_to_string(&mut buffer)?;

                Ok(buffer)
            })
        }))
    }

    /// Wait until the pipe is closed and return everything read from it
    pub(crate) fn join(self) -> io::Result<String> {
        match self.0 {
            Some(reader) => reader
                .join()
                .map_err(|_| io::Error::new(io::ErrorKind::Other, "pipe reader panicked"))?,
            None => Ok(String::new()),
        }
    }
}
