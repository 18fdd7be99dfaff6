//! Bounded in-memory byte pipe.
//!
//! Connects the archiver (a `Write` producer) to an HTTP body reader on
//! another thread. The bounded queue provides back-pressure: a fast
//! producer blocks once `PIPE_CHUNKS` chunks are in flight. Dropping the
//! writer closes the queue and the reader sees EOF; dropping the reader
//! makes further writes fail, which aborts the producer.

use crossbeam_channel::{bounded, Receiver, Sender};
use std::io::{self, Read, Write};

/// Maximum chunks in flight between the two halves.
const PIPE_CHUNKS: usize = 64;

pub fn bounded_pipe() -> (PipeWriter, PipeReader) {
    let (tx, rx) = bounded(PIPE_CHUNKS);
    (
        PipeWriter { tx },
        PipeReader {
            rx,
            chunk: Vec::new(),
            pos: 0,
        },
    )
}

pub struct PipeWriter {
    tx: Sender<Vec<u8>>,
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader closed"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub struct PipeReader {
    rx: Receiver<Vec<u8>>,
    chunk: Vec<u8>,
    pos: usize,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.chunk.len() {
            match self.rx.recv() {
                Ok(chunk) => {
                    self.chunk = chunk;
                    self.pos = 0;
                }
                // all writers gone: EOF
                Err(_) => return Ok(0),
            }
        }
        let n = (self.chunk.len() - self.pos).min(buf.len());
        buf[..n].copy_from_slice(&self.chunk[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}
