//! DAP transport: Content-Length framed JSON messages over a byte stream.
//!
//! The proxy holds two connections speaking the same framing: the editor
//! client on an accepted socket and the game's debug server on an outgoing
//! socket. Reading and writing halves are split so a reader thread can block
//! on its socket while the session writes from the event loop.

use crate::tracer::FileTracer;
use anyhow::anyhow;
use serde_json::Value;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;

/// Outbound half of a DAP connection. The session only ever needs to push
/// a finished message; everything else (framing, tracing) lives here.
pub trait MessageSink: Send {
    fn send(&mut self, message: &Value) -> anyhow::Result<()>;
}

pub struct FramedReader<R> {
    reader: R,
    tracer: Option<FileTracer>,
    label: &'static str,
}

impl<R: BufRead> FramedReader<R> {
    pub fn new(reader: R, tracer: Option<FileTracer>, label: &'static str) -> Self {
        Self {
            reader,
            tracer,
            label,
        }
    }

    /// Read a single DAP message (with Content-Length framing).
    pub fn read_message(&mut self) -> anyhow::Result<Value> {
        let mut content_length: Option<usize> = None;
        loop {
            let mut line = String::new();
            let read_n = self.reader.read_line(&mut line)?;
            if read_n == 0 {
                return Err(anyhow!("DAP connection closed"));
            }
            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                break;
            }
            if let Some(v) = line.strip_prefix("Content-Length:") {
                content_length = Some(v.trim().parse()?);
            }
        }

        let len = content_length.ok_or_else(|| anyhow!("Missing Content-Length header"))?;
        let mut buf = vec![0u8; len];
        self.reader.read_exact(&mut buf)?;
        let message: Value = serde_json::from_slice(&buf)?;
        if let Some(tracer) = &self.tracer {
            tracer.wire(self.label, &message);
        }
        Ok(message)
    }
}

pub struct FramedWriter<W> {
    writer: W,
    tracer: Option<FileTracer>,
    label: &'static str,
}

impl<W: Write + Send> FramedWriter<W> {
    pub fn new(writer: W, tracer: Option<FileTracer>, label: &'static str) -> Self {
        Self {
            writer,
            tracer,
            label,
        }
    }

    /// Write a single DAP message (with Content-Length framing).
    pub fn write_message(&mut self, message: &Value) -> anyhow::Result<()> {
        if let Some(tracer) = &self.tracer {
            tracer.wire(self.label, message);
        }
        let payload = serde_json::to_vec(message)?;
        write!(self.writer, "Content-Length: {}\r\n\r\n", payload.len())?;
        self.writer.write_all(&payload)?;
        self.writer.flush()?;
        Ok(())
    }
}

impl<W: Write + Send> MessageSink for FramedWriter<W> {
    fn send(&mut self, message: &Value) -> anyhow::Result<()> {
        self.write_message(message)
    }
}

/// Split a TCP stream into its framed halves. `side` names the peer in
/// trace output ("client" or "server").
pub fn split_tcp(
    stream: &TcpStream,
    tracer: Option<FileTracer>,
    side: &'static str,
) -> anyhow::Result<(FramedReader<BufReader<TcpStream>>, FramedWriter<TcpStream>)> {
    stream.set_nodelay(true)?;
    let read_label = match side {
        "client" => "client ->",
        _ => "server ->",
    };
    let write_label = match side {
        "client" => "-> client",
        _ => "-> server",
    };
    let reader = FramedReader::new(BufReader::new(stream.try_clone()?), tracer.clone(), read_label);
    let writer = FramedWriter::new(stream.try_clone()?, tracer, write_label);
    Ok((reader, writer))
}
