//! Unix-socket control server: one JSON object per line each way.
//!
//! A connection carries sequential request/response pairs until it
//! closes or sends `subscribe`, which switches it into streaming mode:
//! one status response, then events until the client goes away. A
//! client disconnecting mid-request does not cancel the in-flight
//! operation.

use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use serde::Serialize;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::{info, warn};

use crate::protocol::{Request, Response};
use crate::{Error, Result};

use super::Daemon;

/// Cap on a single request line.
const LINE_LIMIT: usize = 1024 * 1024;

pub struct Server {
    daemon: Arc<Daemon>,
    socket_path: PathBuf,
}

impl Server {
    pub fn new(daemon: Arc<Daemon>, socket_path: impl Into<PathBuf>) -> Self {
        Self {
            daemon,
            socket_path: socket_path.into(),
        }
    }

    /// Bind the control socket and serve until a shutdown signal.
    pub fn listen_and_serve(&self) -> Result<()> {
        let _ = fs::remove_file(&self.socket_path);
        let listener = UnixListener::bind(&self.socket_path)
            .map_err(|e| Error::Internal(format!("listen {}: {e}", self.socket_path.display())))?;
        fs::set_permissions(&self.socket_path, fs::Permissions::from_mode(0o666))?;
        info!(socket = %self.socket_path.display(), "listening");

        self.install_signal_handler()?;

        for conn in listener.incoming() {
            match conn {
                Ok(stream) => {
                    let daemon = Arc::clone(&self.daemon);
                    thread::spawn(move || handle_conn(daemon, stream));
                }
                Err(e) => warn!(error = %e, "accept failed"),
            }
        }
        Ok(())
    }

    /// SIGINT/SIGTERM terminate the daemon: clean up children, unlink
    /// the socket, exit 0.
    fn install_signal_handler(&self) -> Result<()> {
        let daemon = Arc::clone(&self.daemon);
        let socket_path = self.socket_path.clone();
        let mut signals = Signals::new([SIGINT, SIGTERM])?;
        thread::spawn(move || {
            if let Some(signal) = signals.forever().next() {
                info!(signal, "received shutdown signal");
                daemon.shutdown();
                let _ = fs::remove_file(&socket_path);
                std::process::exit(0);
            }
        });
        Ok(())
    }
}

fn handle_conn(daemon: Arc<Daemon>, stream: UnixStream) {
    let Ok(read_half) = stream.try_clone() else {
        return;
    };
    let mut reader = BufReader::new(read_half);
    let mut writer = stream;
    let mut line = String::new();

    loop {
        match read_line_capped(&mut reader, &mut line) {
            Ok(0) => return,
            Ok(_) => {}
            Err(_) => return,
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let req: Request = match serde_json::from_str(trimmed) {
            Ok(req) => req,
            Err(e) => {
                if write_json(&mut writer, &Response::err(format!("invalid json: {e}"))).is_err() {
                    return;
                }
                continue;
            }
        };

        if req.method == "subscribe" {
            handle_subscribe(&daemon, &mut writer);
            return;
        }

        let resp = daemon.handle(&req);
        if write_json(&mut writer, &resp).is_err() {
            return;
        }
    }
}

/// Stream mode: current status first, then one event per line until the
/// client disconnects or the daemon shuts the bus down.
fn handle_subscribe(daemon: &Arc<Daemon>, writer: &mut UnixStream) {
    let (id, rx, status) = daemon.subscribe_with_status();
    if write_json(writer, &Response::ok(status)).is_ok() {
        while let Ok(event) = rx.recv() {
            if write_json(writer, &event).is_err() {
                break;
            }
        }
    }
    daemon.unsubscribe(id);
}

/// `read_line` with a hard cap. An overlong line is a protocol error
/// and tears the connection down.
fn read_line_capped(reader: &mut impl BufRead, line: &mut String) -> io::Result<usize> {
    line.clear();
    let mut total = 0;
    loop {
        let (consumed, done) = {
            let buf = reader.fill_buf()?;
            if buf.is_empty() {
                return Ok(total);
            }
            match buf.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    line.push_str(&String::from_utf8_lossy(&buf[..pos]));
                    (pos + 1, true)
                }
                None => {
                    line.push_str(&String::from_utf8_lossy(buf));
                    (buf.len(), false)
                }
            }
        };
        reader.consume(consumed);
        total += consumed;
        if total > LINE_LIMIT {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "request line exceeds 1 MiB",
            ));
        }
        if done {
            return Ok(total);
        }
    }
}

fn write_json<T: Serialize>(writer: &mut impl Write, value: &T) -> io::Result<()> {
    let mut data = serde_json::to_vec(value)?;
    data.push(b'\n');
    writer.write_all(&data)?;
    writer.flush()
}
