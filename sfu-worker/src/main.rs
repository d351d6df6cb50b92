//! The SFU media worker process.
//!
//! A single processing thread owns every router; a feeder thread moves raw
//! bytes from stdin into a channel so the loop can also honour timer
//! deadlines. Control messages are length-prefixed JSON both ways (see
//! `sfu_shared::framing`).
//!
//! Exit codes: 0 on orderly channel closure, 41 on an initialisation error,
//! 42 on a channel protocol violation.

use clap::Parser;
use log::{debug, error, info, trace, LevelFilter};
use sfu_core::channel::{Request, Worker};
use sfu_shared::framing::{frame_message, FrameDecoder};
use std::io::{Read, Write};
use std::sync::mpsc;
use std::time::{Duration, Instant};

const EXIT_OK: i32 = 0;
const EXIT_INIT_ERROR: i32 = 41;
const EXIT_PROTOCOL_VIOLATION: i32 = 42;

/// Poll cadence while no router has a pending deadline.
const IDLE_TICK: Duration = Duration::from_millis(100);

#[derive(Parser, Debug)]
#[command(name = "sfu-worker", about = "SFU media worker")]
struct Args {
    /// Log level: error, warn, info, debug or trace.
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        other => {
            eprintln!("invalid log level: {other}");
            return EXIT_INIT_ERROR;
        }
    };
    if env_logger::Builder::new().filter_level(level).try_init().is_err() {
        eprintln!("logger initialisation failed");
        return EXIT_INIT_ERROR;
    }

    // Feeder thread: raw stdin bytes into the processing loop.
    let (tx, rx) = mpsc::channel::<Vec<u8>>();
    let feeder = std::thread::Builder::new()
        .name("channel-reader".to_string())
        .spawn(move || {
            let mut stdin = std::io::stdin().lock();
            let mut buf = [0u8; 16384];
            loop {
                match stdin.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!("stdin read failed: {e}");
                        break;
                    }
                }
            }
        });
    if feeder.is_err() {
        error!("failed to spawn the channel reader");
        return EXIT_INIT_ERROR;
    }

    info!("sfu-worker running");

    let mut worker = Worker::new();
    let mut decoder = FrameDecoder::new();

    loop {
        let timeout = worker
            .poll_timeout()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
            .unwrap_or(IDLE_TICK);

        match rx.recv_timeout(timeout) {
            Ok(bytes) => {
                decoder.extend_from_slice(&bytes);
                while let Some(frame) = decoder.next_frame() {
                    let request: Request = match serde_json::from_slice(&frame) {
                        Ok(request) => request,
                        Err(e) => {
                            error!("channel protocol violation: {e}");
                            return EXIT_PROTOCOL_VIOLATION;
                        }
                    };
                    debug!("request [id:{}, method:{}]", request.id, request.method);
                    let response = worker.handle_request(Instant::now(), &request);
                    if let Err(code) = write_message(&response) {
                        return code;
                    }
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                info!("channel closed, exiting");
                return EXIT_OK;
            }
        }

        worker.handle_timeout(Instant::now());

        while let Some(notification) = worker.poll_event() {
            if let Err(code) = write_message(&notification) {
                return code;
            }
        }
        // No transport layer lives in this process; outbound packets are
        // handed to the embedder in library use and merely traced here.
        while let Some(packet) = worker.poll_write() {
            trace!("outbound packet for transport {}", packet.transport.0);
        }
    }
}

fn write_message<T: serde::Serialize>(message: &T) -> Result<(), i32> {
    let json = match serde_json::to_vec(message) {
        Ok(json) => json,
        Err(e) => {
            error!("failed to serialize channel message: {e}");
            return Err(EXIT_PROTOCOL_VIOLATION);
        }
    };
    let framed = match frame_message(&json) {
        Ok(framed) => framed,
        Err(e) => {
            error!("failed to frame channel message: {e}");
            return Err(EXIT_PROTOCOL_VIOLATION);
        }
    };

    let mut stdout = std::io::stdout().lock();
    if stdout.write_all(&framed).and_then(|_| stdout.flush()).is_err() {
        error!("channel write failed, exiting");
        return Err(EXIT_OK);
    }
    Ok(())
}
