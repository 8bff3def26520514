//! Operator console: a plain stdin command loop. `quit` starts the same
//! shutdown sequence as SIGINT.

use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nms_transport::Endpoint;

use crate::store::LogStore;

const HELP: &str = "\
commands:
  peers        list connected agents
  log [N]      show the last N log records (default 10)
  help         this text
  quit         disconnect agents and stop the server";

/// Run until `quit` or until someone else raises the shutdown flag. Meant
/// for its own thread; stdin reads block and are not interruptible.
pub fn run(endpoint: Endpoint, store: Arc<LogStore>, shutdown: Arc<AtomicBool>) {
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();

    loop {
        print!("nms> ");
        let _ = io::stdout().flush();

        let line = match lines.next() {
            Some(Ok(line)) => line,
            // EOF or a broken terminal: fall back to signal-driven shutdown.
            _ => break,
        };
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        let mut words = line.split_whitespace();
        match words.next() {
            None => {}
            Some("peers") => {
                let peers = endpoint.pool().list_peers();
                if peers.is_empty() {
                    println!("no connected agents");
                }
                for (peer, addr) in peers {
                    match addr {
                        Some(addr) => println!("{peer}\t{addr}"),
                        None => println!("{peer}"),
                    }
                }
            }
            Some("log") => {
                let count = words
                    .next()
                    .and_then(|n| n.parse().ok())
                    .unwrap_or(10usize);
                for record in store.recent(count) {
                    let peer = record.peer.as_deref().unwrap_or("-");
                    println!(
                        "{} {:?} {} {}",
                        record.timestamp.format("%H:%M:%S"),
                        record.kind,
                        peer,
                        record.message
                    );
                }
            }
            Some("help") => println!("{HELP}"),
            Some("quit") | Some("exit") => {
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
            Some(other) => println!("unknown command {other:?}, try `help`"),
        }
    }
}
