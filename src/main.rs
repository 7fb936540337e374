//! The `sheep` daemon: brings the local store up and serves object I/O.

use sheep::ctx::StorageCtx;
use sheep::ring::Node;
use sheep::server;
use sheep::util;
use std::env;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::net::TcpListener;
use std::path::PathBuf;
use std::process::exit;

/// Default replica count for a freshly formatted store.
const DEFAULT_COPIES: usize = 3;
/// Default listen address.
const DEFAULT_ADDR: &str = "127.0.0.1:7000";

/// Prints the command's usage.
fn print_usage() {
    eprintln!("Usage:");
    eprintln!(" sheep [-h]");
    eprintln!(" sheep <store_dir> [addr:port]");
    eprintln!();
    eprintln!("Options:");
    eprintln!(" -h:\t\tprints usage");
    eprintln!(" store_dir:\tthe directory holding objects, epochs, journal and config");
    eprintln!(" addr:port:\tthe address this node binds and announces (default {DEFAULT_ADDR})");
}

/// Writes an error to stderr, then exits.
fn error(msg: impl std::fmt::Display) -> ! {
    eprintln!("sheep: error: {msg}");
    exit(1);
}

fn main() {
    env_logger::init();

    let args: Vec<_> = env::args_os().skip(1).collect();
    let Some(first) = args.first() else {
        print_usage();
        exit(1);
    };
    if first.as_encoded_bytes() == b"-h" {
        print_usage();
        exit(0);
    }

    let (dir, addr) = match &args[..] {
        [dir] => (PathBuf::from(dir), DEFAULT_ADDR.parse().unwrap()),
        [dir, addr] => {
            let addr: SocketAddr = addr
                .to_str()
                .and_then(|a| a.parse().ok())
                .unwrap_or_else(|| error("invalid listen address"));
            (PathBuf::from(dir), addr)
        }
        _ => {
            print_usage();
            exit(1);
        }
    };

    let me = Node {
        addr: addr.ip(),
        port: addr.port(),
        node_idx: 0,
        zone: 0,
    };
    let ctx = StorageCtx::init(&dir, me, DEFAULT_COPIES)
        .unwrap_or_else(|e| error(format_args!("failed to init the store: {e}")));

    // a fresh store: format it and open the first epoch with ourselves as
    // the only member
    if ctx.epoch_log.latest() == 0 {
        ctx.format()
            .unwrap_or_else(|e| error(format_args!("failed to format the store: {e}")));
        ctx.config
            .set_ctime(util::get_timestamp().as_secs())
            .unwrap_or_else(|e| error(format_args!("failed to record ctime: {e}")));
        ctx.config
            .set_copies(DEFAULT_COPIES as u8)
            .unwrap_or_else(|e| error(format_args!("failed to record copies: {e}")));
        ctx.update_epoch(1, vec![me])
            .unwrap_or_else(|e| error(format_args!("failed to open epoch 1: {e}")));
    }

    let bind: SocketAddr = match me.addr {
        IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), me.port),
        IpAddr::V6(v6) => SocketAddr::new(IpAddr::V6(v6), me.port),
    };
    let listener = TcpListener::bind(bind)
        .unwrap_or_else(|e| error(format_args!("failed to bind {bind}: {e}")));
    if let Err(e) = server::listen(ctx, listener) {
        error(format_args!("accept loop failed: {e}"));
    }
}
